use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use image::codecs::png::CompressionType;
use serde::Deserialize;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Address the HTTP/WebSocket server listens on.
    pub bind_address: SocketAddr,
    /// Directory holding the `originals/` and `thumbs/` asset folders.
    pub image_root: PathBuf,
    /// URL prefix under which the asset folders are published.
    pub public_image_prefix: String,
    /// JSON settings document shared with the admin console.
    pub settings_path: PathBuf,
    /// Edge length of the square thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// Outbound messages buffered per viewer before it is dropped as too slow.
    pub viewer_queue_depth: usize,
    /// Upper bound on a single upload request body, in bytes.
    pub max_upload_bytes: usize,
    /// Re-encoding knobs per image format family.
    pub encoding: EncodingOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            image_root: PathBuf::from("public/images"),
            public_image_prefix: "/images".to_string(),
            settings_path: PathBuf::from("config/config.json"),
            thumbnail_size: 320,
            viewer_queue_depth: 32,
            max_upload_bytes: 64 * 1024 * 1024,
            encoding: EncodingOptions::default(),
        }
    }
}

impl Configuration {
    fn default_bind_address() -> SocketAddr {
        DEFAULT_BIND_ADDRESS
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.thumbnail_size > 0,
            "thumbnail-size must be greater than zero"
        );
        ensure!(
            self.viewer_queue_depth > 0,
            "viewer-queue-depth must be greater than zero"
        );
        ensure!(
            self.max_upload_bytes > 0,
            "max-upload-bytes must be greater than zero"
        );
        ensure!(
            self.public_image_prefix.starts_with('/'),
            "public-image-prefix must start with '/'"
        );
        ensure!(
            !self.image_root.as_os_str().is_empty(),
            "image-root must not be empty"
        );
        ensure!(
            self.settings_path.file_name().is_some(),
            "settings-path must include a file name"
        );
        self.encoding
            .validate()
            .context("invalid encoding configuration")?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct EncodingOptions {
    /// JPEG quality, 1 (smallest) to 100 (best).
    pub jpeg_quality: u8,
    /// PNG deflate effort.
    pub png_compression: PngCompression,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            png_compression: PngCompression::Default,
        }
    }
}

impl EncodingOptions {
    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=100).contains(&self.jpeg_quality),
            "encoding.jpeg-quality must be between 1 and 100"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PngCompression {
    Fast,
    #[default]
    Default,
    Best,
}

impl From<PngCompression> for CompressionType {
    fn from(value: PngCompression) -> Self {
        match value {
            PngCompression::Fast => CompressionType::Fast,
            PngCompression::Default => CompressionType::Default,
            PngCompression::Best => CompressionType::Best,
        }
    }
}
