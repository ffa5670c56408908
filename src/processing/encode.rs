use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, RgbaImage};

use crate::config::EncodingOptions;

/// Encoder family chosen from the stored file name's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// Lossy, tuned with a quality knob.
    Jpeg,
    /// Lossless, tuned with a compression level.
    Png,
    WebP,
    /// Stored as uploaded unless its pixels had to change.
    Passthrough,
}

impl FormatFamily {
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg" | "jpeg") => Self::Jpeg,
            Some("png") => Self::Png,
            Some("webp") => Self::WebP,
            _ => Self::Passthrough,
        }
    }

    /// Whether oversized uploads of this family are downscaled to the display cap.
    pub fn downscales(self) -> bool {
        !matches!(self, Self::Passthrough)
    }
}

/// Encode `img` for `family`. Passthrough images are written in `source`
/// format, falling back to JPEG when the source format is unknown.
pub fn encode(
    img: &RgbaImage,
    family: FormatFamily,
    source: Option<ImageFormat>,
    options: &EncodingOptions,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match family {
        FormatFamily::Jpeg => encode_jpeg(img, options.jpeg_quality, &mut out)?,
        FormatFamily::Png => {
            PngEncoder::new_with_quality(
                &mut out,
                options.png_compression.into(),
                FilterType::Adaptive,
            )
            .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgba8)
            .context("png encode failed")?;
        }
        FormatFamily::WebP => {
            WebPEncoder::new_lossless(&mut out)
                .encode(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgba8)
                .context("webp encode failed")?;
        }
        FormatFamily::Passthrough => match source {
            Some(ImageFormat::Jpeg) | None => encode_jpeg(img, options.jpeg_quality, &mut out)?,
            Some(format) => {
                DynamicImage::ImageRgba8(img.clone())
                    .write_to(&mut Cursor::new(&mut out), format)
                    .map_err(|err| anyhow!("{format:?} encode failed: {err}"))?;
            }
        },
    }
    Ok(out)
}

// JPEG has no alpha channel; flatten to RGB first.
fn encode_jpeg(img: &RgbaImage, quality: u8, out: &mut Vec<u8>) -> Result<()> {
    let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
    JpegEncoder::new_with_quality(out, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .context("jpeg encode failed")
}
