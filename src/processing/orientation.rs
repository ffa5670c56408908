use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, ImageReader, RgbaImage, imageops};
use tracing::debug;

/// Decoded upload with EXIF orientation already applied.
pub struct OrientedImage {
    pub pixels: RgbaImage,
    pub format: Option<ImageFormat>,
    /// True when the stored orientation required flipping or rotating.
    pub reoriented: bool,
}

/// Pixel dimensions as stored, before any orientation is applied.
pub fn read_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image format")?
        .into_dimensions()
        .context("failed to read image dimensions")
}

pub fn decode_oriented(bytes: &[u8]) -> Result<OrientedImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image format")?;
    let format = reader.format();
    let img = reader.decode().context("failed to decode image")?.to_rgba8();

    let orientation = read_orientation(bytes).unwrap_or(1);
    let (pixels, reoriented) = apply_orientation(img, orientation);
    Ok(OrientedImage {
        pixels,
        format,
        reoriented,
    })
}

fn read_orientation(bytes: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let value = field.value.get_uint(0)? as u16;
    debug!(orientation = value, "exif orientation");
    Some(value)
}

// Unknown values leave the image as stored.
fn apply_orientation(img: RgbaImage, orientation: u16) -> (RgbaImage, bool) {
    let oriented = match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        // transpose
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        // transverse
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => return (img, false),
    };
    (oriented, true)
}
