use anyhow::{Context, Result};
use fast_image_resize as fir;
use image::{RgbaImage, imageops};

/// Size that fits `src` inside a `cap`-sized box while keeping its aspect ratio.
/// Never enlarges.
pub fn fit_within(src_w: u32, src_h: u32, cap: u32) -> (u32, u32) {
    let long = src_w.max(src_h);
    if long <= cap || long == 0 {
        return (src_w.max(1), src_h.max(1));
    }
    let scale = cap as f64 / long as f64;
    let w = (src_w as f64 * scale).round().clamp(1.0, cap as f64);
    let h = (src_h as f64 * scale).round().clamp(1.0, cap as f64);
    (w as u32, h as u32)
}

/// Smallest size covering a `side` x `side` square, aspect ratio preserved.
pub fn cover_square(src_w: u32, src_h: u32, side: u32) -> (u32, u32) {
    let iw = src_w.max(1) as f64;
    let ih = src_h.max(1) as f64;
    let s = side.max(1) as f64;
    let scale = (s / iw).max(s / ih);
    let w = (iw * scale).round().max(s);
    let h = (ih * scale).round().max(s);
    (w as u32, h as u32)
}

pub fn center_offset(inner_w: u32, inner_h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    let ox = outer_w.saturating_sub(inner_w) / 2;
    let oy = outer_h.saturating_sub(inner_h) / 2;
    (ox, oy)
}

pub fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage> {
    if target_w == 0 || target_h == 0 {
        anyhow::bail!("resize dimensions must be positive");
    }
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .context("failed to create source view for resize")?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .context("resize failed")?;
    let buffer = dst_image.into_vec();
    RgbaImage::from_raw(target_w, target_h, buffer)
        .ok_or_else(|| anyhow::anyhow!("failed to construct resized RGBA image"))
}

/// Cover-fit `source` onto a `side` x `side` square, cropping the overflow evenly.
pub fn square_thumbnail(source: &RgbaImage, side: u32) -> Result<RgbaImage> {
    let (cover_w, cover_h) = cover_square(source.width(), source.height(), side);
    let covered = resize_rgba(source, cover_w, cover_h)?;
    let (ox, oy) = center_offset(side, side, cover_w, cover_h);
    Ok(imageops::crop_imm(&covered, ox, oy, side, side).to_image())
}
