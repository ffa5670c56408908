//! Turns an uploaded file into the two assets the library stores.
//!
//! Everything here is synchronous CPU work; callers run it on the blocking pool.

use tracing::debug;

use crate::config::EncodingOptions;
use crate::error::Error;
use crate::processing::encode::{FormatFamily, encode};
use crate::processing::orientation::{decode_oriented, read_dimensions};
use crate::processing::resize::{fit_within, resize_rgba, square_thumbnail};

#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub min_long_side: u32,
    pub display_cap: u32,
    pub thumbnail_size: u32,
    pub encoding: EncodingOptions,
}

#[derive(Debug)]
pub struct PreparedUpload {
    pub original: Vec<u8>,
    pub thumb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// False when `original` is the uploaded bytes unchanged.
    pub reencoded: bool,
}

pub fn prepare_upload(
    bytes: &[u8],
    name: &str,
    limits: &IngestLimits,
) -> Result<PreparedUpload, Error> {
    let (width, height) = read_dimensions(bytes).map_err(Error::Transform)?;
    let long_side = width.max(height);
    if long_side < limits.min_long_side {
        return Err(Error::ResolutionTooLow {
            long_side,
            minimum: limits.min_long_side,
        });
    }

    let family = FormatFamily::from_name(name);
    let oriented = decode_oriented(bytes).map_err(Error::Transform)?;
    let (ow, oh) = oriented.pixels.dimensions();
    let (tw, th) = if family.downscales() {
        fit_within(ow, oh, limits.display_cap)
    } else {
        (ow, oh)
    };
    let downscaled = (tw, th) != (ow, oh);
    let pixels = if downscaled {
        resize_rgba(&oriented.pixels, tw, th).map_err(Error::Transform)?
    } else {
        oriented.pixels
    };

    let reencoded = downscaled || oriented.reoriented;
    let original = if reencoded {
        encode(&pixels, family, oriented.format, &limits.encoding).map_err(Error::Transform)?
    } else {
        bytes.to_vec()
    };

    let thumb = square_thumbnail(&pixels, limits.thumbnail_size).map_err(Error::Transform)?;
    let thumb = encode(&thumb, family, oriented.format, &limits.encoding)
        .map_err(Error::Transform)?;

    debug!(
        name,
        ?family,
        source = ?(width, height),
        stored = ?(tw, th),
        reencoded,
        "prepared upload"
    );
    Ok(PreparedUpload {
        original,
        thumb,
        width: tw,
        height: th,
        reencoded,
    })
}
