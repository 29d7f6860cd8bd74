//! Orientation-corrected decoding into a canonical RGB raster.
//!
//! Camera JPEGs store pixels in sensor order and record the rotation needed
//! for display in their EXIF orientation tag. Normalizing applies that
//! correction once, so derivatives never need to carry metadata.

use crate::orientation::{read_orientation, Orientation};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use tracing::{debug, warn};

/// Errors that can occur while normalizing an image.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Invalid image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Degenerate orientation transform")]
    Transform,
}

/// Decode `bytes` upright as 8-bit RGB.
///
/// Empty input is "no image" rather than an error. Unreadable orientation
/// metadata is logged and treated as the identity.
pub fn normalize(bytes: &[u8]) -> Result<Option<RgbImage>, NormalizeError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let tag = match read_orientation(bytes) {
        Ok(tag) => tag.unwrap_or(0),
        Err(e) => {
            warn!(error = %e, "Could not get image orientation");
            0
        }
    };
    let orientation = Orientation::from_tag(tag);

    let source = image::load_from_memory(bytes)?.to_rgba8();
    debug!(
        width = source.width(),
        height = source.height(),
        orientation = tag,
        "Image decoded"
    );

    let oriented = if orientation == Orientation::Identity {
        source
    } else {
        apply_orientation(&source, orientation)?
    };

    Ok(Some(rasterize(&oriented)))
}

/// Resample `source` through the transform for `orientation`.
///
/// Each destination pixel centre is mapped back into the source and sampled
/// bilinearly. Pixels that map outside the source stay fully transparent.
pub fn apply_orientation(
    source: &RgbaImage,
    orientation: Orientation,
) -> Result<RgbaImage, NormalizeError> {
    let (width, height) = source.dimensions();
    let (out_width, out_height) = if orientation.swaps_dimensions() {
        (height, width)
    } else {
        (width, height)
    };

    let inverse = orientation
        .transform(width, height)
        .inverse()
        .ok_or(NormalizeError::Transform)?;

    let mut out = RgbaImage::new(out_width, out_height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = inverse.apply(f64::from(x) + 0.5, f64::from(y) + 0.5);
        if let Some(sampled) = sample_bilinear(source, sx - 0.5, sy - 0.5) {
            *pixel = sampled;
        }
    }

    Ok(out)
}

/// Bilinear sample at continuous pixel coordinates (pixel `i` centred on `i`).
fn sample_bilinear(image: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = f64::from(width - 1);
    let max_y = f64::from(height - 1);
    if x < -0.5 || y < -0.5 || x > max_x + 0.5 || y > max_y + 0.5 {
        return None;
    }

    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for (c, channel) in out.iter_mut().enumerate() {
        let top = f64::from(p00[c]) * (1.0 - fx) + f64::from(p10[c]) * fx;
        let bottom = f64::from(p01[c]) * (1.0 - fx) + f64::from(p11[c]) * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        *channel = value.round().clamp(0.0, 255.0) as u8;
    }

    Some(Rgba(out))
}

/// Flatten onto an opaque black background as 3-channel RGB.
fn rasterize(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        if a == u8::MAX {
            return Rgb([r, g, b]);
        }
        let alpha = f64::from(a) / 255.0;
        let blend = |v: u8| (f64::from(v) * alpha).round() as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}
