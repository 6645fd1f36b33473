//! Cover image post-processing.
//!
//! Catalog thumbnails are usually letterboxed: a centered subject framed by
//! flat bars. The crop walks the two center lines from the border inwards
//! and stops at the first pixel pair whose colors differ in every channel.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};

use crate::error::TaskError;

/// Side of the synthesized placeholder.
pub const PLACEHOLDER_SIDE: u32 = 350;
const PLACEHOLDER_DISC: Rgb<u8> = Rgb([255, 99, 71]);
const PLACEHOLDER_FIELD: Rgb<u8> = Rgb([34, 139, 87]);

fn differs(a: [u8; 4], b: [u8; 4]) -> bool {
    a[0] != b[0] && a[1] != b[1] && a[2] != b[2]
}

/// Distance from the border to the first discontinuity along one line.
/// `at(i)` reads the i-th pixel counted from that border.
fn margin(len: u32, at: impl Fn(u32) -> [u8; 4]) -> u32 {
    (0..len.saturating_sub(1))
        .find(|&i| differs(at(i), at(i + 1)))
        .map_or(0, |i| i + 1)
}

/// Crop equal margins off opposite sides, as much as the narrower bar on
/// each axis allows.
pub fn crop_to_subject(img: &DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return img.clone();
    }
    let (cx, cy) = (w / 2, h / 2);
    let px = |x: u32, y: u32| img.get_pixel(x, y).0;

    let left = margin(w, |i| px(i, cy));
    let right = margin(w, |i| px(w - 1 - i, cy));
    let top = margin(h, |i| px(cx, i));
    let bottom = margin(h, |i| px(cx, h - 1 - i));

    let mx = left.min(right);
    let my = top.min(bottom);
    if 2 * mx >= w || 2 * my >= h {
        return img.clone();
    }
    img.crop_imm(mx, my, w - 2 * mx, h - 2 * my)
}

/// A disc on a plain field, always the same.
pub fn placeholder() -> DynamicImage {
    let side = PLACEHOLDER_SIDE;
    let r = (side / 2) as f64;
    let img = RgbImage::from_fn(side, side, |x, y| {
        let dx = x as f64 - r + 0.5;
        let dy = y as f64 - r + 0.5;
        if dx * dx + dy * dy < r * r {
            PLACEHOLDER_DISC
        } else {
            PLACEHOLDER_FIELD
        }
    });
    DynamicImage::ImageRgb8(img)
}

pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, TaskError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

/// Turn downloaded thumbnail bytes into the JPEG that gets stored. Bytes that
/// do not decode (an HTML error page, an empty body) become the placeholder.
pub fn process(bytes: &[u8]) -> Result<(Vec<u8>, bool), TaskError> {
    match image::load_from_memory(bytes) {
        Ok(img) => Ok((encode_jpeg(&crop_to_subject(&img))?, false)),
        Err(_) => Ok((encode_jpeg(&placeholder())?, true)),
    }
}
