//! Pixel statistics and resampling shared by the framing evaluator, the
//! steadiness gate and the interpreter.

use image::{
    GrayImage, ImageResult, Rgb, RgbImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use rdt_ml_core::{BoundingBox, Rotation};

/// Integer pixel rectangle `(x, y, width, height)` covering `bbox`, clipped to
/// the image. `None` when nothing of the box lies inside.
pub fn pixel_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let left = bbox.left.floor().max(0.0) as u32;
    let top = bbox.top.floor().max(0.0) as u32;
    let right = (bbox.right.ceil().max(0.0) as u32).min(width);
    let bottom = (bbox.bottom.ceil().max(0.0) as u32).min(height);
    (right > left && bottom > top).then(|| (left, top, right - left, bottom - top))
}

pub fn crop_rgb(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = pixel_rect(bbox, image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

pub fn crop_luma(image: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let (x, y, w, h) = pixel_rect(bbox, image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Apply a quarter-turn sensor rotation.
pub fn rotate_quarter(image: &RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::None => image.clone(),
        Rotation::Cw90 => imageops::rotate90(image),
        Rotation::Cw180 => imageops::rotate180(image),
        Rotation::Cw270 => imageops::rotate270(image),
    }
}

pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Down-sampled luma used to compare consecutive frames cheaply.
pub fn signature(luma: &GrayImage, size: u32) -> GrayImage {
    imageops::resize(luma, size, size, FilterType::Triangle)
}

/// Mean absolute per-pixel difference of two equally sized luma images.
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> Option<f32> {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return None;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    Some(total as f32 / a.as_raw().len() as f32)
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
pub fn laplacian_variance(image: &GrayImage) -> f32 {
    let (w, h) = image.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| image.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x, y - 1) + px(x, y + 1) + px(x - 1, y) + px(x + 1, y) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0) as f32
}

pub fn histogram(image: &GrayImage) -> [u32; 256] {
    let mut bins = [0u32; 256];
    for &v in image.as_raw() {
        bins[v as usize] += 1;
    }
    bins
}

/// Fractions of pixels at or below `dark` and at or above `bright`.
pub fn clip_fractions(image: &GrayImage, dark: u8, bright: u8) -> (f32, f32) {
    let bins = histogram(image);
    let total = image.as_raw().len();
    if total == 0 {
        return (0.0, 0.0);
    }
    let low: u32 = bins[..=dark as usize].iter().sum();
    let high: u32 = bins[bright as usize..].iter().sum();
    (low as f32 / total as f32, high as f32 / total as f32)
}

/// Tilt of the bright region's long axis from vertical, in degrees within
/// `(-90, 90]`, positive when the top leans right.
///
/// Uses second-order central moments of pixels brighter than the mean.
/// Returns `None` when the region is too round to have a defined long axis.
pub fn principal_tilt(image: &GrayImage) -> Option<f64> {
    let raw = image.as_raw();
    if raw.is_empty() {
        return None;
    }
    let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / raw.len() as f64;

    let (mut n, mut sx, mut sy) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y, p) in image.enumerate_pixels() {
        if p.0[0] as f64 > mean {
            n += 1.0;
            sx += x as f64;
            sy += y as f64;
        }
    }
    if n < 3.0 {
        return None;
    }
    let (cx, cy) = (sx / n, sy / n);

    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y, p) in image.enumerate_pixels() {
        if p.0[0] as f64 > mean {
            let (dx, dy) = (x as f64 - cx, y as f64 - cy);
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
    }

    let half_sum = (mu20 + mu02) / 2.0;
    let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
    let (major, minor) = (half_sum + spread, half_sum - spread);
    if major <= 0.0 || major < 1.5 * minor {
        return None;
    }

    let theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02).to_degrees();
    let tilt = if theta > 0.0 { theta - 90.0 } else { theta + 90.0 };
    Some(if tilt <= -90.0 { tilt + 180.0 } else { tilt })
}

/// Mean luma of `bands` equal slices along the image's long axis, sampled over
/// the central half of the short axis.
pub fn band_means(image: &GrayImage, bands: u32) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let vertical = h >= w;
    let (long, short) = if vertical { (h, w) } else { (w, h) };
    let bands = bands.min(long).max(1);
    let (lo, hi) = (short / 4, (3 * short / 4).max(short / 4 + 1).min(short));

    (0..bands)
        .map(|band| {
            let start = band * long / bands;
            let end = ((band + 1) * long / bands).max(start + 1);
            let (mut sum, mut count) = (0u64, 0u64);
            for along in start..end {
                for across in lo..hi {
                    let (x, y) = if vertical { (across, along) } else { (along, across) };
                    sum += image.get_pixel(x, y).0[0] as u64;
                    count += 1;
                }
            }
            if count == 0 { 0.0 } else { sum as f32 / count as f32 }
        })
        .collect()
}

/// Rotate about the image centre, clockwise on screen, with bilinear sampling.
/// The canvas keeps its size; uncovered pixels are black.
pub fn rotate_about_center(image: &RgbImage, degrees: f64) -> RgbImage {
    if degrees.abs() < 1e-3 {
        return image.clone();
    }
    let (w, h) = image.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (cx, cy) = ((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);

    RgbImage::from_fn(w, h, |x, y| {
        let (dx, dy) = (x as f64 - cx, y as f64 - cy);
        let sx = cx + dx * cos + dy * sin;
        let sy = cy - dx * sin + dy * cos;
        sample_bilinear(image, sx, sy).unwrap_or(Rgb([0, 0, 0]))
    })
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let p = |px: u32, py: u32| image.get_pixel(px, py).0[c] as f64;
        let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
        let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
        *slot = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}
