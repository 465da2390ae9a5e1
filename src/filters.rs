//! Primitive per-image operations.
//!
//! Every function here is pure: it reads its inputs and returns a new image
//! or value. Grayscale conversion uses the BT.601 luma weights
//! (`0.299*R + 0.587*G + 0.114*B`) so that thresholds tuned against
//! OpenCV-style pipelines carry over unchanged.

use std::collections::VecDeque;
use std::path::Path;

use image::error::{DecodingError, ImageFormatHint};
use image::{GrayImage, ImageError, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::point::Point;
use imageproc::rect::Rect;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{FftDirection, FftPlanner};

use crate::error::{Error, Result};

/// Denominator floor below which a correlation window is treated as flat.
const FLAT_EPSILON: f64 = 1e-10;

/// Window energy below which an image window is treated as flat. Integer
/// pixels give any non-flat window an energy of at least `(n - 1) / n`.
const MIN_WINDOW_ENERGY: f64 = 0.5;

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels, strictly positive for boxes produced by this crate.
    pub width: u32,
    /// Height in pixels, strictly positive for boxes produced by this crate.
    pub height: u32,
}

impl BoundingBox {
    /// Create a new bounding box.
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the box lies fully inside an image of the given size.
    #[must_use]
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn to_rect(self) -> Rect {
        Rect::at(self.x as i32, self.y as i32).of_size(self.width, self.height)
    }
}

/// Best location found by [`match_template`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    /// Zero-mean normalized cross-correlation in `[-1, 1]`.
    pub score: f32,
    /// Top-left corner of the best match.
    pub location: (u32, u32),
}

/// Decode an image file into a 3-channel color buffer.
///
/// # Errors
///
/// Returns [`Error::ImageDecode`] if the file is unreadable, corrupt, or
/// decodes to an empty (zero-area) image.
pub fn decode_image(path: &Path) -> Result<RgbImage> {
    let decoded = image::open(path).map_err(|source| Error::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    let rgb = decoded.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(Error::ImageDecode {
            path: path.to_path_buf(),
            source: ImageError::Decoding(DecodingError::new(
                ImageFormatHint::Unknown,
                "image has zero area",
            )),
        });
    }
    Ok(rgb)
}

/// Convert a color image to 8-bit grayscale.
#[must_use]
pub fn to_grayscale(img: &RgbImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let px = img.get_pixel(x, y);
        let lum = 0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = lum.round().clamp(0.0, 255.0) as u8;
        Luma([value])
    })
}

/// Binarize a grayscale image: pixels `>= threshold` become 255, others 0.
#[must_use]
pub fn binarize(img: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y)[0] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Canny edge map of a grayscale image.
#[must_use]
pub fn detect_edges(img: &GrayImage, low_threshold: f32, high_threshold: f32) -> GrayImage {
    imageproc::edges::canny(img, low_threshold, high_threshold)
}

/// Grow foreground regions by `radius` pixels (chessboard distance).
#[must_use]
pub fn dilate(img: &GrayImage, radius: u8) -> GrayImage {
    imageproc::morphology::dilate(img, Norm::LInf, radius)
}

/// Outermost contours of the foreground (non-zero) regions of a binary image.
///
/// Holes and regions nested inside other regions are not returned. The order
/// follows the raster scan of the border-following algorithm.
#[must_use]
pub fn find_external_contours(binary: &GrayImage) -> Vec<Vec<Point<u32>>> {
    find_contours::<u32>(binary)
        .into_iter()
        .filter(|c| c.parent.is_none() && c.border_type == BorderType::Outer)
        .map(|c| c.points)
        .collect()
}

/// Minimal axis-aligned box enclosing every point of a polygon.
///
/// Returns `None` for an empty polygon.
#[must_use]
pub fn bounding_rect(polygon: &[Point<u32>]) -> Option<BoundingBox> {
    let first = polygon.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &polygon[1..] {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(BoundingBox::new(
        min_x,
        min_y,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

/// Locate the best match of `template` inside `image`.
///
/// Scores are zero-mean normalized cross-correlation:
/// `sum(t'*i') / sqrt(sum(t'^2) * sum(i'^2))` where `'` denotes subtraction of
/// the mean over the window. Flat windows score 0. The numerators come from a
/// single frequency-domain correlation and the window energies from integral
/// images, so the cost is independent of the template size. Ties resolve to
/// the first location in raster order.
///
/// # Errors
///
/// Returns [`Error::TemplateTooLarge`] if the template does not fit in the
/// image, or [`Error::InvalidConfiguration`] if the template is empty.
pub fn match_template(image: &GrayImage, template: &GrayImage) -> Result<TemplateMatch> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 {
        return Err(Error::InvalidConfiguration(
            "template image is empty".to_string(),
        ));
    }
    if tw > iw || th > ih {
        return Err(Error::TemplateTooLarge { tw, th, iw, ih });
    }

    let n = f64::from(tw) * f64::from(th);
    let t_mean = template.pixels().map(|p| f64::from(p[0])).sum::<f64>() / n;
    let t_centered: Vec<f64> = template.pixels().map(|p| f64::from(p[0]) - t_mean).collect();
    let t_energy: f64 = t_centered.iter().map(|v| v * v).sum();

    let integral = IntegralImages::new(image);
    let numerators = cross_correlate(image, &t_centered, tw, th);
    let stride = iw as usize;
    let out_w = iw - tw + 1;
    let out_h = ih - th + 1;

    let best_per_row: Vec<(f64, u32)> = (0..out_h)
        .into_par_iter()
        .map(|y| {
            let row = &numerators[y as usize * stride..];
            let mut best = (f64::NEG_INFINITY, 0);
            for x in 0..out_w {
                let (sum, sum_sq) = integral.window(x, y, tw, th);
                let window_energy = sum_sq - sum * sum / n;
                let denom = (t_energy * window_energy).sqrt();
                let score = if window_energy < MIN_WINDOW_ENERGY || denom < FLAT_EPSILON {
                    0.0
                } else {
                    row[x as usize] / denom
                };
                if score > best.0 {
                    best = (score, x);
                }
            }
            best
        })
        .collect();

    let mut best = TemplateMatch {
        score: f32::NEG_INFINITY,
        location: (0, 0),
    };
    for (y, (score, x)) in (0u32..).zip(best_per_row) {
        #[allow(clippy::cast_possible_truncation)]
        let score = score.clamp(-1.0, 1.0) as f32;
        if score > best.score {
            best = TemplateMatch {
                score,
                location: (x, y),
            };
        }
    }
    Ok(best)
}

/// Single-channel mask of the given size: 0 everywhere, 255 inside `region`.
#[must_use]
pub fn rect_mask(width: u32, height: u32, region: BoundingBox) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    draw_filled_rect_mut(&mut mask, region.to_rect(), Luma([255]));
    mask
}

/// Fill every masked (non-zero) pixel from known neighbours within `radius`.
///
/// Pixels are restored in order of distance from the mask boundary, so each
/// pixel sees the ones filled before it as known. Each restored value is the
/// inverse-squared-distance weighted mean of known pixels inside the disc of
/// `radius` (minimum 1). A fully masked image is returned unchanged.
///
/// # Panics
///
/// Panics if `mask` and `image` differ in size.
#[must_use]
pub fn inpaint(image: &RgbImage, mask: &GrayImage, radius: u32) -> RgbImage {
    assert_eq!(
        image.dimensions(),
        mask.dimensions(),
        "inpaint mask must match image size"
    );

    let (w, h) = image.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let mut out = image.clone();
    let mut known: Vec<bool> = mask.pixels().map(|p| p[0] == 0).collect();
    let mut queued = vec![false; wu * hu];
    let mut queue = VecDeque::new();

    for y in 0..hu {
        for x in 0..wu {
            let idx = y * wu + x;
            if !known[idx] && neighbours(x, y, wu, hu).any(|n| known[n]) {
                queued[idx] = true;
                queue.push_back(idx);
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    let (r, wi, hi) = (i64::from(radius.max(1)), wu as i64, hu as i64);
    while let Some(idx) = queue.pop_front() {
        let (x, y) = (idx % wu, idx / wu);
        let mut acc = [0.0_f64; 3];
        let mut total = 0.0_f64;
        for dy in -r..=r {
            for dx in -r..=r {
                let d2 = dx * dx + dy * dy;
                if d2 == 0 || d2 > r * r {
                    continue;
                }
                #[allow(clippy::cast_possible_wrap)]
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let (nx, ny) = (nx as usize, ny as usize);
                if !known[ny * wu + nx] {
                    continue;
                }
                #[allow(clippy::cast_precision_loss)]
                let weight = 1.0 / d2 as f64;
                #[allow(clippy::cast_possible_truncation)]
                let px = out.get_pixel(nx as u32, ny as u32);
                for ch in 0..3 {
                    acc[ch] += weight * f64::from(px[ch]);
                }
                total += weight;
            }
        }

        if total > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let filled = Rgb([
                (acc[0] / total).round().clamp(0.0, 255.0) as u8,
                (acc[1] / total).round().clamp(0.0, 255.0) as u8,
                (acc[2] / total).round().clamp(0.0, 255.0) as u8,
            ]);
            #[allow(clippy::cast_possible_truncation)]
            out.put_pixel(x as u32, y as u32, filled);
        }
        known[idx] = true;

        for n in neighbours(x, y, wu, hu) {
            if !known[n] && !queued[n] {
                queued[n] = true;
                queue.push_back(n);
            }
        }
    }

    out
}

/// Linear indices of the 4-connected neighbours of `(x, y)`.
fn neighbours(x: usize, y: usize, w: usize, h: usize) -> impl Iterator<Item = usize> {
    let left = (x > 0).then(|| y * w + x - 1);
    let right = (x + 1 < w).then(|| y * w + x + 1);
    let up = (y > 0).then(|| (y - 1) * w + x);
    let down = (y + 1 < h).then(|| (y + 1) * w + x);
    [left, right, up, down].into_iter().flatten()
}

/// Circular cross-correlation of `image` with a `tw x th` kernel, computed in
/// the frequency domain.
///
/// Entry `y * width + x` holds `sum(kernel[dy][dx] * image[y + dy][x + dx])`.
/// Offsets where the kernel fits inside the image never wrap, so those
/// entries equal the direct sum.
fn cross_correlate(image: &GrayImage, kernel: &[f64], tw: u32, th: u32) -> Vec<f64> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut signal: Vec<Complex<f64>> = image
        .pixels()
        .map(|p| Complex::new(f64::from(p[0]), 0.0))
        .collect();
    let mut filter = vec![Complex::new(0.0, 0.0); w * h];
    for (dy, row) in kernel.chunks(tw as usize).take(th as usize).enumerate() {
        for (dx, &v) in row.iter().enumerate() {
            filter[dy * w + dx].re = v;
        }
    }

    let mut planner = FftPlanner::new();
    fft_2d(&mut planner, &mut signal, w, h, FftDirection::Forward);
    fft_2d(&mut planner, &mut filter, w, h, FftDirection::Forward);
    signal
        .par_iter_mut()
        .zip(filter.par_iter())
        .for_each(|(s, f)| *s *= f.conj());
    fft_2d(&mut planner, &mut signal, w, h, FftDirection::Inverse);

    #[allow(clippy::cast_precision_loss)]
    let scale = (w * h) as f64;
    signal.into_iter().map(|c| c.re / scale).collect()
}

/// In-place unnormalized 2-D FFT of a row-major `w x h` buffer.
fn fft_2d(
    planner: &mut FftPlanner<f64>,
    buf: &mut [Complex<f64>],
    w: usize,
    h: usize,
    direction: FftDirection,
) {
    let rows = planner.plan_fft(w, direction);
    buf.par_chunks_mut(w).for_each(|row| rows.process(row));

    let mut columns = transpose(buf, w, h);
    let cols = planner.plan_fft(h, direction);
    columns.par_chunks_mut(h).for_each(|col| cols.process(col));
    buf.copy_from_slice(&transpose(&columns, h, w));
}

/// Transpose a row-major `w x h` buffer into a row-major `h x w` one.
fn transpose(src: &[Complex<f64>], w: usize, h: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); w * h];
    for (y, row) in src.chunks(w).enumerate() {
        for (x, &v) in row.iter().enumerate() {
            out[x * h + y] = v;
        }
    }
    out
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImages {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralImages {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];
        for (y, row) in img.rows().enumerate() {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for (x, px) in row.enumerate() {
                let v = f64::from(px[0]);
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    /// `(sum, sum of squares)` over the `w x h` window at `(x, y)`.
    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |t: &[f64], xx: usize, yy: usize| t[yy * self.stride + xx];
        let area = |t: &[f64]| at(t, x1, y1) - at(t, x0, y1) - at(t, x1, y0) + at(t, x0, y0);
        (area(&self.sum), area(&self.sum_sq))
    }
}
