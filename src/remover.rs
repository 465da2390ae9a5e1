//! Per-frame watermark removal.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage, ImageFormat, RgbImage};
use log::debug;

use crate::error::{Error, Result};
use crate::filters;
use crate::locator::{WatermarkCandidate, WatermarkLocator};

/// Inpaint radius applied around every masked pixel.
pub const INPAINT_RADIUS: u32 = 5;

/// Where per-frame artifacts are written.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    /// Grayscale diagnostic copies.
    pub grayscale: PathBuf,
    /// Processed color frames, consumed by reassembly.
    pub processed: PathBuf,
    /// Inpaint masks (`mask_<filename>`), written only when set.
    pub masks: Option<PathBuf>,
}

impl OutputDirs {
    /// Create every configured directory that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a directory cannot be created.
    pub fn create_all(&self) -> Result<()> {
        std::fs::create_dir_all(&self.grayscale)?;
        std::fs::create_dir_all(&self.processed)?;
        if let Some(masks) = &self.masks {
            std::fs::create_dir_all(masks)?;
        }
        Ok(())
    }
}

/// Result of processing one frame successfully.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Input frame path.
    pub path: PathBuf,
    /// Region that was inpainted, if any.
    pub candidate: Option<WatermarkCandidate>,
}

/// Locates and erases the watermark of single frames.
///
/// Holds no mutable state; one instance is shared by all batch workers.
#[derive(Debug, Clone)]
pub struct FrameWatermarkRemover {
    locator: WatermarkLocator,
    inpaint_radius: u32,
}

impl FrameWatermarkRemover {
    /// Create a remover using the given locator and [`INPAINT_RADIUS`].
    #[must_use]
    pub fn new(locator: WatermarkLocator) -> Self {
        Self {
            locator,
            inpaint_radius: INPAINT_RADIUS,
        }
    }

    /// Override the inpaint radius.
    #[must_use]
    pub fn with_inpaint_radius(mut self, radius: u32) -> Self {
        self.inpaint_radius = radius;
        self
    }

    /// The locator used for every frame.
    #[must_use]
    pub fn locator(&self) -> &WatermarkLocator {
        &self.locator
    }

    /// Erase the watermark (if any) from an in-memory frame.
    ///
    /// Returns the candidate that was erased together with its mask.
    ///
    /// # Errors
    ///
    /// Propagates locator errors.
    pub fn remove(&self, frame: &mut RgbImage) -> Result<Option<(WatermarkCandidate, GrayImage)>> {
        let Some(candidate) = self.locator.locate(frame)? else {
            return Ok(None);
        };
        let mask = filters::rect_mask(frame.width(), frame.height(), candidate.region);
        *frame = filters::inpaint(frame, &mask, self.inpaint_radius);
        Ok(Some((candidate, mask)))
    }

    /// Process one frame file: decode, write grayscale copy, erase, write
    /// processed copy under the same file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageDecode`] for unreadable frames and
    /// [`Error::Io`]/[`Error::Image`] if an output cannot be written.
    pub fn process(&self, frame_path: &Path, dirs: &OutputDirs) -> Result<FrameReport> {
        let file_name = frame_path.file_name().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "frame path has no file name: {}",
                frame_path.display()
            ))
        })?;

        let mut frame = filters::decode_image(frame_path)?;

        let gray = filters::to_grayscale(&frame);
        save_gray(&gray, &dirs.grayscale.join(file_name))?;

        let removed = self.remove(&mut frame)?;
        if let Some((c, mask)) = &removed {
            debug!(
                "{}: erased {}x{} at ({}, {})",
                frame_path.display(),
                c.region.width,
                c.region.height,
                c.region.x,
                c.region.y
            );
            if let Some(mask_dir) = &dirs.masks {
                let mut mask_name = std::ffi::OsString::from("mask_");
                mask_name.push(file_name);
                save_gray(mask, &mask_dir.join(mask_name))?;
            }
        }

        save_image(&frame, &dirs.processed.join(file_name))?;

        Ok(FrameReport {
            path: frame_path.to_path_buf(),
            candidate: removed.map(|(c, _)| c),
        })
    }
}

/// Check if a file has a supported frame extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Save an RGB frame with format-specific quality settings.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    write_buffer(img.as_raw(), img.dimensions(), ExtendedColorType::Rgb8, path)
}

/// Save a single-channel image with format-specific quality settings.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_gray(img: &GrayImage, path: &Path) -> Result<()> {
    write_buffer(img.as_raw(), img.dimensions(), ExtendedColorType::L8, path)
}

fn write_buffer(
    buf: &[u8],
    (width, height): (u32, u32),
    color: ExtendedColorType,
    path: &Path,
) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let file = BufWriter::new(File::create(path)?);
            let mut encoder = JpegEncoder::new_with_quality(file, 100);
            encoder.encode(buf, width, height, color)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            image::save_buffer_with_format(path, buf, width, height, color, format)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{DetectionConfig, GeometricParams};
    use image::Rgb;

    fn remover() -> FrameWatermarkRemover {
        FrameWatermarkRemover::new(WatermarkLocator::new(DetectionConfig::geometric(
            GeometricParams {
                binarize_threshold: 200,
                ..GeometricParams::default()
            },
        )))
    }

    fn dirs(root: &Path, masks: bool) -> OutputDirs {
        let dirs = OutputDirs {
            grayscale: root.join("GrayscaleFrames"),
            processed: root.join("ProcessedFrames"),
            masks: masks.then(|| root.join("MaskFrames")),
        };
        dirs.create_all().unwrap();
        dirs
    }

    fn watermarked_frame() -> RgbImage {
        let mut img = RgbImage::from_pixel(200, 200, Rgb([30, 60, 90]));
        for y in 20..50 {
            for x in 140..180 {
                img.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        img
    }

    #[test]
    fn remove_erases_bright_overlay() {
        let mut img = watermarked_frame();
        let (candidate, mask) = remover().remove(&mut img).unwrap().unwrap();
        assert_eq!(candidate.region, filters::BoundingBox::new(140, 20, 40, 30));
        assert_eq!(mask.get_pixel(150, 30)[0], 255);
        for px in img.pixels() {
            assert_eq!(*px, Rgb([30, 60, 90]));
        }
    }

    #[test]
    fn process_writes_both_artifacts_under_original_name() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("frame_0007.png");
        save_image(&watermarked_frame(), &input).unwrap();
        let dirs = dirs(tmp.path(), true);

        let report = remover().process(&input, &dirs).unwrap();
        assert!(report.candidate.is_some());
        assert!(dirs.grayscale.join("frame_0007.png").is_file());
        assert!(dirs.processed.join("frame_0007.png").is_file());
        assert!(dirs
            .masks
            .as_ref()
            .unwrap()
            .join("mask_frame_0007.png")
            .is_file());

        let gray = image::open(dirs.grayscale.join("frame_0007.png")).unwrap();
        assert_eq!(gray.color(), image::ColorType::L8);
    }

    #[test]
    fn process_is_idempotent_without_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("frame_0001.png");
        let clean = RgbImage::from_fn(64, 48, |x, y| {
            Rgb([u8::try_from(x).unwrap(), u8::try_from(y).unwrap(), 100])
        });
        save_image(&clean, &input).unwrap();
        let dirs = dirs(tmp.path(), false);
        let out = dirs.processed.join("frame_0001.png");

        let first = remover().process(&input, &dirs).unwrap();
        let first_bytes = std::fs::read(&out).unwrap();
        let second = remover().process(&input, &dirs).unwrap();
        let second_bytes = std::fs::read(&out).unwrap();

        assert!(first.candidate.is_none());
        assert!(second.candidate.is_none());
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn process_rejects_corrupt_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("frame_0002.png");
        std::fs::write(&input, b"not a png").unwrap();
        let dirs = dirs(tmp.path(), false);

        let err = remover().process(&input, &dirs).unwrap_err();
        assert!(matches!(err, Error::ImageDecode { .. }));
        assert!(!dirs.processed.join("frame_0002.png").exists());
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        assert!(is_supported_image(Path::new("frame_0001.png")));
        assert!(is_supported_image(Path::new("frame_0001.JPG")));
        assert!(is_supported_image(Path::new("frame_0001.bmp")));
        assert!(!is_supported_image(Path::new("filelist.txt")));
        assert!(!is_supported_image(Path::new("frame_0001")));
    }

    #[test]
    fn save_helpers_write_color_and_gray_buffers() {
        let tmp = tempfile::tempdir().unwrap();
        let color = watermarked_frame();
        let gray = filters::to_grayscale(&color);

        for name in ["frame.png", "frame.jpg", "frame.bmp"] {
            let path = tmp.path().join(name);
            save_image(&color, &path).unwrap();
            let back = image::open(&path).unwrap();
            assert_eq!(back.color(), image::ColorType::Rgb8, "{name}");
            assert_eq!(back.to_rgb8().dimensions(), color.dimensions());
        }

        let path = tmp.path().join("gray.png");
        save_gray(&gray, &path).unwrap();
        assert_eq!(image::open(&path).unwrap().to_luma8(), gray);
    }

    #[test]
    fn save_rejects_unsupported_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let err = save_image(&watermarked_frame(), &tmp.path().join("frame.gif")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
