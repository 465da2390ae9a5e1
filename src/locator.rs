//! Watermark candidate location.
//!
//! Two strategies are supported, chosen once per run:
//! 1. **Geometric**: binarize the frame, extract outermost contours, and accept
//!    the first contour whose bounding box has watermark-like proportions.
//! 2. **Template**: normalized cross-correlation against a reference image,
//!    accepted when the best score reaches [`TEMPLATE_MATCH_THRESHOLD`].

use std::path::Path;

use image::{GrayImage, RgbImage};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::filters::{self, BoundingBox};

/// Minimum correlation score for a template match to count as a watermark.
pub const TEMPLATE_MATCH_THRESHOLD: f32 = 0.8;
/// Binarization threshold of the size-based geometric variant.
const SIZE_BASED_THRESHOLD: u8 = 240;
/// Binarization threshold of the edge-based geometric variant.
const EDGE_BASED_THRESHOLD: u8 = 200;
/// Canny hysteresis thresholds for the edge-based variant.
const CANNY_LOW: f32 = 100.0;
const CANNY_HIGH: f32 = 200.0;
/// Default watermark size band, as a fraction of the frame dimension.
const MIN_RATIO: f64 = 0.05;
const MAX_RATIO: f64 = 0.3;

/// Thresholds for the geometric strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricParams {
    /// Grayscale level at or above which a pixel counts as foreground.
    pub binarize_threshold: u8,
    /// Run Canny edge detection on the binary image before contour extraction.
    pub edge_detect: bool,
    /// Minimum `rect.width / image.width`.
    pub min_width_ratio: f64,
    /// Maximum `rect.width / image.width`.
    pub max_width_ratio: f64,
    /// Minimum `rect.height / image.height`.
    pub min_height_ratio: f64,
    /// Maximum `rect.height / image.height`.
    pub max_height_ratio: f64,
}

impl GeometricParams {
    /// Bright-overlay detection: threshold 240, contours taken directly from
    /// the binary image.
    #[must_use]
    pub fn size_based() -> Self {
        Self {
            binarize_threshold: SIZE_BASED_THRESHOLD,
            edge_detect: false,
            min_width_ratio: MIN_RATIO,
            max_width_ratio: MAX_RATIO,
            min_height_ratio: MIN_RATIO,
            max_height_ratio: MAX_RATIO,
        }
    }

    /// Edge detection: threshold 200 followed by a Canny pass.
    #[must_use]
    pub fn edge_based() -> Self {
        Self {
            binarize_threshold: EDGE_BASED_THRESHOLD,
            edge_detect: true,
            ..Self::size_based()
        }
    }

    /// Whether a box has watermark-like proportions relative to the frame.
    #[must_use]
    pub fn accepts(&self, rect: &BoundingBox, img_w: u32, img_h: u32) -> bool {
        if img_w == 0 || img_h == 0 {
            return false;
        }
        let w_ratio = f64::from(rect.width) / f64::from(img_w);
        let h_ratio = f64::from(rect.height) / f64::from(img_h);
        (self.min_width_ratio..=self.max_width_ratio).contains(&w_ratio)
            && (self.min_height_ratio..=self.max_height_ratio).contains(&h_ratio)
    }
}

impl Default for GeometricParams {
    fn default() -> Self {
        Self::size_based()
    }
}

/// How candidates are located.
#[derive(Debug, Clone)]
pub enum DetectionStrategy {
    /// Contour heuristics over a binarized frame.
    Geometric(GeometricParams),
    /// Correlation against a grayscale reference image.
    Template {
        /// Grayscale template, decoded once per run.
        image: GrayImage,
    },
}

/// Immutable per-run detection configuration.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Selected strategy.
    pub strategy: DetectionStrategy,
    /// Caller asked for GPU filters. Recorded for reporting; the CPU filters
    /// are functionally equivalent and always used.
    pub use_gpu: bool,
}

impl DetectionConfig {
    /// Geometric detection with the given thresholds.
    #[must_use]
    pub fn geometric(params: GeometricParams) -> Self {
        Self {
            strategy: DetectionStrategy::Geometric(params),
            use_gpu: false,
        }
    }

    /// Template detection against an already-decoded color template.
    #[must_use]
    pub fn template(template: &RgbImage) -> Self {
        Self {
            strategy: DetectionStrategy::Template {
                image: filters::to_grayscale(template),
            },
            use_gpu: false,
        }
    }

    /// Template detection, decoding the template from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the template cannot be decoded.
    pub fn from_template_path(path: &Path) -> Result<Self> {
        let template = filters::decode_image(path).map_err(|e| {
            Error::InvalidConfiguration(format!("cannot load watermark template: {e}"))
        })?;
        Ok(Self::template(&template))
    }

    /// Set the GPU-use flag.
    #[must_use]
    pub fn with_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::geometric(GeometricParams::default())
    }
}

/// A rectangular region hypothesized to contain an overlay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatermarkCandidate {
    /// Region to erase; always inside the source frame.
    pub region: BoundingBox,
    /// Correlation score, present for template matches only.
    pub score: Option<f32>,
}

/// Finds at most one watermark candidate per frame.
#[derive(Debug, Clone)]
pub struct WatermarkLocator {
    config: DetectionConfig,
}

impl WatermarkLocator {
    /// Create a locator for one run.
    #[must_use]
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// The configuration this locator was built with.
    #[must_use]
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Locate a candidate in `image`.
    ///
    /// `Ok(None)` means nothing watermark-like was found; that is a normal
    /// outcome, not an error.
    ///
    /// # Errors
    ///
    /// Propagates filter errors other than an oversized template, which is
    /// reported as no candidate.
    pub fn locate(&self, image: &RgbImage) -> Result<Option<WatermarkCandidate>> {
        let candidate = match &self.config.strategy {
            DetectionStrategy::Geometric(params) => locate_geometric(image, params),
            DetectionStrategy::Template { image: template } => {
                locate_template(image, template)?
            }
        };
        debug_assert!(candidate
            .map_or(true, |c| c.region.fits_within(image.width(), image.height())));
        Ok(candidate)
    }
}

/// First contour, in contour order, whose bounding box passes the size bands.
fn locate_geometric(image: &RgbImage, params: &GeometricParams) -> Option<WatermarkCandidate> {
    let gray = filters::to_grayscale(image);
    let mut binary = filters::binarize(&gray, params.binarize_threshold);
    if params.edge_detect {
        // Close one-pixel gaps Canny leaves at outline corners.
        let edges = filters::detect_edges(&binary, CANNY_LOW, CANNY_HIGH);
        binary = filters::dilate(&edges, 1);
    }

    let contours = filters::find_external_contours(&binary);
    debug!("geometric locator: {} external contours", contours.len());

    contours
        .iter()
        .filter_map(|c| filters::bounding_rect(c))
        .find(|rect| params.accepts(rect, image.width(), image.height()))
        .map(|region| WatermarkCandidate {
            region,
            score: None,
        })
}

fn locate_template(image: &RgbImage, template: &GrayImage) -> Result<Option<WatermarkCandidate>> {
    let gray = filters::to_grayscale(image);
    let found = match filters::match_template(&gray, template) {
        Ok(m) => m,
        Err(e @ Error::TemplateTooLarge { .. }) => {
            warn!("template matching skipped: {e}");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    debug!(
        "template locator: best score {:.3} at {:?}",
        found.score, found.location
    );

    if found.score < TEMPLATE_MATCH_THRESHOLD {
        return Ok(None);
    }
    let (x, y) = found.location;
    Ok(Some(WatermarkCandidate {
        region: BoundingBox::new(x, y, template.width(), template.height()),
        score: Some(found.score),
    }))
}
