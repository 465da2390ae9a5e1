//! Error types for the video-watermark-removal crate.

use std::path::PathBuf;

/// Errors that can occur while locating, removing, or orchestrating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required path or option is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A frame or template could not be decoded (empty, truncated, corrupt).
    #[error("failed to decode image {}: {source}", path.display())]
    ImageDecode {
        /// Path of the file that failed to decode.
        path: PathBuf,
        /// Underlying decoder error.
        source: image::ImageError,
    },

    /// The frame-extraction process failed or produced no frames.
    #[error("frame extraction failed: {0}")]
    Extraction(String),

    /// The reassembly process failed.
    #[error("video reassembly failed: {0}")]
    Reassembly(String),

    /// The run was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The template is larger than the image it is matched against.
    #[error("template ({tw}x{th}) larger than image ({iw}x{ih})")]
    TemplateTooLarge {
        /// Template width in pixels.
        tw: u32,
        /// Template height in pixels.
        th: u32,
        /// Image width in pixels.
        iw: u32,
        /// Image height in pixels.
        ih: u32,
    },

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred while encoding or saving an image.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether this error represents a user-initiated cancellation rather
    /// than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
