//! Detect and erase rectangular watermark overlays across the frames of a video.
//!
//! A run extracts frames with an external encoder, locates one watermark
//! candidate per frame (contour heuristics or template matching), inpaints it,
//! and re-encodes the processed frames. The removal phase runs in parallel and
//! can be paused, resumed, and cancelled at frame boundaries.
//!
//! # Quick Start
//!
//! ```no_run
//! use video_watermark_removal::{PipelineConfig, PipelineOrchestrator, ProgressEvent};
//!
//! let config = PipelineConfig {
//!     input_video: "input.mp4".into(),
//!     output_video: "out/cleaned.mp4".into(),
//!     frames_dir: "out/frames".into(),
//!     ..PipelineConfig::default()
//! };
//! let (tx, rx) = std::sync::mpsc::channel::<ProgressEvent>();
//! std::thread::spawn(move || {
//!     for event in rx {
//!         println!("{event:?}");
//!     }
//! });
//! let report = PipelineOrchestrator::new().run(&config, &tx).expect("run failed");
//! println!("{} frames, {} failed", report.frame_count, report.batch.failed.len());
//! ```
//!
//! # Single frames
//!
//! ```no_run
//! use video_watermark_removal::{DetectionConfig, FrameWatermarkRemover, WatermarkLocator};
//!
//! let remover = FrameWatermarkRemover::new(WatermarkLocator::new(DetectionConfig::default()));
//! let mut frame = image::open("frame_0001.png").unwrap().to_rgb8();
//! if let Some((candidate, _mask)) = remover.remove(&mut frame).unwrap() {
//!     println!("erased {:?}", candidate.region);
//! }
//! frame.save("frame_0001_clean.png").unwrap();
//! ```

#![deny(missing_docs)]

pub mod batch;
pub mod control;
pub mod error;
pub mod ffmpeg;
pub mod filters;
pub mod locator;
pub mod pipeline;
pub mod progress;
pub mod remover;

pub use batch::{list_frames, BatchFrameProcessor, BatchJob, BatchResult, FrameFailure};
pub use control::{CancellationToken, PauseGate};
pub use error::{Error, Result};
pub use ffmpeg::{Ffmpeg, FrameExtractor, VideoAssembler};
pub use filters::BoundingBox;
pub use locator::{
    DetectionConfig, DetectionStrategy, GeometricParams, WatermarkCandidate, WatermarkLocator,
};
pub use pipeline::{PipelineConfig, PipelineOrchestrator, PipelineReport, PipelineState};
pub use progress::{NoProgress, ProgressEvent, ProgressSink, ProgressState};
pub use remover::{FrameReport, FrameWatermarkRemover, OutputDirs};
