//! Parallel removal over a directory of frames.
//!
//! Workers check the pause gate and the cancellation token before each frame
//! and nowhere else, so a frame that has started always runs to completion.
//! A failing frame is recorded and logged; it never stops its siblings.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::control::{CancellationToken, PauseGate};
use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressSink, ProgressState};
use crate::remover::{is_supported_image, FrameReport, FrameWatermarkRemover, OutputDirs};

/// One removal phase: where to read, where to write, and how to steer it.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Directory holding the extracted frames.
    pub frames_dir: PathBuf,
    /// Number of frames the batch is expected to process.
    pub frame_count: usize,
    /// Output directories for grayscale, processed, and mask artifacts.
    pub dirs: OutputDirs,
    /// Checked before every frame.
    pub cancel: CancellationToken,
    /// Waited on before every frame.
    pub pause: PauseGate,
}

/// A frame that could not be processed.
#[derive(Debug, Clone)]
pub struct FrameFailure {
    /// Input frame path.
    pub path: PathBuf,
    /// Human-readable cause.
    pub reason: String,
}

/// Aggregate outcome of a batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Frames written to the processed directory.
    pub succeeded: Vec<FrameReport>,
    /// Frames that failed, in input order.
    pub failed: Vec<FrameFailure>,
    /// Whether the batch stopped early because of cancellation.
    pub cancelled: bool,
}

impl BatchResult {
    /// Frames that finished, successfully or not.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Successful frames in which a watermark was erased.
    #[must_use]
    pub fn erased(&self) -> usize {
        self.succeeded
            .iter()
            .filter(|r| r.candidate.is_some())
            .count()
    }
}

/// Fans a [`FrameWatermarkRemover`] out over many frames.
#[derive(Debug, Clone)]
pub struct BatchFrameProcessor {
    remover: FrameWatermarkRemover,
    workers: usize,
}

impl BatchFrameProcessor {
    /// Create a processor using one worker per available hardware thread.
    #[must_use]
    pub fn new(remover: FrameWatermarkRemover) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self { remover, workers }
    }

    /// Override the worker count (minimum 1).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Number of worker threads used by [`run`](Self::run).
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process `frames` on a dedicated pool.
    ///
    /// Progress is counted in `progress` and reported to `sink` once per
    /// finished frame. A cancelled batch returns normally with
    /// [`BatchResult::cancelled`] set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `frames` does not hold
    /// [`BatchJob::frame_count`] paths, and an I/O error if the output
    /// directories or the worker pool cannot be created. Per-frame errors
    /// land in [`BatchResult::failed`].
    pub fn run(
        &self,
        frames: &[PathBuf],
        job: &BatchJob,
        progress: &ProgressState,
        sink: &dyn ProgressSink,
    ) -> Result<BatchResult> {
        let total = job.frame_count;
        if frames.len() != total {
            return Err(Error::InvalidConfiguration(format!(
                "batch expects {total} frames but was given {}",
                frames.len()
            )));
        }
        job.dirs.create_all()?;
        progress.begin_batch(total);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("frame-worker-{i}"))
            .build()
            .map_err(std::io::Error::other)?;

        info!(
            "removing watermarks from {total} frames in {} with {} workers",
            job.frames_dir.display(),
            self.workers
        );

        let outcomes: Vec<Option<Result<FrameReport>>> = pool.install(|| {
            frames
                .par_iter()
                .map(|path| {
                    if !job.pause.wait(&job.cancel) {
                        return None;
                    }
                    let outcome = self.remover.process(path, &job.dirs);
                    if let Err(e) = &outcome {
                        warn!("frame {} failed: {e}", path.display());
                    }
                    let processed = progress.record_frame();
                    sink.report(ProgressEvent::Frames { processed, total });
                    Some(outcome)
                })
                .collect()
        });

        let mut result = BatchResult::default();
        for (path, outcome) in frames.iter().zip(outcomes) {
            match outcome {
                Some(Ok(report)) => result.succeeded.push(report),
                Some(Err(e)) => result.failed.push(FrameFailure {
                    path: path.clone(),
                    reason: e.to_string(),
                }),
                None => {}
            }
        }
        result.cancelled = job.cancel.is_cancelled() && result.completed() < total;

        if result.cancelled {
            info!(
                "batch cancelled after {} of {total} frames",
                result.completed()
            );
        } else {
            debug!(
                "batch done: {} ok ({} erased), {} failed",
                result.succeeded.len(),
                result.erased(),
                result.failed.len()
            );
        }
        Ok(result)
    }
}

/// Supported image files directly inside `dir`, sorted by file name.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the directory cannot be read.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_supported_image(p))
        .collect();
    frames.sort();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{DetectionConfig, WatermarkLocator};
    use crate::progress::NoProgress;
    use crate::remover::save_image;
    use image::{Rgb, RgbImage};

    fn processor() -> BatchFrameProcessor {
        BatchFrameProcessor::new(FrameWatermarkRemover::new(WatermarkLocator::new(
            DetectionConfig::default(),
        )))
    }

    fn job(root: &Path, frame_count: usize) -> BatchJob {
        BatchJob {
            frames_dir: root.join("frames"),
            frame_count,
            dirs: OutputDirs {
                grayscale: root.join("GrayscaleFrames"),
                processed: root.join("ProcessedFrames"),
                masks: None,
            },
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
        }
    }

    #[test]
    fn list_frames_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["frame_0002.png", "frame_0001.png", "filelist.txt"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(tmp.path().join("nested.png")).unwrap();

        let frames = list_frames(tmp.path()).unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["frame_0001.png", "frame_0002.png"]);
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let progress = ProgressState::new();
        let result = processor()
            .run(&[], &job(tmp.path(), 0), &progress, &NoProgress)
            .unwrap();
        assert_eq!(result.completed(), 0);
        assert!(!result.cancelled);
    }

    #[test]
    fn cancelled_before_start_processes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let job = job(tmp.path(), 1);
        std::fs::create_dir_all(&job.frames_dir).unwrap();
        let frame = job.frames_dir.join("frame_0001.png");
        save_image(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), &frame).unwrap();

        job.cancel.cancel();
        let progress = ProgressState::new();
        let result = processor()
            .run(&[frame], &job, &progress, &NoProgress)
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.completed(), 0);
        assert_eq!(progress.processed(), 0);
    }

    #[test]
    fn frame_list_must_match_frame_count() {
        let tmp = tempfile::tempdir().unwrap();
        let progress = ProgressState::new();
        let err = processor()
            .run(&[], &job(tmp.path(), 2), &progress, &NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(!tmp.path().join("ProcessedFrames").exists());
    }

    #[test]
    fn worker_count_has_floor_of_one() {
        assert_eq!(processor().with_workers(0).workers(), 1);
        assert!(processor().workers() >= 1);
    }
}
