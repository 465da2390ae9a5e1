//! Top-level run: extract frames, remove watermarks, reassemble the video.
//!
//! ```text
//! Idle -> Extracting -> Removing -> Reassembling -> Completed
//!   any non-terminal state -> Cancelled | Failed
//! ```
//!
//! Extraction and reassembly are skipped when disabled in the configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::batch::{list_frames, BatchFrameProcessor, BatchJob, BatchResult};
use crate::control::{CancellationToken, PauseGate};
use crate::error::{Error, Result};
use crate::ffmpeg::{self, Ffmpeg, FrameExtractor, VideoAssembler};
use crate::locator::{DetectionConfig, GeometricParams, WatermarkLocator};
use crate::progress::{ProgressEvent, ProgressSink, ProgressState};
use crate::remover::{FrameWatermarkRemover, OutputDirs};

/// Sibling directory of the output video holding grayscale copies.
pub const GRAYSCALE_DIR: &str = "GrayscaleFrames";
/// Sibling directory of the output video holding processed frames.
pub const PROCESSED_DIR: &str = "ProcessedFrames";
/// Sibling directory of the output video holding inpaint masks.
pub const MASK_DIR: &str = "MaskFrames";

/// Caller-supplied options for one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Source video.
    pub input_video: PathBuf,
    /// Video to produce; its directory also receives the artifact folders.
    pub output_video: PathBuf,
    /// Working directory for extracted frames.
    pub frames_dir: PathBuf,
    /// Reference image; selects template matching when set.
    pub template: Option<PathBuf>,
    /// Prefer GPU filters when available.
    pub use_gpu: bool,
    /// Run the extraction phase (otherwise `frames_dir` must already be filled).
    pub extract_frames: bool,
    /// Run the reassembly phase.
    pub create_video: bool,
    /// Frame rate passed to the encoder on reassembly.
    pub frame_rate: u32,
    /// Thresholds for geometric detection.
    pub geometric: GeometricParams,
    /// Probability of deleting each frame before reassembly.
    pub frame_drop_ratio: Option<f64>,
    /// Worker count override for the removal phase.
    pub workers: Option<usize>,
    /// Write inpaint masks to [`MASK_DIR`].
    pub save_masks: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_video: PathBuf::new(),
            output_video: PathBuf::new(),
            frames_dir: PathBuf::new(),
            template: None,
            use_gpu: false,
            extract_frames: true,
            create_video: true,
            frame_rate: 30,
            geometric: GeometricParams::default(),
            frame_drop_ratio: None,
            workers: None,
            save_masks: false,
        }
    }
}

impl PipelineConfig {
    /// Check required paths and option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("input video path", &self.input_video),
            ("output video path", &self.output_video),
            ("frames directory", &self.frames_dir),
        ];
        for (name, path) in required {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfiguration(format!("{name} is empty")));
            }
        }
        if self.frames_dir == self.output_dirs().processed {
            return Err(Error::InvalidConfiguration(format!(
                "frames directory {} is also the processed-frames directory",
                self.frames_dir.display()
            )));
        }
        if self.frame_rate == 0 {
            return Err(Error::InvalidConfiguration(
                "frame rate must be positive".to_string(),
            ));
        }
        if let Some(ratio) = self.frame_drop_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::InvalidConfiguration(format!(
                    "frame drop ratio {ratio} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Build the per-run detection configuration, decoding the template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the template cannot be loaded.
    pub fn detection_config(&self) -> Result<DetectionConfig> {
        let config = match &self.template {
            Some(path) => DetectionConfig::from_template_path(path)?,
            None => DetectionConfig::geometric(self.geometric),
        };
        Ok(config.with_gpu(self.use_gpu))
    }

    /// Artifact directories next to the output video.
    #[must_use]
    pub fn output_dirs(&self) -> OutputDirs {
        let base = match self.output_video.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        OutputDirs {
            grayscale: base.join(GRAYSCALE_DIR),
            processed: base.join(PROCESSED_DIR),
            masks: self.save_masks.then(|| base.join(MASK_DIR)),
        }
    }

    fn total_phases(&self) -> u32 {
        1 + u32::from(self.extract_frames) + u32::from(self.create_video)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started.
    Idle,
    /// Waiting for the extraction process.
    Extracting,
    /// Detecting and removing watermarks frame by frame.
    Removing,
    /// Waiting for the reassembly process.
    Reassembling,
    /// Every enabled phase finished.
    Completed,
    /// Stopped at the caller's request.
    Cancelled,
    /// Stopped by an unrecoverable error.
    Failed,
}

impl PipelineState {
    /// Human-readable phase label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Extracting => "Extracting frames",
            Self::Removing => "Removing watermarks",
            Self::Reassembling => "Reassembling video",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }

    /// Whether no further transitions can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Summary of a finished (completed or cancelled) run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// `Completed` or `Cancelled`.
    pub state: Option<PipelineState>,
    /// Frames found in the frames directory.
    pub frame_count: usize,
    /// Outcome of the removal phase, if it ran.
    pub batch: BatchResult,
    /// Frames handed to the encoder, if reassembly ran.
    pub frames_encoded: Option<usize>,
    /// Overall completion in percent.
    pub percent: u8,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl PipelineReport {
    /// Whether the run stopped because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state == Some(PipelineState::Cancelled)
    }
}

/// Drives the phase state machine on the calling thread.
pub struct PipelineOrchestrator {
    extractor: Box<dyn FrameExtractor>,
    assembler: Box<dyn VideoAssembler>,
    state: PipelineState,
    progress: Arc<ProgressState>,
    cancel: CancellationToken,
    pause: PauseGate,
}

impl Default for PipelineOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineOrchestrator {
    /// Orchestrator using `ffmpeg` from `PATH` for both external phases.
    #[must_use]
    pub fn new() -> Self {
        Self::with_collaborators(Box::new(Ffmpeg::default()), Box::new(Ffmpeg::default()))
    }

    /// Orchestrator with custom extraction and reassembly collaborators.
    #[must_use]
    pub fn with_collaborators(
        extractor: Box<dyn FrameExtractor>,
        assembler: Box<dyn VideoAssembler>,
    ) -> Self {
        Self {
            extractor,
            assembler,
            state: PipelineState::Idle,
            progress: Arc::new(ProgressState::new()),
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for cancelling the run from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for pausing and resuming the removal phase from another thread.
    #[must_use]
    pub fn pause_gate(&self) -> PauseGate {
        self.pause.clone()
    }

    /// Shared counters, readable while the run is in progress.
    ///
    /// The same state is reused across runs and reset when each run starts,
    /// so a handle taken before [`run`](Self::run) follows every later run.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressState> {
        Arc::clone(&self.progress)
    }

    /// Execute every enabled phase.
    ///
    /// Cancellation is not an error: the report's state is `Cancelled`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] before any state change if required
    ///   paths are missing or the template cannot be loaded.
    /// - [`Error::Extraction`], [`Error::Reassembly`], or [`Error::Io`] from a
    ///   failed phase; the state is then `Failed`.
    pub fn run(
        &mut self,
        config: &PipelineConfig,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineReport> {
        config.validate()?;
        let detection = config.detection_config()?;
        if config.use_gpu {
            info!("GPU filters requested; running the equivalent CPU filters");
        }

        self.progress.reset();
        self.state = PipelineState::Idle;
        let mut report = PipelineReport::default();
        let mut phases = PhaseCounter::new(config.total_phases());

        let outcome = self.drive(config, detection, sink, &mut report, &mut phases);
        report.percent = phases.percent();
        report.elapsed = self.progress.elapsed();

        match outcome {
            Ok(()) => {
                self.enter(PipelineState::Completed, sink);
                report.state = Some(PipelineState::Completed);
                info!(
                    "run completed in {:.1}s: {} frames, {} failed",
                    report.elapsed.as_secs_f64(),
                    report.frame_count,
                    report.batch.failed.len()
                );
                Ok(report)
            }
            Err(Error::Cancelled) => {
                info!("run cancelled during {}", self.state);
                self.enter(PipelineState::Cancelled, sink);
                report.state = Some(PipelineState::Cancelled);
                Ok(report)
            }
            Err(e) => {
                error!("{} failed: {e}", self.state);
                self.enter(PipelineState::Failed, sink);
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        config: &PipelineConfig,
        detection: DetectionConfig,
        sink: &dyn ProgressSink,
        report: &mut PipelineReport,
        phases: &mut PhaseCounter,
    ) -> Result<()> {
        if config.extract_frames {
            self.enter(PipelineState::Extracting, sink);
            self.checkpoint()?;
            ffmpeg::clear_frames(&config.frames_dir)?;
            self.extractor
                .extract(&config.input_video, &config.frames_dir)?;
            let extracted = list_frames(&config.frames_dir)
                .map_err(|e| Error::Extraction(format!("cannot list extracted frames: {e}")))?;
            if extracted.is_empty() {
                return Err(Error::Extraction(format!(
                    "no frames were written to {}",
                    config.frames_dir.display()
                )));
            }
            info!("extracted {} frames", extracted.len());
            phases.complete(sink);
        }

        self.checkpoint()?;
        self.enter(PipelineState::Removing, sink);
        let frames = list_frames(&config.frames_dir)?;
        report.frame_count = frames.len();

        let mut processor = BatchFrameProcessor::new(FrameWatermarkRemover::new(
            WatermarkLocator::new(detection),
        ));
        if let Some(workers) = config.workers {
            processor = processor.with_workers(workers);
        }
        let job = BatchJob {
            frames_dir: config.frames_dir.clone(),
            frame_count: frames.len(),
            dirs: config.output_dirs(),
            cancel: self.cancel.clone(),
            pause: self.pause.clone(),
        };
        // Reassembly encodes every numbered frame it finds here.
        ffmpeg::clear_frames(&job.dirs.processed)?;
        report.batch = processor.run(&frames, &job, &self.progress, sink)?;
        if report.batch.cancelled {
            return Err(Error::Cancelled);
        }
        if !report.batch.failed.is_empty() {
            warn!(
                "{} of {} frames failed",
                report.batch.failed.len(),
                frames.len()
            );
        }
        phases.complete(sink);

        if config.create_video {
            self.checkpoint()?;
            self.enter(PipelineState::Reassembling, sink);
            report.frames_encoded = Some(self.reassemble(config, &job.dirs.processed)?);
            phases.complete(sink);
        }
        Ok(())
    }

    fn reassemble(&self, config: &PipelineConfig, processed: &Path) -> Result<usize> {
        let kept = ffmpeg::reindex_frames(processed, config.frame_drop_ratio, &mut rand::thread_rng())?;
        if kept == 0 {
            return Err(Error::Reassembly(format!(
                "no processed frames in {}",
                processed.display()
            )));
        }
        self.assembler
            .assemble(processed, config.frame_rate, &config.output_video)?;
        Ok(kept)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter(&mut self, state: PipelineState, sink: &dyn ProgressSink) {
        self.state = state;
        self.progress.set_phase(state.label());
        sink.report(ProgressEvent::Phase {
            label: state.label().to_string(),
            elapsed: self.progress.elapsed(),
        });
    }
}

/// Completed-phase accounting for the overall percentage.
struct PhaseCounter {
    completed: u32,
    total: u32,
}

impl PhaseCounter {
    fn new(total: u32) -> Self {
        Self {
            completed: 0,
            total: total.max(1),
        }
    }

    fn percent(&self) -> u8 {
        u8::try_from((self.completed * 100 / self.total).min(100)).unwrap_or(100)
    }

    fn complete(&mut self, sink: &dyn ProgressSink) {
        self.completed += 1;
        sink.report(ProgressEvent::Overall {
            percent: self.percent(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    fn config() -> PipelineConfig {
        PipelineConfig {
            input_video: "in.mp4".into(),
            output_video: "out/result.mp4".into(),
            frames_dir: "frames".into(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn validate_rejects_each_missing_path() {
        for clear in [0, 1, 2] {
            let mut c = config();
            match clear {
                0 => c.input_video = PathBuf::new(),
                1 => c.output_video = PathBuf::new(),
                _ => c.frames_dir = PathBuf::new(),
            }
            assert!(matches!(c.validate(), Err(Error::InvalidConfiguration(_))));
        }
        assert!(config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_options() {
        let c = PipelineConfig {
            frame_drop_ratio: Some(1.5),
            ..config()
        };
        assert!(c.validate().is_err());
        let c = PipelineConfig {
            frame_rate: 0,
            ..config()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_frames_dir_shared_with_processed_dir() {
        let c = PipelineConfig {
            frames_dir: Path::new("out").join(PROCESSED_DIR),
            ..config()
        };
        assert!(matches!(c.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn output_dirs_are_siblings_of_output_video() {
        let dirs = PipelineConfig {
            save_masks: true,
            ..config()
        }
        .output_dirs();
        assert_eq!(dirs.grayscale, Path::new("out").join(GRAYSCALE_DIR));
        assert_eq!(dirs.processed, Path::new("out").join(PROCESSED_DIR));
        assert_eq!(dirs.masks, Some(Path::new("out").join(MASK_DIR)));

        let bare = PipelineConfig {
            output_video: "result.mp4".into(),
            ..config()
        };
        assert_eq!(bare.output_dirs().processed, Path::new(".").join(PROCESSED_DIR));
    }

    #[test]
    fn invalid_configuration_leaves_state_idle() {
        let mut orchestrator = PipelineOrchestrator::new();
        let err = orchestrator
            .run(&PipelineConfig::default(), &NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(orchestrator.state(), PipelineState::Idle);
    }

    #[test]
    fn missing_template_is_invalid_configuration() {
        let c = PipelineConfig {
            template: Some("/definitely/not/here.png".into()),
            ..config()
        };
        assert!(matches!(
            c.detection_config(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn phase_percent_rounds_down() {
        let mut phases = PhaseCounter::new(3);
        assert_eq!(phases.percent(), 0);
        phases.complete(&NoProgress);
        assert_eq!(phases.percent(), 33);
        phases.complete(&NoProgress);
        assert_eq!(phases.percent(), 66);
        phases.complete(&NoProgress);
        assert_eq!(phases.percent(), 100);
    }

    #[test]
    fn terminal_states() {
        assert!(PipelineState::Completed.is_terminal());
        assert!(PipelineState::Cancelled.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Removing.is_terminal());
        assert_eq!(PipelineState::Removing.to_string(), "Removing watermarks");
    }
}
