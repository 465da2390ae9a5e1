//! External encoder collaborators.
//!
//! Extraction and reassembly are delegated to an `ffmpeg`-compatible program
//! that is run synchronously, one invocation at a time. The only contract with
//! the rest of the crate is the on-disk `frame_%04d.png` sequence.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};
use rand::Rng;

use crate::error::{Error, Result};

/// File name pattern of extracted and reassembled frames.
pub const FRAME_PATTERN: &str = "frame_%04d.png";
const FRAME_PREFIX: &str = "frame_";
const FRAME_EXTENSION: &str = "png";
/// Lines of encoder stderr quoted in error messages.
const STDERR_TAIL_LINES: usize = 5;

/// Turns a video into numbered frames.
pub trait FrameExtractor: Send + Sync {
    /// Write `frame_0001.png, frame_0002.png, ...` for `input` into `frames_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] if the process fails.
    fn extract(&self, input: &Path, frames_dir: &Path) -> Result<()>;
}

/// Turns numbered frames into a video.
pub trait VideoAssembler: Send + Sync {
    /// Encode the contiguous `frame_%04d.png` sequence in `frames_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reassembly`] if the process fails.
    fn assemble(&self, frames_dir: &Path, frame_rate: u32, output: &Path) -> Result<()>;
}

/// `ffmpeg` command-line driver.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Ffmpeg {
    /// Use the given executable (name on `PATH` or full path).
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for frame extraction.
    #[must_use]
    pub fn extract_args(input: &Path, frames_dir: &Path) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            frames_dir.join(FRAME_PATTERN).into_os_string(),
        ]
    }

    /// Arguments for reassembly (H.264, yuv420p, CRF 18, slow preset).
    #[must_use]
    pub fn assemble_args(frames_dir: &Path, frame_rate: u32, output: &Path) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-framerate".into(),
            frame_rate.to_string().into(),
            "-i".into(),
            frames_dir.join(FRAME_PATTERN).into_os_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            "18".into(),
            "-preset".into(),
            "slow".into(),
            output.as_os_str().to_owned(),
        ]
    }

    /// Run the program to completion, mapping failure through `wrap`.
    fn run(&self, args: &[OsString], wrap: fn(String) -> Error) -> Result<()> {
        debug!("running {} {:?}", self.program.display(), args);
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| wrap(format!("failed to start {}: {e}", self.program.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!("{}: {line}", self.program.display());
        }

        if output.status.success() {
            return Ok(());
        }
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        Err(wrap(format!(
            "{} exited with {}: {tail}",
            self.program.display(),
            output.status
        )))
    }
}

impl FrameExtractor for Ffmpeg {
    fn extract(&self, input: &Path, frames_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(frames_dir)
            .map_err(|e| Error::Extraction(format!("cannot create frames directory: {e}")))?;
        info!(
            "extracting frames of {} into {}",
            input.display(),
            frames_dir.display()
        );
        self.run(&Self::extract_args(input, frames_dir), Error::Extraction)
    }
}

impl VideoAssembler for Ffmpeg {
    fn assemble(&self, frames_dir: &Path, frame_rate: u32, output: &Path) -> Result<()> {
        info!(
            "encoding {} at {frame_rate} fps into {}",
            frames_dir.display(),
            output.display()
        );
        self.run(
            &Self::assemble_args(frames_dir, frame_rate, output),
            Error::Reassembly,
        )
    }
}

/// Sequence index of a `frame_<digits>.png` file name.
#[must_use]
pub fn frame_index(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != FRAME_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(FRAME_PREFIX)?
        .parse()
        .ok()
}

/// Name of the frame at 1-based position `index`.
#[must_use]
pub fn frame_file_name(index: usize) -> String {
    format!("{FRAME_PREFIX}{index:04}.{FRAME_EXTENSION}")
}

/// Delete every numbered frame (`frame_<n>.png`) directly inside `dir`.
///
/// A missing directory holds no frames. Returns the number of files removed.
///
/// # Errors
///
/// Returns [`Error::Io`] if listing or deleting fails.
pub fn clear_frames(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if frame_index(&path).is_some() {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("removed {removed} stale frames from {}", dir.display());
    }
    Ok(removed)
}

/// Drop frames at random (if `drop_ratio` is set), then rename what is left
/// to a gap-free `frame_0001.png ...` sequence in index order.
///
/// Returns the number of frames left.
///
/// # Errors
///
/// Returns [`Error::Io`] if listing, deleting, or renaming fails.
pub fn reindex_frames(dir: &Path, drop_ratio: Option<f64>, rng: &mut impl Rng) -> Result<usize> {
    let mut frames: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter_map(|p| frame_index(&p).map(|i| (i, p)))
        .collect();
    frames.sort();

    let ratio = drop_ratio.unwrap_or(0.0).clamp(0.0, 1.0);
    let mut kept = Vec::with_capacity(frames.len());
    let mut dropped = 0usize;
    for (_, path) in frames {
        if ratio > 0.0 && rng.gen::<f64>() < ratio {
            std::fs::remove_file(&path)?;
            dropped += 1;
        } else {
            kept.push(path);
        }
    }
    if dropped > 0 {
        info!("dropped {dropped} frames before reassembly");
    }

    // Two passes so a target name never collides with a not-yet-moved file.
    let staged: Vec<PathBuf> = kept
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let tmp = dir.join(format!(".reindex_{i}.{FRAME_EXTENSION}"));
            std::fs::rename(path, &tmp).map(|()| tmp)
        })
        .collect::<std::io::Result<_>>()?;
    for (i, tmp) in staged.iter().enumerate() {
        std::fs::rename(tmp, dir.join(frame_file_name(i + 1)))?;
    }

    Ok(staged.len())
}
