use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use log::{warn, LevelFilter};

use video_watermark_removal::{
    GeometricParams, PipelineConfig, PipelineOrchestrator, PipelineReport, ProgressEvent,
};

#[derive(Parser)]
#[command(
    name = "video-watermark",
    about = "Detect and inpaint a rectangular watermark in every frame of a video",
    version,
    after_help = "Simple usage: video-watermark <video> -o <output.mp4>\n\n\
                  Frames are extracted and re-encoded with ffmpeg, which must be on PATH.\n\
                  Grayscale and processed frames are kept next to the output video."
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Input video file
    input: String,

    /// Output video file
    #[arg(short, long)]
    output: String,

    /// Working directory for extracted frames (default: <output dir>/frames)
    #[arg(long)]
    frames_dir: Option<String>,

    /// Watermark template image; enables template matching
    #[arg(short, long)]
    template: Option<String>,

    /// Prefer GPU filters when available
    #[arg(long)]
    gpu: bool,

    /// Reuse frames already present in the frames directory
    #[arg(long)]
    no_extract: bool,

    /// Stop after removing watermarks; do not encode a video
    #[arg(long)]
    no_video: bool,

    /// Frame rate of the output video
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Detect via Canny edges (binarize threshold 200) instead of bright regions (240)
    #[arg(long)]
    edges: bool,

    /// Binarization threshold (0-255), overrides the variant default
    #[arg(long)]
    threshold: Option<u8>,

    /// Minimum watermark width/height as a fraction of the frame (0.0-1.0)
    #[arg(long, default_value = "0.05")]
    min_ratio: f64,

    /// Maximum watermark width/height as a fraction of the frame (0.0-1.0)
    #[arg(long, default_value = "0.3")]
    max_ratio: f64,

    /// Randomly drop this fraction of frames before encoding (0.0-1.0)
    #[arg(long)]
    drop_ratio: Option<f64>,

    /// Worker threads for the removal phase (default: all cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Also write the inpaint mask of every frame
    #[arg(long)]
    save_masks: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    for (name, value) in [("--min-ratio", cli.min_ratio), ("--max-ratio", cli.max_ratio)] {
        if !(0.0..=1.0).contains(&value) {
            eprintln!("Error: {name} must be between 0.0 and 1.0");
            process::exit(1);
        }
    }
    if cli.min_ratio > cli.max_ratio {
        eprintln!("Error: --min-ratio must not exceed --max-ratio");
        process::exit(1);
    }

    let input_path = Path::new(&cli.input);
    if !cli.no_extract && !input_path.is_file() {
        eprintln!("Error: Input video does not exist: {}", cli.input);
        process::exit(1);
    }

    let mut geometric = if cli.edges {
        GeometricParams::edge_based()
    } else {
        GeometricParams::size_based()
    };
    if let Some(t) = cli.threshold {
        geometric.binarize_threshold = t;
    }
    geometric.min_width_ratio = cli.min_ratio;
    geometric.min_height_ratio = cli.min_ratio;
    geometric.max_width_ratio = cli.max_ratio;
    geometric.max_height_ratio = cli.max_ratio;

    let output = PathBuf::from(&cli.output);
    let frames_dir = cli.frames_dir.map_or_else(
        || {
            output
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .join("frames")
        },
        PathBuf::from,
    );

    let config = PipelineConfig {
        input_video: input_path.to_path_buf(),
        output_video: output,
        frames_dir,
        template: cli.template.map(PathBuf::from),
        use_gpu: cli.gpu,
        extract_frames: !cli.no_extract,
        create_video: !cli.no_video,
        frame_rate: cli.fps,
        geometric,
        frame_drop_ratio: cli.drop_ratio,
        workers: cli.workers,
        save_masks: cli.save_masks,
    };

    let quiet = cli.quiet;
    let (tx, rx) = mpsc::channel();
    let printer = thread::spawn(move || {
        for event in rx {
            if !quiet {
                print_event(&event);
            }
        }
    });

    let mut orchestrator = PipelineOrchestrator::new();
    let cancel = orchestrator.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            process::exit(130);
        }
        warn!("interrupt received; finishing in-flight frames (press Ctrl-C again to abort)");
        cancel.cancel();
    }) {
        warn!("cannot install Ctrl-C handler: {e}");
    }

    let result = orchestrator.run(&config, &tx);
    drop(tx);
    if printer.join().is_err() {
        warn!("progress printer thread panicked");
    }

    match result {
        Ok(report) => {
            if !quiet {
                print_summary(&report);
            }
            if report.is_cancelled() {
                process::exit(130);
            }
            if !report.batch.failed.is_empty() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Frames { processed, total } => {
            if processed == total || processed % 100 == 0 {
                eprintln!("  frames: {processed}/{total}");
            }
        }
        ProgressEvent::Phase { label, elapsed } => {
            eprintln!("[{:>7.1}s] {label}", elapsed.as_secs_f64());
        }
        ProgressEvent::Overall { percent } => {
            eprintln!("  overall: {percent}%");
        }
    }
}

fn print_summary(report: &PipelineReport) {
    if report.is_cancelled() {
        eprintln!("Operation cancelled.");
    }
    for failure in &report.batch.failed {
        eprintln!("[FAIL] {}: {}", failure.path.display(), failure.reason);
    }

    eprintln!();
    eprint!(
        "[Summary] Frames: {}, Erased: {}",
        report.frame_count,
        report.batch.erased()
    );
    if !report.batch.failed.is_empty() {
        eprint!(", Failed: {}", report.batch.failed.len());
    }
    if let Some(encoded) = report.frames_encoded {
        eprint!(", Encoded: {encoded}");
    }
    eprintln!(" ({:.1}s)", report.elapsed.as_secs_f64());
}
