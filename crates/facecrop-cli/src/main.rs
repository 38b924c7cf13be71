use anyhow::{anyhow, Context, Result};
use clap::Parser;
use facecrop_core::{BoundingBox, DetectError, FaceDetector, OutputFormat, Pipeline, RunReport};
use facecrop_vision::VisionClient;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// Exit code when the run completed but some images failed under `--strict`.
const EXIT_IMAGE_FAILURES: u8 = 2;

#[derive(Parser)]
#[command(name = "facecrop", about = "Face-aware 256x256 thumbnails for a directory of portraits")]
struct Cli {
    /// Directory of source images (searched recursively, dotfiles skipped)
    input_dir: Option<PathBuf>,

    /// Face cache snapshot [default: .faces.json]
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Write outputs (and highlight previews) to the scratch directory instead of in place
    #[arg(long)]
    dry_run: bool,

    /// Scratch directory used by --dry-run
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Also write highlight previews outside dry runs
    #[arg(long)]
    highlight: bool,

    /// Output encoding: jpeg or webp
    #[arg(long)]
    format: Option<OutputFormat>,

    /// TOML configuration file
    #[arg(long, env = "FACECROP_CONFIG")]
    config: Option<PathBuf>,

    /// Never call the detection service; every image must already be cached
    #[arg(long)]
    offline: bool,

    /// Exit non-zero when any single image fails
    #[arg(long)]
    strict: bool,

    /// Deadline for the whole run, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.input_dir {
            config.input_dir = dir.clone();
        }
        if let Some(cache) = &self.cache {
            config.cache_path = cache.clone();
        }
        if let Some(scratch) = &self.scratch_dir {
            config.scratch_dir = scratch.clone();
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        config.dry_run |= self.dry_run;
        config.highlight |= self.highlight;
    }
}

/// Detector for `--offline`: refuses every request, so any cache miss aborts the run.
struct OfflineDetector;

impl FaceDetector for OfflineDetector {
    async fn detect(&self, images: &[Vec<u8>]) -> Result<Vec<BoundingBox>, DetectError> {
        Err(DetectError::Unavailable(format!(
            "{} image(s) are not in the face cache and --offline is set",
            images.len()
        )))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "run aborted");
            eprintln!("facecrop: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    tracing::info!(
        input = %config.input_dir.display(),
        cache = %config.cache_path.display(),
        dry_run = config.dry_run,
        offline = cli.offline,
        "facecrop starting"
    );

    let options = config.pipeline_options();
    let deadline = config.run_deadline();

    let report = if cli.offline {
        execute(Pipeline::new(OfflineDetector, options), deadline).await?
    } else {
        let api_key = config.vision_api_key.clone().context(
            "no detection API key: set FACECROP_VISION_API_KEY or vision.api_key, or pass --offline",
        )?;
        let client = VisionClient::new(config.vision_config(api_key))?;
        execute(Pipeline::new(client, options), deadline).await?
    };

    println!(
        "facecrop: {} images, {} cached, {} detected in {} batch(es), {} rendered, {} failed",
        report.images,
        report.cache_hits,
        report.cache_misses,
        report.batches,
        report.rendered.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        eprintln!("  {}: {}", failure.source.display(), failure.error);
    }

    if cli.strict && !report.failures.is_empty() {
        return Ok(ExitCode::from(EXIT_IMAGE_FAILURES));
    }
    Ok(ExitCode::SUCCESS)
}

/// Run the pipeline under the run-scoped deadline.
async fn execute<D: FaceDetector>(mut pipeline: Pipeline<D>, deadline: Duration) -> Result<RunReport> {
    let outcome = tokio::time::timeout(deadline, pipeline.run()).await;
    match outcome {
        Ok(result) => result.context("pipeline failed"),
        Err(_) => Err(anyhow!(
            "run exceeded its {}s deadline during {:?}",
            deadline.as_secs(),
            pipeline.phase()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecrop_core::{FaceCache, PipelineOptions};

    fn write_square_png(path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::RgbImage::from_pixel(64, 64, image::Rgb([90, 120, 200]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::parse_from([
            "facecrop",
            "/data/portraits",
            "--cache",
            "/tmp/faces.json",
            "--dry-run",
            "--format",
            "webp",
            "--timeout",
            "42",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.input_dir, PathBuf::from("/data/portraits"));
        assert_eq!(config.cache_path, PathBuf::from("/tmp/faces.json"));
        assert!(config.dry_run);
        assert_eq!(config.format, OutputFormat::Webp);
        assert_eq!(config.timeout_secs, 42);
    }

    #[tokio::test]
    async fn test_offline_run_renders_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        let cache_path = dir.path().join(".faces.json");
        write_square_png(&root.join("a").join("portrait.png"));

        let mut cache = FaceCache::new();
        cache.merge([("a/portrait.png".to_string(), BoundingBox::no_face())]);
        cache.persist(&cache_path).unwrap();

        let pipeline = Pipeline::new(OfflineDetector, PipelineOptions::new(&root, &cache_path));
        let report = execute(pipeline, Duration::from_secs(30)).await.unwrap();
        assert_eq!(report.rendered.len(), 1);
        assert!(root.join("a").join("thumbnail.jpg").exists());
    }

    #[tokio::test]
    async fn test_offline_run_with_miss_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        write_square_png(&root.join("portrait.png"));

        let pipeline = Pipeline::new(
            OfflineDetector,
            PipelineOptions::new(&root, dir.path().join(".faces.json")),
        );
        let err = execute(pipeline, Duration::from_secs(30)).await.unwrap_err();
        assert!(format!("{err:#}").contains("--offline"));
        assert!(!dir.path().join(".faces.json").exists());
    }
}
