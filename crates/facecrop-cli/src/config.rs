use anyhow::{bail, Context, Result};
use facecrop_core::{OutputFormat, PipelineOptions, DETECTION_BATCH_SIZE};
use facecrop_vision::{VisionConfig, DEFAULT_ENDPOINT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on retries per detection request.
const MAX_VISION_RETRIES: u32 = 10;

/// Run configuration.
///
/// Resolved in layers: defaults, then an optional TOML file, then
/// `FACECROP_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub input_dir: PathBuf,
    /// Face cache snapshot (default: `.faces.json` in the working directory).
    pub cache_path: PathBuf,
    /// Where dry runs write their outputs.
    pub scratch_dir: PathBuf,
    pub dry_run: bool,
    /// Write highlight previews even outside dry runs.
    pub highlight: bool,
    pub format: OutputFormat,
    /// Images per detection request.
    pub batch_size: usize,
    /// Deadline for the whole run, in seconds.
    pub timeout_secs: u64,
    pub vision_endpoint: String,
    pub vision_api_key: Option<String>,
    pub vision_max_retries: u32,
    pub vision_request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            cache_path: PathBuf::from(".faces.json"),
            scratch_dir: std::env::temp_dir().join("facecrop-scratch"),
            dry_run: false,
            highlight: false,
            format: OutputFormat::Jpeg,
            batch_size: DETECTION_BATCH_SIZE,
            timeout_secs: 600,
            vision_endpoint: DEFAULT_ENDPOINT.to_string(),
            vision_api_key: None,
            vision_max_retries: 3,
            vision_request_timeout_secs: 60,
        }
    }
}

/// On-disk TOML layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    input_dir: Option<PathBuf>,
    cache_path: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    dry_run: Option<bool>,
    highlight: Option<bool>,
    format: Option<OutputFormat>,
    batch_size: Option<usize>,
    timeout_secs: Option<u64>,
    vision: VisionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VisionSection {
    endpoint: Option<String>,
    api_key: Option<String>,
    max_retries: Option<u32>,
    request_timeout_secs: Option<u64>,
}

impl Config {
    /// Defaults overlaid with `file` (if any) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config
                .apply_toml(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw)?;

        if let Some(v) = file.input_dir {
            self.input_dir = v;
        }
        if let Some(v) = file.cache_path {
            self.cache_path = v;
        }
        if let Some(v) = file.scratch_dir {
            self.scratch_dir = v;
        }
        if let Some(v) = file.dry_run {
            self.dry_run = v;
        }
        if let Some(v) = file.highlight {
            self.highlight = v;
        }
        if let Some(v) = file.format {
            self.format = v;
        }
        if let Some(v) = file.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = file.timeout_secs {
            self.timeout_secs = v;
        }
        if let Some(v) = file.vision.endpoint {
            self.vision_endpoint = v;
        }
        if file.vision.api_key.is_some() {
            self.vision_api_key = file.vision.api_key;
        }
        if let Some(v) = file.vision.max_retries {
            self.vision_max_retries = v;
        }
        if let Some(v) = file.vision.request_timeout_secs {
            self.vision_request_timeout_secs = v;
        }
        Ok(())
    }

    /// Overlay `FACECROP_*` variables as returned by `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FACECROP_INPUT_DIR") {
            self.input_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECROP_CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECROP_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECROP_DRY_RUN") {
            self.dry_run = v != "0";
        }
        if let Some(v) = lookup("FACECROP_HIGHLIGHT") {
            self.highlight = v != "0";
        }
        if let Some(v) = lookup("FACECROP_FORMAT") {
            self.format = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = lookup("FACECROP_BATCH_SIZE") {
            self.batch_size = parse_env("FACECROP_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("FACECROP_TIMEOUT_SECS") {
            self.timeout_secs = parse_env("FACECROP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FACECROP_VISION_ENDPOINT") {
            self.vision_endpoint = v;
        }
        if let Some(v) = lookup("FACECROP_VISION_API_KEY") {
            self.vision_api_key = Some(v);
        }
        if let Some(v) = lookup("FACECROP_VISION_MAX_RETRIES") {
            self.vision_max_retries = parse_env("FACECROP_VISION_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("FACECROP_VISION_REQUEST_TIMEOUT_SECS") {
            self.vision_request_timeout_secs = parse_env("FACECROP_VISION_REQUEST_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(1..=DETECTION_BATCH_SIZE).contains(&self.batch_size) {
            bail!(
                "batch_size must be between 1 and {DETECTION_BATCH_SIZE}, got {}",
                self.batch_size
            );
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than zero");
        }
        if self.vision_max_retries > MAX_VISION_RETRIES {
            bail!(
                "vision.max_retries must be at most {MAX_VISION_RETRIES}, got {}",
                self.vision_max_retries
            );
        }
        Ok(())
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        let mut options = PipelineOptions::new(&self.input_dir, &self.cache_path);
        options.dry_run = self.dry_run;
        // Dry runs exist to eyeball crops, so they always get previews.
        options.highlight = self.highlight || self.dry_run;
        options.scratch_dir = self.scratch_dir.clone();
        options.batch_size = self.batch_size;
        options.format = self.format;
        options.deadline = Some(self.run_deadline());
        options
    }

    pub fn vision_config(&self, api_key: String) -> VisionConfig {
        let mut vision = VisionConfig::new(api_key);
        vision.endpoint = self.vision_endpoint.clone();
        vision.max_retries = self.vision_max_retries;
        vision.request_timeout = Duration::from_secs(self.vision_request_timeout_secs);
        vision
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {key}={value:?}: {e}"))
}
