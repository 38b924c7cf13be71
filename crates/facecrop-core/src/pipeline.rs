//! Batch orchestration: walk → cache → detect misses → persist → render.
//!
//! Walk, cache and detection failures abort the run before anything is
//! rendered. Once rendering starts, a bad image is recorded in the
//! [`RunReport`] and the run moves on to the next one.

use crate::batch::chunks_of;
use crate::cache::{CacheError, FaceCache};
use crate::detector::{DetectError, FaceDetector, DETECTION_BATCH_SIZE};
use crate::planner;
use crate::render::{self, OutputFormat, RenderError, ThumbnailRenderer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Raster extensions picked up by the directory walk.
const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

const THUMBNAIL_STEM: &str = "thumbnail";
const HIGHLIGHT_STEM: &str = "highlighted";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("failed to create scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("run deadline of {limit:?} exceeded during {phase:?}")]
    Deadline { phase: Phase, limit: Duration },
}

/// Why a single image produced no output.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to read source: {0}")]
    Read(std::io::Error),
    #[error("no cached detection result")]
    NotDetected,
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("output {0} was already written by another image in this run")]
    Collision(PathBuf),
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Walking,
    CacheLoaded,
    Detecting,
    CachePersisted,
    Rendering,
    Done,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub input_dir: PathBuf,
    pub cache_path: PathBuf,
    /// Write outputs to `scratch_dir` instead of next to each source.
    pub dry_run: bool,
    /// Also write the full-size highlight preview.
    pub highlight: bool,
    pub scratch_dir: PathBuf,
    pub batch_size: usize,
    pub format: OutputFormat,
    /// Budget for the whole run, checked between batches and between images.
    pub deadline: Option<Duration>,
}

impl PipelineOptions {
    pub fn new(input_dir: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            cache_path: cache_path.into(),
            dry_run: false,
            highlight: false,
            scratch_dir: std::env::temp_dir().join("facecrop-scratch"),
            batch_size: DETECTION_BATCH_SIZE,
            format: OutputFormat::default(),
            deadline: None,
        }
    }
}

/// A source image found by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Cache key: path relative to the input directory, `/`-separated.
    pub key: String,
    pub path: PathBuf,
}

/// Files written for one source image.
#[derive(Debug, Clone)]
pub struct RenderedAsset {
    pub source: PathBuf,
    pub thumbnail: PathBuf,
    pub highlight: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ImageFailure {
    pub source: PathBuf,
    pub error: ImageError,
}

/// Outcome of a completed run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub images: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub batches: usize,
    pub rendered: Vec<RenderedAsset>,
    pub failures: Vec<ImageFailure>,
}

/// Drives one thumbnail run with an injected detector.
pub struct Pipeline<D> {
    detector: D,
    options: PipelineOptions,
    renderer: ThumbnailRenderer,
    phase: Phase,
}

impl<D: FaceDetector> Pipeline<D> {
    pub fn new(detector: D, options: PipelineOptions) -> Self {
        let renderer = ThumbnailRenderer::new(options.format);
        Self {
            detector,
            options,
            renderer,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "pipeline phase");
        self.phase = phase;
    }

    /// Fail with [`PipelineError::Deadline`] once `deadline` has passed.
    fn check_deadline(&self, deadline: Option<Instant>) -> Result<(), PipelineError> {
        match (deadline, self.options.deadline) {
            (Some(at), Some(limit)) if Instant::now() >= at => Err(PipelineError::Deadline {
                phase: self.phase,
                limit,
            }),
            _ => Ok(()),
        }
    }

    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();
        // An unrepresentable deadline is treated as no deadline.
        let deadline = self
            .options
            .deadline
            .and_then(|limit| Instant::now().checked_add(limit));

        self.enter(Phase::Walking);
        let images = walk_images(&self.options.input_dir, Some(&self.options.scratch_dir))?;
        report.images = images.len();

        let mut cache = FaceCache::load(&self.options.cache_path)?;
        self.enter(Phase::CacheLoaded);

        let keys: Vec<String> = images.iter().map(|img| img.key.clone()).collect();
        let misses = cache.missing(&keys);
        report.cache_misses = misses.len();
        report.cache_hits = images.len() - misses.len();
        tracing::info!(
            images = images.len(),
            hits = report.cache_hits,
            misses = report.cache_misses,
            cache = %self.options.cache_path.display(),
            "face cache loaded"
        );

        // Sources that could not be read for detection; reported once, never rendered.
        let mut unreadable = HashSet::new();

        if !misses.is_empty() {
            self.enter(Phase::Detecting);
            report.batches = self
                .detect_misses(&misses, &mut cache, &mut unreadable, &mut report.failures, deadline)
                .await?;
            cache.persist(&self.options.cache_path)?;
            self.enter(Phase::CachePersisted);
        }

        self.enter(Phase::Rendering);
        if self.options.dry_run {
            std::fs::create_dir_all(&self.options.scratch_dir).map_err(|source| {
                PipelineError::Scratch {
                    path: self.options.scratch_dir.clone(),
                    source,
                }
            })?;
        }

        let mut written = HashSet::new();
        for image in &images {
            if unreadable.contains(&image.key) {
                continue;
            }
            self.check_deadline(deadline)?;
            match self.render_one(image, &cache, &mut written, &mut report.failures) {
                Ok(asset) => {
                    tracing::info!(
                        source = %image.path.display(),
                        thumbnail = %asset.thumbnail.display(),
                        highlight = ?asset.highlight,
                        "thumbnail written"
                    );
                    report.rendered.push(asset);
                }
                Err(error) => {
                    tracing::warn!(source = %image.path.display(), %error, "skipping image");
                    report.failures.push(ImageFailure {
                        source: image.path.clone(),
                        error,
                    });
                }
            }
        }

        self.enter(Phase::Done);
        tracing::info!(
            rendered = report.rendered.len(),
            failed = report.failures.len(),
            "run complete"
        );
        Ok(report)
    }

    /// Detect every miss in fixed-size batches and merge the results.
    ///
    /// Nothing is merged unless every batch succeeds, so a failure here
    /// leaves the cache exactly as it was loaded.
    async fn detect_misses(
        &self,
        misses: &[String],
        cache: &mut FaceCache,
        unreadable: &mut HashSet<String>,
        failures: &mut Vec<ImageFailure>,
        deadline: Option<Instant>,
    ) -> Result<usize, PipelineError> {
        let batches = chunks_of(misses, self.options.batch_size);
        let total = batches.len();
        let mut detected = Vec::with_capacity(misses.len());
        let mut issued = 0;

        for (index, batch) in batches.into_iter().enumerate() {
            self.check_deadline(deadline)?;
            let mut keys = Vec::with_capacity(batch.len());
            let mut payloads = Vec::with_capacity(batch.len());
            for key in batch {
                let path = self.options.input_dir.join(key);
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        keys.push(key.clone());
                        payloads.push(bytes);
                    }
                    Err(e) => {
                        tracing::warn!(source = %path.display(), error = %e, "cannot read image for detection");
                        unreadable.insert(key.clone());
                        failures.push(ImageFailure {
                            source: path,
                            error: ImageError::Read(e),
                        });
                    }
                }
            }
            if payloads.is_empty() {
                continue;
            }

            tracing::info!(batch = index + 1, of = total, images = payloads.len(), "detecting faces");
            let boxes = self.detector.detect(&payloads).await?;
            issued += 1;

            // Results are matched back purely by position.
            if boxes.len() != payloads.len() {
                return Err(DetectError::LengthMismatch {
                    expected: payloads.len(),
                    actual: boxes.len(),
                }
                .into());
            }
            for (key, bbox) in keys.iter().zip(&boxes) {
                tracing::debug!(key = %key, ?bbox, "face detected");
            }
            detected.extend(keys.into_iter().zip(boxes));
        }

        cache.merge(detected);
        Ok(issued)
    }

    /// Render the thumbnail, then the optional highlight.
    ///
    /// Once the thumbnail is on disk the image counts as rendered; a failed
    /// highlight is pushed to `failures` on its own.
    fn render_one(
        &self,
        image: &SourceImage,
        cache: &FaceCache,
        written: &mut HashSet<PathBuf>,
        failures: &mut Vec<ImageFailure>,
    ) -> Result<RenderedAsset, ImageError> {
        let face = cache.get(&image.key).ok_or(ImageError::NotDetected)?;
        let (thumbnail_path, highlight_path) = self.output_paths(image);
        if written.contains(&thumbnail_path) {
            return Err(ImageError::Collision(thumbnail_path));
        }

        let bytes = std::fs::read(&image.path).map_err(ImageError::Read)?;
        let decoded = render::decode(&bytes)?;
        let plan = planner::plan(&face, decoded.width(), decoded.height());
        tracing::debug!(key = %image.key, ?plan, "crop planned");

        let thumbnail = self.renderer.render_thumbnail(&decoded, &plan)?;
        write_output(&thumbnail_path, &thumbnail)?;
        written.insert(thumbnail_path.clone());

        let highlight = if self.options.highlight {
            let outcome = self
                .renderer
                .render_highlight(&decoded, &plan)
                .map_err(ImageError::from)
                .and_then(|preview| write_output(&highlight_path, &preview));
            match outcome {
                Ok(()) => Some(highlight_path),
                Err(error) => {
                    tracing::warn!(source = %image.path.display(), %error, "highlight not written");
                    failures.push(ImageFailure {
                        source: image.path.clone(),
                        error,
                    });
                    None
                }
            }
        } else {
            None
        };

        Ok(RenderedAsset {
            source: image.path.clone(),
            thumbnail: thumbnail_path,
            highlight,
        })
    }

    /// Thumbnail and highlight destinations for `image`.
    ///
    /// In place, the fixed names land next to the source. In a dry run they
    /// go to the scratch directory, prefixed with the flattened source path.
    fn output_paths(&self, image: &SourceImage) -> (PathBuf, PathBuf) {
        let ext = self.options.format.extension();
        if self.options.dry_run {
            let prefix = scratch_prefix(&image.key);
            let dir = &self.options.scratch_dir;
            (
                dir.join(format!("{prefix}-{THUMBNAIL_STEM}.{ext}")),
                dir.join(format!("{prefix}-{HIGHLIGHT_STEM}.{ext}")),
            )
        } else {
            let dir = image.path.parent().unwrap_or(Path::new("."));
            (
                dir.join(format!("{THUMBNAIL_STEM}.{ext}")),
                dir.join(format!("{HIGHLIGHT_STEM}.{ext}")),
            )
        }
    }
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), ImageError> {
    std::fs::write(path, bytes).map_err(|source| ImageError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Flatten a cache key into a single file name.
///
/// `/` becomes `_`; literal `_` and `%` are percent-escaped so distinct keys
/// never share a prefix.
fn scratch_prefix(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '/' => out.push('_'),
            '_' => out.push_str("%5F"),
            '%' => out.push_str("%25"),
            c => out.push(c),
        }
    }
    out
}

/// List every visible source image under `root`, sorted by key.
///
/// Hidden files and directories are skipped, as are the pipeline's own
/// outputs, files without a raster extension and anything under `exclude`.
pub fn walk_images(root: &Path, exclude: Option<&Path>) -> Result<Vec<SourceImage>, PipelineError> {
    // Compare resolved paths, so `./scratch` or `a/../scratch` still match.
    let excluded = exclude.and_then(|ex| std::fs::canonicalize(ex).ok());
    let resolved_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let is_excluded = |entry: &DirEntry| match &excluded {
        Some(ex) => entry
            .path()
            .strip_prefix(root)
            .is_ok_and(|rel| resolved_root.join(rel).starts_with(ex)),
        None => false,
    };

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(is_hidden(e) || is_excluded(e)));

    let mut images = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| PipelineError::Walk {
            path: source.path().unwrap_or(root).to_path_buf(),
            source,
        })?;
        // Symlinks are followed only when they resolve to a regular file.
        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if is_file && is_source_image(entry.path()) {
            images.push(SourceImage {
                key: cache_key(root, entry.path()),
                path: entry.into_path(),
            });
        }
    }
    images.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(images)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Raster file that is not one of the pipeline's own outputs, in place
/// (`thumbnail.jpg`) or prefixed from a dry run (`a_b.png-thumbnail.jpg`).
fn is_source_image(path: &Path) -> bool {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let is_output = [THUMBNAIL_STEM, HIGHLIGHT_STEM]
        .iter()
        .any(|output| stem == *output || stem.ends_with(&format!("-{output}")));
    if is_output {
        return false;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

fn cache_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
