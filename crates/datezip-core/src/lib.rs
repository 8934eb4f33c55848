pub mod archive;
pub mod batch;
pub mod bucket;
pub mod cancel;
pub mod date;
pub mod error;
pub mod input;
pub mod output;
pub mod progress;
pub mod transcode;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::archive::{Layout, Naming, Package};
use crate::batch::{Pipeline, Session};
use crate::date::{DateField, ExifDateExtractor};
use crate::error::BatchError;
use crate::transcode::{ImageTranscoder, TranscodePolicy, DEFAULT_DECODE_TIMEOUT};

pub use crate::cancel::{CancellationToken, CancelledError};
pub use crate::progress::{ProgressCallback, ThrottledProgress};

/// How often `convert` looks at its cancellation token while waiting.
const CANCEL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// Apply the max_width/max_height resize policy
    pub compress: bool,
    pub max_width: u32,
    pub max_height: u32,
    /// Date-partitioned archive layout instead of flat
    pub organize: bool,
    pub date_field: DateField,
    pub archive_name: Option<String>,
    pub root_folder: Option<String>,
    pub decode_timeout_secs: u64,
    /// Worker threads; 0 means one per CPU
    pub threads: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        let policy = TranscodePolicy::default();
        Self {
            inputs: Vec::new(),
            output: PathBuf::from("."),
            compress: policy.compress,
            max_width: policy.max_width,
            max_height: policy.max_height,
            organize: false,
            date_field: DateField::default(),
            archive_name: None,
            root_folder: None,
            decode_timeout_secs: DEFAULT_DECODE_TIMEOUT.as_secs(),
            threads: 0,
        }
    }
}

impl ConvertOptions {
    /// Load options from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open config {}", path.display()))?;
        let options = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(options)
    }

    pub fn policy(&self) -> TranscodePolicy {
        TranscodePolicy {
            max_width: self.max_width,
            max_height: self.max_height,
            compress: self.compress,
        }
    }

    pub fn layout(&self) -> Layout {
        if self.organize {
            Layout::Organized
        } else {
            Layout::Flat
        }
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertResult {
    pub total: u64,
    pub converted: u64,
    pub failed: u64,
    pub undated: u64,
    /// Where the package was written
    pub output: PathBuf,
    /// False when the single-file shortcut was taken
    pub archived: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Control options for a conversion run.
#[derive(Debug, Clone, Default)]
pub struct ConvertControl {
    pub cancel_token: Option<CancellationToken>,
}

impl ConvertControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Convert every input, package the batch and save it under `options.output`.
pub fn convert(
    options: &ConvertOptions,
    progress_callback: Arc<ProgressCallback>,
) -> anyhow::Result<ConvertResult> {
    convert_with_control(options, &ConvertControl::default(), progress_callback)
}

pub fn convert_with_control(
    options: &ConvertOptions,
    control: &ConvertControl,
    progress_callback: Arc<ProgressCallback>,
) -> anyhow::Result<ConvertResult> {
    let started = Instant::now();
    if let Some(ref token) = control.cancel_token {
        token.check()?;
    }

    let mut warnings = Vec::new();
    let mut selection = Vec::with_capacity(options.inputs.len());
    for path in &options.inputs {
        match input::read_selection(path) {
            Ok(entry) => selection.push(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read input; skipping");
                warnings.push(format!("{}: {}", path.display(), e));
            }
        }
    }
    let unreadable = warnings.len() as u64;
    if selection.is_empty() {
        anyhow::bail!("no readable input files");
    }

    let pipeline = Pipeline {
        transcoder: Arc::new(ImageTranscoder::new(options.decode_timeout())),
        extractor: Arc::new(ExifDateExtractor::new(options.date_field)),
        policy: options.policy(),
    };
    let session = Session::with_progress(
        pipeline,
        options.threads,
        ThrottledProgress::new(progress_callback),
    )?;

    let batch = session.select(selection);
    let outcome = loop {
        match batch.wait_timeout(CANCEL_POLL) {
            Err(BatchError::TimedOut(_)) => {
                if let Some(ref token) = control.cancel_token {
                    if token.is_cancelled() {
                        session.cancel();
                        return Err(CancelledError.into());
                    }
                }
            }
            other => break other?,
        }
    };

    for failure in &outcome.failures {
        warnings.push(format!("{}: {}", failure.name, failure.error));
    }
    let converted = outcome.tree.len() as u64;
    let undated = outcome
        .tree
        .walk()
        .filter(|(_, r)| r.date.is_none())
        .count() as u64;
    let failed = outcome.failures.len() as u64 + unreadable;
    let total = outcome.total as u64 + unreadable;

    let naming = Naming::resolve(options.root_folder.as_deref(), options.archive_name.as_deref());
    let package = archive::package(outcome.tree, outcome.total, options.layout(), &naming)?;
    let archived = matches!(package, Package::Archive { .. });
    let output = output::save_package(package, &options.output)?;

    tracing::info!(
        total,
        converted,
        failed,
        undated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Conversion finished"
    );

    Ok(ConvertResult {
        total,
        converted,
        failed,
        undated,
        output,
        archived,
        warnings,
    })
}
