use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::retry::RetryPolicy;

pub const SEGMENT_SIZE_MIN: usize = 100;
pub const SEGMENT_SIZE_MAX: usize = 5000;
pub const DEFAULT_LANGUAGE: &str = "en";
pub const AUTOSAVE_EVERY: usize = 100;
const CHECKPOINT_SUFFIX: &str = ".resume";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Segment a text file, unless a checkpoint for the output already exists.
    TextFile(PathBuf),
    /// Continue from an existing checkpoint archive.
    Checkpoint,
}

/// Everything one pipeline run needs, resolved up front.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: InputSource,
    pub output: PathBuf,
    pub checkpoint: PathBuf,
    pub language: String,
    pub segment_size: usize,
    pub autosave_every: usize,
    pub retry: RetryPolicy,
    /// Directory for standalone audio payloads.
    pub scratch_dir: PathBuf,
    pub show_progress: bool,
}

impl PipelineConfig {
    pub fn new(source: InputSource, output: PathBuf, checkpoint: PathBuf) -> Self {
        Self {
            source,
            output,
            checkpoint,
            language: DEFAULT_LANGUAGE.to_string(),
            segment_size: SEGMENT_SIZE_MAX,
            autosave_every: AUTOSAVE_EVERY,
            retry: RetryPolicy::default(),
            scratch_dir: std::env::temp_dir(),
            show_progress: true,
        }
    }

    /// Checks that the files the run starts from are present.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match &self.source {
            InputSource::TextFile(path) if !path.is_file() => Err(
                PipelineError::Validation(format!("file {} does not exist", path.display())),
            ),
            InputSource::Checkpoint if !self.checkpoint.is_file() => {
                Err(PipelineError::Validation(format!(
                    "recover file {} does not exist",
                    self.checkpoint.display()
                )))
            }
            _ => Ok(()),
        }
    }
}

pub fn clamp_segment_size(requested: usize) -> usize {
    requested.clamp(SEGMENT_SIZE_MIN, SEGMENT_SIZE_MAX)
}

/// `<output>.resume`, next to the output file.
pub fn default_checkpoint_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(CHECKPOINT_SUFFIX);
    PathBuf::from(name)
}
