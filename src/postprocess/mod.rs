mod exec;
mod ffmpeg;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PostProcessError;

pub use exec::{ExecContext, run_exec, shell_quote, substitute_exec};
pub use ffmpeg::{FfmpegOptions, FfmpegPostProcessor, TagContext, build_args, codec_for_extension};

/// Rewrites a committed media file in place
///
/// The returned path may differ from `input` when the container changes.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, input: &Path, tags: &TagContext) -> Result<PathBuf, PostProcessError>;
}
