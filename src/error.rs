// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} while fetching feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors raised while building naming options
#[derive(Error, Debug)]
pub enum NamingError {
    #[error("Invalid custom template pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised by the archive ledger
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to read archive {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive {path} is corrupt and cannot be parsed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write archive {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize archive {path}: {source}")]
    SerializeFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur during a single artifact download
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Timed out after {seconds}s waiting for {url}")]
    Timeout { url: String, seconds: u64 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download of {url} produced an empty file; verify permissions and free space")]
    EmptyFile { url: String },

    #[error("Failed to move {from} into place at {to}: {source}")]
    CommitFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error writing to archive: {0}")]
    Archive(#[from] ArchiveError),
}

impl DownloadError {
    /// Whether another attempt may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::HttpFailed { .. }
                | DownloadError::HttpStatus { .. }
                | DownloadError::Timeout { .. }
                | DownloadError::StreamFailed { .. }
                | DownloadError::FileCreateFailed { .. }
                | DownloadError::FileWriteFailed { .. }
        )
    }
}

/// Errors that can occur during metadata operations
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Failed to read metadata file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write metadata file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse metadata JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize metadata: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Error writing to archive: {0}")]
    Archive(#[from] ArchiveError),
}

/// Errors from external post-processing commands
#[derive(Error, Debug)]
pub enum PostProcessError {
    #[error("Input file {0} does not exist")]
    MissingInput(PathBuf),

    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}")]
    ExitStatus { program: String, code: Option<i32> },

    #[error("Failed to replace {path} with processed output: {source}")]
    ReplaceFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors local to a single feed item; folded into the run summary
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("Unable to find episode download URL")]
    NoMediaUrl,

    #[error("Error downloading {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: DownloadError,
    },

    #[error("Error running post-processing: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("Unable to save episode metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Failed to remove {path}: {source}")]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{url} would be written over the episode at {}", path.display())]
    PathCollision { url: String, path: PathBuf },

    #[error("Worker for this item panicked")]
    WorkerPanicked,
}

/// Errors that abort a whole run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),
}
