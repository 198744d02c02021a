// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Events emitted while downloading feed items, for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Feed is being fetched from URL
    FetchingFeed { url: String },

    /// Target items have been selected from the feed
    ItemsSelected {
        podcast_title: String,
        total_items: usize,
        to_download: usize,
    },

    /// A download is starting
    DownloadStarting {
        /// Log marker of the artifact (item title, or the artifact URL)
        marker: String,
        /// 1-based attempt number
        attempt: u32,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update, throttled by time
    DownloadProgress {
        marker: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A download was committed to its final path
    DownloadCompleted {
        marker: String,
        bytes_downloaded: u64,
    },

    /// A download was skipped because it exists locally or in the archive
    DownloadSkipped { marker: String, reason: String },

    /// An item failed at some stage
    ItemFailed { marker: String, error: String },

    /// The run completed
    RunCompleted {
        succeeded: usize,
        attempted: usize,
        had_errors: bool,
    },
}

/// Trait for reporting progress events during a run.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Default interval between two byte-progress events of one download
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Time-based gate for progress events.
///
/// The first call always passes; later calls pass once `interval` has
/// elapsed since the last one that passed.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
