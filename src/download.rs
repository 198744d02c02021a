// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::archive::{ArchiveKey, ArchiveRegistry, ArchiveTarget};
use crate::error::DownloadError;
use crate::http::{HttpClient, HttpConfig, ProbeResponse};
use crate::media::corrected_extension;
use crate::naming::{DEFAULT_MAX_LENGTH, TEMP_SUFFIX, safe_filename};
use crate::progress::{
    DEFAULT_PROGRESS_INTERVAL, ProgressEvent, ProgressThrottle, SharedProgressReporter,
};

/// Everything needed to fetch one artifact
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    /// Archive file and candidate keys; `None` disables archiving
    pub archive: Option<ArchiveTarget>,
    /// Total number of transfer attempts, at least one
    pub max_attempts: u32,
    /// Download even if the destination already exists
    pub override_existing: bool,
    /// Keep the chosen extension regardless of the served content type
    pub trust_extension: bool,
    /// Run the hook on files that already exist locally
    pub always_postprocess: bool,
    /// Prefix for log lines and progress events
    pub marker: String,
    /// Byte limit of the file name, kept when the extension is corrected
    pub max_name_length: usize,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            archive: None,
            max_attempts: 3,
            override_existing: false,
            trust_extension: false,
            always_postprocess: false,
            marker: String::new(),
            max_name_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// Why a download did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ExistsLocally,
    Archived,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::ExistsLocally => "file already exists",
            SkipReason::Archived => "exists in archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded {
        path: PathBuf,
        bytes: u64,
        /// `sha256:<hex>` of the streamed bytes
        content_hash: String,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
}

impl DownloadOutcome {
    pub fn path(&self) -> &Path {
        match self {
            DownloadOutcome::Downloaded { path, .. } | DownloadOutcome::Skipped { path, .. } => {
                path
            }
        }
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadOutcome::Downloaded { .. })
    }
}

/// A file in its final place, handed to the [`AfterDownload`] hook
#[derive(Debug, Clone, Copy)]
pub struct Committed<'a> {
    pub path: &'a Path,
    pub url: &'a str,
    /// Present only when the file was just downloaded
    pub content_hash: Option<&'a str>,
}

/// Side effects that run once a file is committed, before it is archived
#[async_trait]
pub trait AfterDownload: Send + Sync {
    async fn after_download(&self, committed: Committed<'_>);
}

/// Result of one successful transfer into the temp file
struct Transfer {
    bytes: u64,
    content_hash: String,
    content_type: Option<String>,
    expected_length: Option<u64>,
}

/// Fetches single artifacts with retries, atomic commit and archiving
pub struct Downloader<C: ?Sized> {
    client: Arc<C>,
    archive: Arc<ArchiveRegistry>,
    reporter: SharedProgressReporter,
    config: HttpConfig,
    progress_interval: Duration,
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: HttpClient + ?Sized> Downloader<C> {
    pub fn new(
        client: Arc<C>,
        archive: Arc<ArchiveRegistry>,
        reporter: SharedProgressReporter,
        config: HttpConfig,
    ) -> Self {
        Self {
            client,
            archive,
            reporter,
            config,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn archive(&self) -> &Arc<ArchiveRegistry> {
        &self.archive
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn destination_lock(&self, destination: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(destination.to_path_buf()).or_default().clone()
    }

    /// Drop the lock entry of `destination` once no other task holds it
    fn release_lock(&self, destination: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(destination)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(destination);
        }
    }

    /// Download one artifact
    ///
    /// The file is streamed into a `.tmp` sibling and only renamed into place
    /// once it is complete and non-empty. The hook runs on the committed file,
    /// then every candidate archive key is recorded.
    pub async fn download(
        &self,
        task: &DownloadTask,
        hook: Option<&dyn AfterDownload>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let lock = self.destination_lock(&task.destination);
        let result = {
            let _guard = lock.lock().await;
            self.download_locked(task, hook).await
        };
        self.release_lock(&task.destination, lock);
        result
    }

    async fn download_locked(
        &self,
        task: &DownloadTask,
        hook: Option<&dyn AfterDownload>,
    ) -> Result<DownloadOutcome, DownloadError> {
        if !task.override_existing && tokio::fs::try_exists(&task.destination).await.unwrap_or(false)
        {
            if task.always_postprocess
                && let Some(hook) = hook
            {
                hook.after_download(Committed {
                    path: &task.destination,
                    url: &task.url,
                    content_hash: None,
                })
                .await;
            }
            return Ok(self.skipped(task, SkipReason::ExistsLocally));
        }

        if let Some(target) = &task.archive
            && self.archive.is_target_archived(target).await?
        {
            return Ok(self.skipped(task, SkipReason::Archived));
        }

        if let Some(parent) = task.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::CreateDirectoryFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let tmp = temp_path(&task.destination);
        let max_attempts = task.max_attempts.max(1);
        let mut attempt = 1;

        let transfer = loop {
            match self.transfer(task, &tmp, attempt).await {
                Ok(transfer) => break transfer,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    if attempt < max_attempts && e.is_retryable() {
                        tracing::warn!(marker = %task.marker, attempt, error = %e, "download failed, retrying");
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        };

        let on_disk = tokio::fs::metadata(&tmp).await.map(|m| m.len()).unwrap_or(0);
        if on_disk == 0 {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DownloadError::EmptyFile {
                url: task.url.clone(),
            });
        }

        if let Some(expected) = transfer.expected_length
            && expected != on_disk
        {
            tracing::warn!(
                marker = %task.marker,
                expected,
                actual = on_disk,
                "file size differs from Content-Length"
            );
        }

        let mut destination = task.destination.clone();
        let mut keys = task
            .archive
            .as_ref()
            .map(|target| target.keys.clone())
            .unwrap_or_default();

        if !task.trust_extension
            && let Some(current) = dotted_extension(&destination)
            && let Some(corrected) = corrected_extension(&current, transfer.content_type.as_deref())
        {
            tracing::info!(
                marker = %task.marker,
                from = %current,
                to = corrected,
                "correcting file extension from served content type"
            );
            let name = corrected_file_name(&destination, corrected, task.max_name_length);
            destination.set_file_name(name);
            keys = with_extension_twins(keys, &current, corrected);
        }

        if let Err(e) = tokio::fs::rename(&tmp, &destination).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DownloadError::CommitFailed {
                from: tmp,
                to: destination,
                source: e,
            });
        }

        self.reporter.report(ProgressEvent::DownloadCompleted {
            marker: task.marker.clone(),
            bytes_downloaded: transfer.bytes,
        });
        tracing::info!(marker = %task.marker, path = %destination.display(), bytes = transfer.bytes, "download complete");

        if let Some(hook) = hook {
            hook.after_download(Committed {
                path: &destination,
                url: &task.url,
                content_hash: Some(&transfer.content_hash),
            })
            .await;
        }

        if let Some(target) = &task.archive {
            self.archive.record(&keys, &target.path).await?;
        }

        Ok(DownloadOutcome::Downloaded {
            path: destination,
            bytes: transfer.bytes,
            content_hash: transfer.content_hash,
        })
    }

    fn skipped(&self, task: &DownloadTask, reason: SkipReason) -> DownloadOutcome {
        tracing::info!(marker = %task.marker, path = %task.destination.display(), reason = reason.describe(), "skipping download");
        self.reporter.report(ProgressEvent::DownloadSkipped {
            marker: task.marker.clone(),
            reason: reason.describe().to_string(),
        });
        DownloadOutcome::Skipped {
            path: task.destination.clone(),
            reason,
        }
    }

    async fn probe(&self, url: &str) -> Option<ProbeResponse> {
        match timeout(self.config.probe_timeout, self.client.probe(url)).await {
            Ok(Ok(probe)) if probe.status < 400 => Some(probe),
            Ok(Ok(probe)) => {
                tracing::debug!(url, status = probe.status, "probe returned error status");
                None
            }
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "probe failed");
                None
            }
            Err(_) => {
                tracing::debug!(url, "probe timed out");
                None
            }
        }
    }

    /// One attempt: probe, then stream the body into `tmp`
    async fn transfer(
        &self,
        task: &DownloadTask,
        tmp: &Path,
        attempt: u32,
    ) -> Result<Transfer, DownloadError> {
        let url = task.url.as_str();
        let idle = self.config.stream_idle_timeout;
        let timed_out = || DownloadError::Timeout {
            url: url.to_string(),
            seconds: idle.as_secs(),
        };

        let probe = self.probe(url).await;

        let response = timeout(idle, self.client.get_stream(url))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| DownloadError::HttpFailed {
                url: url.to_string(),
                source: e,
            })?;

        if response.status >= 400 {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let expected_length = probe
            .as_ref()
            .and_then(|p| p.content_length)
            .or(response.content_length);
        let content_type = probe
            .and_then(|p| p.content_type)
            .or(response.content_type);

        self.reporter.report(ProgressEvent::DownloadStarting {
            marker: task.marker.clone(),
            attempt,
            content_length: expected_length,
        });

        let mut file = File::create(tmp)
            .await
            .map_err(|e| DownloadError::FileCreateFailed {
                path: tmp.to_path_buf(),
                source: e,
            })?;

        let mut hasher = Sha256::new();
        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.body;

        loop {
            let chunk = match timeout(idle, stream.next()).await {
                Err(_) => return Err(timed_out()),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk.map_err(|e| DownloadError::StreamFailed {
                    url: url.to_string(),
                    source: e,
                })?,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::FileWriteFailed {
                    path: tmp.to_path_buf(),
                    source: e,
                })?;

            hasher.update(&chunk);
            bytes_downloaded += chunk.len() as u64;

            if throttle.ready() {
                self.reporter.report(ProgressEvent::DownloadProgress {
                    marker: task.marker.clone(),
                    bytes_downloaded,
                    total_bytes: expected_length,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: tmp.to_path_buf(),
                source: e,
            })?;

        Ok(Transfer {
            bytes: bytes_downloaded,
            content_hash: format!("sha256:{:x}", hasher.finalize()),
            content_type,
            expected_length,
        })
    }
}

/// `episode.mp3` -> `episode.mp3.tmp`
pub fn temp_path(destination: &Path) -> PathBuf {
    let mut tmp: OsString = destination.as_os_str().to_owned();
    tmp.push(TEMP_SUFFIX);
    PathBuf::from(tmp)
}

/// File name of `path` with its extension swapped, kept within `max_len` bytes
fn corrected_file_name(path: &Path, extension: &str, max_len: usize) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{}{}", stem, extension);
    if name.len() + TEMP_SUFFIX.len() <= max_len {
        name
    } else {
        safe_filename(&stem, extension, max_len)
    }
}

fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
}

/// Keep every key and add a twin for those ending in the replaced extension
fn with_extension_twins(keys: Vec<ArchiveKey>, from: &str, to: &str) -> Vec<ArchiveKey> {
    let twins: Vec<ArchiveKey> = keys
        .iter()
        .filter_map(|key| key.with_extension(from, to))
        .collect();
    keys.into_iter().chain(twins).collect()
}
