// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! At-most-once ledger of produced artifacts, persisted as a JSON array.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tokio::sync::Mutex;

use crate::error::ArchiveError;

/// Opaque identity of an artifact that has been produced before
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    /// `"{prefix}-{name}"`
    pub fn new(prefix: &str, name: &str) -> Self {
        Self(format!("{}-{}", prefix, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Twin key with `from` replaced by `to` at the end, if the key ends in `from`
    pub fn with_extension(&self, from: &str, to: &str) -> Option<Self> {
        self.0
            .strip_suffix(from)
            .map(|base| Self(format!("{}{}", base, to)))
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArchiveKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Candidate keys of one artifact: the legacy name key, then the GUID key
pub fn archive_keys(prefix: &str, name: Option<&str>, guid: Option<&str>) -> Vec<ArchiveKey> {
    [name, guid]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .map(|part| ArchiveKey::new(prefix, part))
        .collect()
}

/// Legacy artifact name: `YYYYMMDD-{title}{ext}`, or `{title}{ext}` when undated
pub fn archive_filename(
    pub_date: Option<&DateTime<FixedOffset>>,
    name: &str,
    ext: &str,
) -> String {
    match pub_date {
        Some(date) => format!("{}-{}{}", date.format("%Y%m%d"), name, ext),
        None => format!("{}{}", name, ext),
    }
}

/// Where and under which candidate keys an artifact is archived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub path: PathBuf,
    pub keys: Vec<ArchiveKey>,
}

/// Full set of keys recorded in one archive file
#[derive(Debug, Default)]
pub struct ArchiveLedger {
    path: PathBuf,
    // Insertion order is kept so rewrites produce stable diffs
    entries: Vec<String>,
    index: HashSet<String>,
    dirty: bool,
}

impl ArchiveLedger {
    /// Load a ledger; a missing file is an empty ledger, an unparsable one an error
    pub async fn load(path: &Path) -> Result<Self, ArchiveError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path: path.to_path_buf(),
                    ..Default::default()
                });
            }
            Err(e) => {
                return Err(ArchiveError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let entries: Vec<String> =
            serde_json::from_slice(&content).map_err(|e| ArchiveError::Corrupt {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut ledger = Self {
            path: path.to_path_buf(),
            ..Default::default()
        };
        for entry in entries {
            if ledger.index.insert(entry.clone()) {
                ledger.entries.push(entry);
            }
        }

        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any of the candidate keys is recorded
    pub fn contains_any(&self, keys: &[ArchiveKey]) -> bool {
        keys.iter().any(|key| self.index.contains(key.as_str()))
    }

    /// Insert keys not yet present; returns whether anything was added
    pub fn insert(&mut self, keys: &[ArchiveKey]) -> bool {
        let mut added = false;
        for key in keys {
            if self.index.insert(key.as_str().to_string()) {
                self.entries.push(key.as_str().to_string());
                added = true;
            }
        }
        self.dirty |= added;
        added
    }

    /// Write the ledger if it changed since the last flush
    ///
    /// The whole array is written to a `.tmp` sibling and renamed over the
    /// archive file, so a crash mid-write never truncates the ledger.
    pub async fn flush(&mut self) -> Result<bool, ArchiveError> {
        if !self.dirty {
            return Ok(false);
        }

        let json = self.to_pretty_json()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchiveError::WriteFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ArchiveError::WriteFailed {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ArchiveError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })?;

        self.dirty = false;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "archive written");
        Ok(true)
    }

    fn to_pretty_json(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut out = Vec::new();
        let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        self.entries
            .serialize(&mut serializer)
            .map_err(|e| ArchiveError::SerializeFailed {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(out)
    }
}

/// Process-local registry of loaded ledgers, one per archive path
///
/// Each ledger sits behind its own mutex, so insert-and-flush is serialized
/// per archive while different archives proceed independently.
#[derive(Debug, Default)]
pub struct ArchiveRegistry {
    ledgers: Mutex<HashMap<PathBuf, Arc<Mutex<ArchiveLedger>>>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the ledger at `path`, loading it on first use
    pub async fn ledger(&self, path: &Path) -> Result<Arc<Mutex<ArchiveLedger>>, ArchiveError> {
        let mut ledgers = self.ledgers.lock().await;
        if let Some(ledger) = ledgers.get(path) {
            return Ok(ledger.clone());
        }

        let ledger = Arc::new(Mutex::new(ArchiveLedger::load(path).await?));
        ledgers.insert(path.to_path_buf(), ledger.clone());
        Ok(ledger)
    }

    /// Load the ledger eagerly so corruption surfaces before any work starts
    pub async fn load(&self, path: &Path) -> Result<usize, ArchiveError> {
        let ledger = self.ledger(path).await?;
        let len = ledger.lock().await.len();
        Ok(len)
    }

    pub async fn is_archived(&self, keys: &[ArchiveKey], path: &Path) -> Result<bool, ArchiveError> {
        if keys.is_empty() {
            return Ok(false);
        }
        let ledger = self.ledger(path).await?;
        let archived = ledger.lock().await.contains_any(keys);
        Ok(archived)
    }

    /// Record keys and flush if anything new was added
    ///
    /// Returns whether the archive file was rewritten.
    pub async fn record(&self, keys: &[ArchiveKey], path: &Path) -> Result<bool, ArchiveError> {
        if keys.is_empty() {
            return Ok(false);
        }
        let ledger = self.ledger(path).await?;
        let mut ledger = ledger.lock().await;
        ledger.insert(keys);
        ledger.flush().await
    }

    /// Snapshot check used during item selection
    pub async fn is_target_archived(&self, target: &ArchiveTarget) -> Result<bool, ArchiveError> {
        self.is_archived(&target.keys, &target.path).await
    }
}
