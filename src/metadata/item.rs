// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;
use crate::feed::FeedItem;

use super::text::plain_text;

/// Serializable metadata for a downloaded feed item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    pub audio_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub downloaded_at: String,
}

impl ItemMetadata {
    pub fn from_item(item: &FeedItem, audio_filename: &str, content_hash: Option<String>) -> Self {
        Self {
            title: item.title.clone(),
            pub_date: item.pub_date.map(|dt| dt.to_rfc3339()),
            creator: item.author.clone(),
            guid: item.guid.clone(),
            description: item
                .description
                .as_deref()
                .map(plain_text)
                .filter(|d| !d.is_empty()),
            duration: item.duration.clone(),
            season: item.season_number,
            episode: item.episode_number,
            audio_filename: audio_filename.to_string(),
            content_hash,
            downloaded_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Write item metadata as pretty JSON
///
/// An existing file is left alone unless `override_existing` is set.
/// Returns whether the file was written.
pub async fn write_item_meta(
    item: &FeedItem,
    audio_filename: &str,
    content_hash: Option<String>,
    path: &Path,
    override_existing: bool,
) -> Result<bool, MetadataError> {
    if !override_existing && tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::debug!(path = %path.display(), "item metadata exists, leaving it");
        return Ok(false);
    }

    let metadata = ItemMetadata::from_item(item, audio_filename, content_hash);
    let json = serde_json::to_string_pretty(&metadata)?;
    super::write_file(path, json).await?;
    Ok(true)
}

/// Read item metadata from a JSON file
pub async fn read_item_meta(path: &Path) -> Result<ItemMetadata, MetadataError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MetadataError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    serde_json::from_str(&content).map_err(|e| MetadataError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}
