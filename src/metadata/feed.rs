// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;
use crate::feed::Feed;

use super::text::plain_text;

/// Serializable metadata for a podcast feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub feed_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub updated_at: String,
}

impl FeedMetadata {
    pub fn from_feed(feed: &Feed) -> Self {
        Self {
            title: feed.title.clone(),
            description: feed
                .description
                .as_deref()
                .map(plain_text)
                .filter(|d| !d.is_empty()),
            link: feed.link.clone(),
            feed_url: feed.feed_url.to_string(),
            author: feed.author.clone(),
            image_url: feed.image_url.clone(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Write feed metadata as pretty JSON; see [`super::write_item_meta`] for `override_existing`
pub async fn write_feed_meta(
    feed: &Feed,
    path: &Path,
    override_existing: bool,
) -> Result<bool, MetadataError> {
    if !override_existing && tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::debug!(path = %path.display(), "feed metadata exists, leaving it");
        return Ok(false);
    }

    let json = serde_json::to_string_pretty(&FeedMetadata::from_feed(feed))?;
    super::write_file(path, json).await?;
    Ok(true)
}

pub async fn read_feed_meta(path: &Path) -> Result<FeedMetadata, MetadataError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use url::Url;

    fn make_feed() -> Feed {
        Feed {
            title: "Test Podcast".to_string(),
            description: Some("A <b>test</b> podcast".to_string()),
            link: Some("https://example.com".to_string()),
            author: Some("Test Author".to_string()),
            image_url: Some("https://example.com/image.jpg".to_string()),
            feed_url: Url::parse("https://example.com/feed.xml").unwrap(),
            items: vec![],
        }
    }

    #[test]
    fn from_feed_converts_all_fields() {
        let metadata = FeedMetadata::from_feed(&make_feed());

        assert_eq!(metadata.title, "Test Podcast");
        assert_eq!(metadata.description, Some("A test podcast".to_string()));
        assert_eq!(metadata.link, Some("https://example.com".to_string()));
        assert_eq!(metadata.author, Some("Test Author".to_string()));
        assert_eq!(
            metadata.image_url,
            Some("https://example.com/image.jpg".to_string())
        );
        assert_eq!(metadata.feed_url, "https://example.com/feed.xml");
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Test Podcast.meta.json");

        assert!(write_feed_meta(&make_feed(), &path, false).await.unwrap());
        let read_back = read_feed_meta(&path).await.unwrap();

        assert_eq!(read_back.title, "Test Podcast");
        assert!(!write_feed_meta(&make_feed(), &path, false).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.meta.json");
        std::fs::write(&path, "not json").unwrap();

        let result = read_feed_meta(&path).await;
        assert!(matches!(result, Err(MetadataError::JsonParseFailed { .. })));
    }
}
