mod feed;
mod item;
mod text;

use std::path::Path;

use crate::error::MetadataError;

pub use feed::{FeedMetadata, read_feed_meta, write_feed_meta};
pub use item::{ItemMetadata, read_item_meta, write_item_meta};
pub use text::plain_text;

/// Suffix appended to an artifact stem for its metadata document
pub const METADATA_EXTENSION: &str = ".meta.json";

async fn write_file(path: &Path, contents: String) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MetadataError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    tokio::fs::write(path, contents)
        .await
        .map_err(|e| MetadataError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}
