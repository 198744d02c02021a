// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod archive;
pub mod download;
pub mod error;
pub mod feed;
pub mod http;
pub mod items;
pub mod media;
pub mod metadata;
pub mod naming;
pub mod orchestrator;
pub mod postprocess;
pub mod progress;

// Re-export main types for convenience
pub use archive::{ArchiveKey, ArchiveLedger, ArchiveRegistry, ArchiveTarget, archive_filename, archive_keys};
pub use download::{AfterDownload, Committed, DownloadOutcome, DownloadTask, Downloader, SkipReason};
pub use error::{
    ArchiveError, DownloadError, FeedError, ItemError, MetadataError, NamingError,
    PostProcessError, RunError,
};
pub use feed::{Enclosure, Feed, FeedItem, archive_prefix, fetch_feed, is_url, parse_feed, parse_feed_file};
pub use http::{HttpClient, HttpConfig, HttpResponse, ReqwestClient};
pub use items::{ItemFilter, ListEntry, list_entries, select_items};
pub use media::{MediaCategory, ResolvedMedia, SourceKind, resolve_audio};
pub use naming::{NamingOptions, render_folder, render_item_path};
pub use orchestrator::{ItemContext, Orchestrator, RunOptions, RunSummary, Stage};
pub use postprocess::{FfmpegOptions, FfmpegPostProcessor, PostProcessor, TagContext};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
