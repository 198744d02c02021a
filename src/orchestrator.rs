// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::archive::{ArchiveKey, ArchiveRegistry, ArchiveTarget, archive_filename, archive_keys};
use crate::download::{AfterDownload, Committed, DownloadOutcome, DownloadTask, Downloader};
use crate::error::{ItemError, MetadataError, RunError};
use crate::feed::{Feed, FeedItem, archive_prefix};
use crate::http::{HttpClient, HttpConfig};
use crate::media::{ResolvedMedia, SourceKind, resolve_audio, resolve_image, resolve_transcript};
use crate::metadata::{METADATA_EXTENSION, write_feed_meta, write_item_meta};
use crate::naming::{NamingOptions, episode_number, render_item_path, safe_name};
use crate::postprocess::{
    ExecContext, FfmpegOptions, FfmpegPostProcessor, PostProcessor, TagContext, run_exec,
};
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Default episode file template
pub const DEFAULT_EPISODE_TEMPLATE: &str = "{{release_date}}-{{title}}";

/// Options for a download run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Directory every artifact is written under
    pub out_dir: PathBuf,
    /// Archive file; `None` disables archiving
    pub archive: Option<PathBuf>,
    pub episode_template: String,
    pub naming: NamingOptions,
    /// Preference of media URL sources
    pub source_order: Vec<SourceKind>,
    /// Items processed concurrently
    pub threads: usize,
    /// Transfer attempts per artifact
    pub attempts: u32,
    pub include_episode_meta: bool,
    pub include_episode_images: bool,
    pub include_episode_transcripts: bool,
    /// Preferred transcript MIME types, most wanted first
    pub transcript_types: Vec<String>,
    pub ffmpeg: FfmpegOptions,
    /// Shell command run for every episode
    pub exec: Option<String>,
    pub override_existing: bool,
    pub always_postprocess: bool,
    pub trust_extension: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            archive: None,
            episode_template: DEFAULT_EPISODE_TEMPLATE.to_string(),
            naming: NamingOptions::default(),
            source_order: SourceKind::DEFAULT_ORDER.to_vec(),
            threads: 1,
            attempts: 3,
            include_episode_meta: false,
            include_episode_images: false,
            include_episode_transcripts: false,
            transcript_types: Vec::new(),
            ffmpeg: FfmpegOptions::default(),
            exec: None,
            override_existing: false,
            always_postprocess: false,
            trust_extension: false,
        }
    }
}

/// Result of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Items handed to the run
    pub attempted: usize,
    /// Items whose pipeline ran
    pub succeeded: usize,
    pub had_errors: bool,
    /// Details of failures (marker, error message)
    pub failures: Vec<(String, String)>,
}

impl RunSummary {
    /// 0 on full success, 2 when nothing was downloaded, 3 on partial failure
    pub fn exit_code(&self) -> i32 {
        if self.succeeded == 0 {
            2
        } else if self.had_errors {
            3
        } else {
            0
        }
    }

    /// Fold failures from work outside the item loop into this summary
    pub fn absorb(&mut self, failures: Vec<(String, String)>) {
        self.had_errors |= !failures.is_empty();
        self.failures.extend(failures);
    }
}

/// One step of the per-item pipeline, run after the episode is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Image,
    Transcript,
    PostProcess,
    DiscardImage,
    Exec,
    Metadata,
}

impl Stage {
    /// Stages enabled by `options`, in execution order
    pub fn plan(options: &RunOptions, post_process: bool) -> Vec<Stage> {
        let tagging = post_process && options.ffmpeg.add_metadata;
        let mut stages = Vec::new();

        if options.include_episode_images || tagging {
            stages.push(Stage::Image);
        }
        if options.include_episode_transcripts {
            stages.push(Stage::Transcript);
        }
        if post_process {
            stages.push(Stage::PostProcess);
        }
        if tagging && !options.include_episode_images {
            stages.push(Stage::DiscardImage);
        }
        if options.exec.is_some() {
            stages.push(Stage::Exec);
        }
        if options.include_episode_meta {
            stages.push(Stage::Metadata);
        }

        stages
    }
}

/// Computed state of one item as it moves through the pipeline
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub item: FeedItem,
    pub marker: String,
    /// Primary media URL and the extension chosen for it
    pub media: ResolvedMedia,
    pub episode_number: i64,
    /// Current location of the episode file
    pub episode_path: PathBuf,
    pub content_hash: Option<String>,
    pub image_path: Option<PathBuf>,
}

/// Drives a selection of feed items through download and post-processing
pub struct Orchestrator<C: ?Sized> {
    downloader: Arc<Downloader<C>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    reporter: SharedProgressReporter,
    options: Arc<RunOptions>,
}

impl<C: HttpClient + ?Sized + 'static> Orchestrator<C> {
    pub fn new(
        client: Arc<C>,
        archive: Arc<ArchiveRegistry>,
        reporter: SharedProgressReporter,
        http: HttpConfig,
        options: RunOptions,
    ) -> Self {
        let post_processor: Option<Arc<dyn PostProcessor>> = options
            .ffmpeg
            .is_active()
            .then(|| Arc::new(FfmpegPostProcessor::new(options.ffmpeg.clone())) as Arc<dyn PostProcessor>);

        Self {
            downloader: Arc::new(Downloader::new(client, archive, reporter.clone(), http)),
            post_processor,
            reporter,
            options: Arc::new(options),
        }
    }

    /// Replace the post processor, or disable post-processing with `None`
    pub fn with_post_processor(mut self, post_processor: Option<Arc<dyn PostProcessor>>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn run_context(&self, feed: &Feed) -> Arc<RunContext<C>> {
        let stages = Stage::plan(&self.options, self.post_processor.is_some());
        Arc::new(RunContext {
            downloader: self.downloader.clone(),
            post_processor: self.post_processor.clone(),
            options: self.options.clone(),
            feed: Arc::new(feed.clone()),
            prefix: archive_prefix(&feed.feed_url),
            stages,
        })
    }

    /// Process `items` of `feed` on a bounded pool of workers
    ///
    /// Failures of single items are collected into the summary; only a
    /// problem with the archive itself aborts the run.
    pub async fn run_all(&self, feed: &Feed, items: &[&FeedItem]) -> Result<RunSummary, RunError> {
        if let Some(archive) = &self.options.archive {
            let entries = self.downloader.archive().load(archive).await?;
            tracing::debug!(path = %archive.display(), entries, "archive loaded");
        }

        self.reporter.report(ProgressEvent::ItemsSelected {
            podcast_title: feed.title.clone(),
            total_items: feed.items.len(),
            to_download: items.len(),
        });

        if items.is_empty() {
            tracing::warn!(podcast = %feed.title, "no episodes found with the provided criteria to download");
        }

        let context = self.run_context(feed);
        let threads = self.options.threads.max(1);

        // The slot pool limits concurrency and hands out stable slot ids for markers
        let (slot_tx, slot_rx) = tokio::sync::mpsc::channel(threads);
        for slot in 0..threads {
            let _ = slot_tx.try_send(slot);
        }
        let slot_rx = Arc::new(Mutex::new(slot_rx));

        let succeeded = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for item in items {
            let Some(slot) = slot_rx.lock().await.recv().await else {
                break;
            };

            let marker = if threads > 1 {
                format!("[{}] {}", slot, item.title)
            } else {
                item.title.clone()
            };

            let context = context.clone();
            let title = item.title.clone();
            let item = (*item).clone();
            let slot_tx = slot_tx.clone();
            let reporter = self.reporter.clone();
            let succeeded = succeeded.clone();
            let failures = failures.clone();
            let span = tracing::info_span!("item", marker = %marker);

            let handle = tokio::spawn(
                async move {
                    let report = context.process_item(item, marker.clone()).await;

                    if report.succeeded {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                    for error in report.errors {
                        tracing::error!(marker = %marker, error = %error, "item error");
                        reporter.report(ProgressEvent::ItemFailed {
                            marker: marker.clone(),
                            error: error.to_string(),
                        });
                        failures.lock().await.push((marker.clone(), error.to_string()));
                    }

                    let _ = slot_tx.send(slot).await;
                }
                .instrument(span),
            );

            handles.push((title, handle));
        }

        for (title, handle) in handles {
            if handle.await.is_err() {
                let error = ItemError::WorkerPanicked;
                tracing::error!(marker = %title, error = %error, "item error");
                self.reporter.report(ProgressEvent::ItemFailed {
                    marker: title.clone(),
                    error: error.to_string(),
                });
                failures.lock().await.push((title, error.to_string()));
            }
        }

        let failures = std::mem::take(&mut *failures.lock().await);
        let summary = RunSummary {
            attempted: items.len(),
            succeeded: succeeded.load(Ordering::SeqCst),
            had_errors: !failures.is_empty(),
            failures,
        };

        self.reporter.report(ProgressEvent::RunCompleted {
            succeeded: summary.succeeded,
            attempted: summary.attempted,
            had_errors: summary.had_errors,
        });

        Ok(summary)
    }

    /// Download the feed image and write the feed metadata document
    ///
    /// Returns failures as (marker, message) pairs; see [`RunSummary::absorb`].
    pub async fn download_feed_assets(&self, feed: &Feed) -> Result<Vec<(String, String)>, RunError> {
        let options = &self.options;
        let prefix = archive_prefix(&feed.feed_url);
        let archive = self.downloader.archive();
        let max_length = options.naming.max_length;
        let mut failures = Vec::new();

        if let Some(archive_path) = &options.archive {
            archive.load(archive_path).await?;
        }

        let title_prefix = |suffix: &str| {
            if feed.title.is_empty() {
                suffix.to_string()
            } else {
                format!("{}.{}", feed.title, suffix)
            }
        };

        match resolve_image(feed.image_url.as_deref()) {
            Some(image) => {
                let name = format!("{}{}", title_prefix("image"), image.extension);
                let mut task = DownloadTask::new(
                    image.url.clone(),
                    options.out_dir.join(safe_name(&name, max_length)),
                );
                task.archive = options.archive.as_ref().map(|path| ArchiveTarget {
                    path: path.clone(),
                    keys: vec![ArchiveKey::new(&prefix, &name)],
                });
                task.max_attempts = options.attempts;
                task.override_existing = options.override_existing;
                task.trust_extension = options.trust_extension;
                task.marker = image.url.clone();
                task.max_name_length = max_length;

                if let Err(e) = self.downloader.download(&task, None).await {
                    let error = ItemError::Download {
                        url: image.url,
                        source: e,
                    };
                    tracing::error!(error = %error, "unable to download feed image");
                    failures.push((feed.title.clone(), error.to_string()));
                }
            }
            None => tracing::info!("feed has no image"),
        }

        let name = format!("{}.json", title_prefix("meta"));
        let path = options.out_dir.join(safe_name(&name, max_length));
        let key = [ArchiveKey::new(&prefix, &name)];

        let result: Result<(), ItemError> = async {
            if let Some(archive_path) = &options.archive
                && archive.is_archived(&key, archive_path).await.map_err(MetadataError::from)?
            {
                tracing::info!("feed metadata exists in archive, skipping");
                return Ok(());
            }

            write_feed_meta(feed, &path, options.override_existing).await?;

            if let Some(archive_path) = &options.archive {
                archive
                    .record(&key, archive_path)
                    .await
                    .map_err(MetadataError::from)?;
            }
            Ok(())
        }
        .await;

        if let Err(error) = result {
            tracing::error!(error = %error, "unable to save feed metadata");
            failures.push((feed.title.clone(), error.to_string()));
        }

        Ok(failures)
    }
}

/// Shared, immutable state of one run, handed to every worker
struct RunContext<C: ?Sized> {
    downloader: Arc<Downloader<C>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    options: Arc<RunOptions>,
    feed: Arc<Feed>,
    prefix: String,
    stages: Vec<Stage>,
}

/// What happened to one item
struct ItemReport {
    succeeded: bool,
    errors: Vec<ItemError>,
}

impl<C: HttpClient + ?Sized + 'static> RunContext<C> {
    /// Output path of an artifact of `item` with the given extension
    fn item_path(&self, item: &FeedItem, url: &str, extension: &str) -> PathBuf {
        self.options.out_dir.join(render_item_path(
            item,
            &self.feed,
            &self.options.episode_template,
            url,
            extension,
            &self.options.naming,
        ))
    }

    /// Legacy title/date key of an artifact, plus the GUID key if given
    fn archive_target(&self, item: &FeedItem, extension: &str, guid: Option<&str>) -> Option<ArchiveTarget> {
        let path = self.options.archive.as_ref()?;
        let name = archive_filename(item.pub_date.as_ref(), &item.title, extension);
        Some(ArchiveTarget {
            path: path.clone(),
            keys: archive_keys(&self.prefix, Some(name.as_str()), guid),
        })
    }

    fn task(&self, url: &str, destination: PathBuf, archive: Option<ArchiveTarget>, marker: String) -> DownloadTask {
        DownloadTask {
            url: url.to_string(),
            destination,
            archive,
            max_attempts: self.options.attempts,
            override_existing: self.options.override_existing,
            trust_extension: self.options.trust_extension,
            always_postprocess: false,
            marker,
            max_name_length: self.options.naming.max_length,
        }
    }

    async fn process_item(&self, item: FeedItem, marker: String) -> ItemReport {
        let Some(media) = resolve_audio(&item, &self.options.source_order) else {
            return ItemReport {
                succeeded: false,
                errors: vec![ItemError::NoMediaUrl],
            };
        };

        let destination = self.item_path(&item, &media.url, &media.extension);
        let archive = self.archive_target(&item, &media.extension, item.guid.as_deref());
        let mut task = self.task(&media.url, destination.clone(), archive, marker.clone());
        task.always_postprocess = self.options.always_postprocess;

        let pipeline = ItemPipeline {
            run: self,
            context: Mutex::new(ItemContext {
                episode_number: episode_number(&item, &self.feed, self.options.naming.episode_offset),
                item,
                marker,
                media,
                episode_path: destination,
                content_hash: None,
                image_path: None,
            }),
            ran: AtomicBool::new(false),
            errors: std::sync::Mutex::new(Vec::new()),
        };

        let result = self.downloader.download(&task, Some(&pipeline)).await;

        let mut errors = std::mem::take(&mut *pipeline.errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        match result {
            Ok(DownloadOutcome::Skipped { reason, .. }) => {
                tracing::debug!(reason = reason.describe(), "episode skipped");
            }
            Ok(DownloadOutcome::Downloaded { .. }) => {}
            Err(e) => errors.push(ItemError::Download {
                url: task.url.clone(),
                source: e,
            }),
        }

        ItemReport {
            succeeded: pipeline.ran.load(Ordering::SeqCst),
            errors,
        }
    }
}

/// Runs the planned stages once the episode file is in place
struct ItemPipeline<'a, C: ?Sized> {
    run: &'a RunContext<C>,
    context: Mutex<ItemContext>,
    ran: AtomicBool,
    errors: std::sync::Mutex<Vec<ItemError>>,
}

#[async_trait]
impl<'a, C: HttpClient + ?Sized + 'static> AfterDownload for ItemPipeline<'a, C> {
    async fn after_download(&self, committed: Committed<'_>) {
        let mut context = self.context.lock().await;
        context.episode_path = committed.path.to_path_buf();
        context.content_hash = committed.content_hash.map(String::from);

        for stage in &self.run.stages {
            if let Err(e) = self.run_stage(*stage, &mut context).await {
                tracing::error!(marker = %context.marker, stage = ?stage, error = %e, "stage failed");
                self.errors
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(e);
            }
        }

        self.ran.store(true, Ordering::SeqCst);
    }
}

impl<'a, C: HttpClient + ?Sized + 'static> ItemPipeline<'a, C> {
    async fn run_stage(&self, stage: Stage, context: &mut ItemContext) -> Result<(), ItemError> {
        match stage {
            Stage::Image => self.download_image(context).await,
            Stage::Transcript => self.download_transcript(context).await,
            Stage::PostProcess => self.post_process(context).await,
            Stage::DiscardImage => self.discard_image(context).await,
            Stage::Exec => self.exec(context).await,
            Stage::Metadata => self.write_metadata(context).await,
        }
    }

    /// Download a dependent artifact next to the episode
    async fn download_dependent(
        &self,
        context: &ItemContext,
        media: &ResolvedMedia,
    ) -> Result<Option<PathBuf>, ItemError> {
        let run = self.run;
        let destination = run.item_path(&context.item, &context.media.url, &media.extension);

        // The episode's own destination is locked until this pipeline returns
        let episode_destination =
            run.item_path(&context.item, &context.media.url, &context.media.extension);
        if destination == context.episode_path || destination == episode_destination {
            return Err(ItemError::PathCollision {
                url: media.url.clone(),
                path: destination,
            });
        }

        let task = run.task(
            &media.url,
            destination,
            run.archive_target(&context.item, &media.extension, None),
            media.url.clone(),
        );

        let outcome = run
            .downloader
            .download(&task, None)
            .await
            .map_err(|e| ItemError::Download {
                url: media.url.clone(),
                source: e,
            })?;

        let path = outcome.path();
        Ok(tokio::fs::try_exists(path)
            .await
            .unwrap_or(false)
            .then(|| path.to_path_buf()))
    }

    async fn download_image(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let image_url = context.item.image_url.as_deref().or(self.run.feed.image_url.as_deref());
        let Some(image) = resolve_image(image_url) else {
            tracing::debug!(marker = %context.marker, "no episode image");
            return Ok(());
        };

        context.image_path = self.download_dependent(context, &image).await?;
        Ok(())
    }

    async fn download_transcript(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let Some(transcript) = resolve_transcript(&context.item, &self.run.options.transcript_types) else {
            tracing::debug!(marker = %context.marker, "no episode transcript");
            return Ok(());
        };

        self.download_dependent(context, &transcript).await?;
        Ok(())
    }

    async fn post_process(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let Some(processor) = &self.run.post_processor else {
            return Ok(());
        };

        let tags = TagContext::from_item(
            &self.run.feed,
            &context.item,
            context.episode_number,
            context.image_path.clone(),
        );
        tracing::info!(marker = %context.marker, "running post processor");
        context.episode_path = processor.process(&context.episode_path, &tags).await?;
        Ok(())
    }

    async fn discard_image(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let Some(path) = context.image_path.take() else {
            return Ok(());
        };

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ItemError::CleanupFailed { path, source: e })
    }

    async fn exec(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let Some(command) = &self.run.options.exec else {
            return Ok(());
        };

        tracing::info!(marker = %context.marker, "running exec");
        run_exec(
            command,
            &ExecContext {
                episode_path: &context.episode_path,
                base_path: &self.run.options.out_dir,
                url: &context.media.url,
            },
        )
        .await?;
        Ok(())
    }

    async fn write_metadata(&self, context: &mut ItemContext) -> Result<(), ItemError> {
        let run = self.run;
        let path = run.item_path(&context.item, &context.media.url, METADATA_EXTENSION);
        let target = run.archive_target(&context.item, METADATA_EXTENSION, None);
        let archive = run.downloader.archive();

        if let Some(target) = &target
            && archive
                .is_target_archived(target)
                .await
                .map_err(MetadataError::from)?
        {
            tracing::info!(marker = %context.marker, "episode metadata exists in archive, skipping");
            return Ok(());
        }

        let audio_filename = file_name(&context.episode_path);
        write_item_meta(
            &context.item,
            &audio_filename,
            context.content_hash.clone(),
            &path,
            run.options.override_existing,
        )
        .await?;

        if let Some(target) = &target {
            archive
                .record(&target.keys, &target.path)
                .await
                .map_err(MetadataError::from)?;
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PostProcessError;
    use crate::feed::{Enclosure, Transcript};
    use crate::http::{ByteStream, HttpBytes, HttpResponse, ProbeResponse};
    use crate::progress::NoopReporter;
    use bytes::Bytes;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;
    use url::Url;

    /// Serves canned bodies by URL; unknown URLs answer 404
    #[derive(Default)]
    struct MockHttpClient {
        bodies: HashMap<String, Vec<u8>>,
        gets: AtomicUsize,
    }

    impl MockHttpClient {
        fn serving(urls: &[&str]) -> Self {
            Self {
                bodies: urls
                    .iter()
                    .map(|url| (url.to_string(), format!("content of {}", url).into_bytes()))
                    .collect(),
                gets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_bytes(&self, url: &str) -> Result<HttpBytes, reqwest::Error> {
            Ok(HttpBytes {
                status: 200,
                body: Bytes::from(self.bodies.get(url).cloned().unwrap_or_default()),
            })
        }

        async fn probe(&self, _url: &str) -> Result<ProbeResponse, reqwest::Error> {
            Ok(ProbeResponse {
                status: 405,
                ..Default::default()
            })
        }

        async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let (status, data) = match self.bodies.get(url) {
                Some(body) => (200, body.clone()),
                None => (404, Vec::new()),
            };

            let stream: ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));

            Ok(HttpResponse {
                status,
                content_length: None,
                content_type: None,
                body: stream,
            })
        }
    }

    fn make_item(index: usize, title: &str, url: Option<&str>) -> FeedItem {
        FeedItem {
            index,
            title: title.to_string(),
            pub_date: DateTime::parse_from_rfc2822("Mon, 15 Jan 2024 12:00:00 +0000").ok(),
            guid: Some(format!("guid-{}", index)),
            enclosure: url.map(|url| Enclosure {
                url: url.to_string(),
                length: None,
                mime_type: Some("audio/mpeg".to_string()),
            }),
            ..Default::default()
        }
    }

    fn make_feed(items: Vec<FeedItem>) -> Feed {
        Feed {
            title: "Show".to_string(),
            description: Some("About the show".to_string()),
            link: None,
            author: None,
            image_url: Some("https://example.com/cover.png".to_string()),
            feed_url: Url::parse("https://example.com/feed.xml").unwrap(),
            items,
        }
    }

    fn three_item_feed() -> Feed {
        make_feed(vec![
            make_item(0, "Third", Some("https://example.com/3.mp3")),
            make_item(1, "Second", None),
            make_item(2, "First", Some("https://example.com/1.mp3")),
        ])
    }

    fn orchestrator(client: Arc<MockHttpClient>, options: RunOptions) -> Orchestrator<MockHttpClient> {
        Orchestrator::new(
            client,
            Arc::new(ArchiveRegistry::new()),
            NoopReporter::shared(),
            HttpConfig::default(),
            options,
        )
    }

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            out_dir: dir.to_path_buf(),
            archive: Some(dir.join("archive.json")),
            ..Default::default()
        }
    }

    #[test]
    fn exit_codes() {
        let summary = |succeeded, had_errors| RunSummary {
            attempted: 3,
            succeeded,
            had_errors,
            failures: vec![],
        };
        assert_eq!(summary(3, false).exit_code(), 0);
        assert_eq!(summary(0, false).exit_code(), 2);
        assert_eq!(summary(0, true).exit_code(), 2);
        assert_eq!(summary(2, true).exit_code(), 3);
    }

    #[test]
    fn stage_plan_follows_options() {
        let mut options = RunOptions::default();
        assert!(Stage::plan(&options, false).is_empty());

        options.ffmpeg.add_metadata = true;
        options.exec = Some("true".to_string());
        options.include_episode_meta = true;
        assert_eq!(
            Stage::plan(&options, true),
            vec![
                Stage::Image,
                Stage::PostProcess,
                Stage::DiscardImage,
                Stage::Exec,
                Stage::Metadata
            ]
        );

        options.include_episode_images = true;
        options.include_episode_transcripts = true;
        assert_eq!(
            Stage::plan(&options, true),
            vec![
                Stage::Image,
                Stage::Transcript,
                Stage::PostProcess,
                Stage::Exec,
                Stage::Metadata
            ]
        );
    }

    #[tokio::test]
    async fn unresolvable_item_does_not_abort_the_batch() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/3.mp3",
        ]));
        let feed = three_item_feed();
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let summary = orchestrator(client, options(dir.path()))
            .run_all(&feed, &items)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert!(summary.had_errors);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "Second");
        assert_eq!(summary.exit_code(), 3);
        assert!(dir.path().join("20240115-First.mp3").exists());
        assert!(dir.path().join("20240115-Third.mp3").exists());
    }

    #[tokio::test]
    async fn failed_download_is_counted_as_error() {
        let dir = tempdir().unwrap();
        // Nothing is served, so every GET answers 404
        let client = Arc::new(MockHttpClient::default());
        let feed = make_feed(vec![make_item(0, "Gone", Some("https://example.com/gone.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.attempts = 2;
        let summary = orchestrator(client.clone(), options)
            .run_all(&feed, &items)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 0);
        assert!(summary.had_errors);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(client.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rerun_is_idempotent_and_offline() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/3.mp3",
        ]));
        let feed = make_feed(vec![
            make_item(0, "Third", Some("https://example.com/3.mp3")),
            make_item(1, "First", Some("https://example.com/1.mp3")),
        ]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();
        let archive = dir.path().join("archive.json");

        let first = orchestrator(client.clone(), options(dir.path()))
            .run_all(&feed, &items)
            .await
            .unwrap();
        assert_eq!(first.succeeded, 2);
        assert_eq!(client.gets.load(Ordering::SeqCst), 2);
        let archive_after_first = std::fs::read_to_string(&archive).unwrap();

        // Fresh registry, as a new process would have
        let second = orchestrator(client.clone(), options(dir.path()))
            .run_all(&feed, &items)
            .await
            .unwrap();
        assert_eq!(second.succeeded, 0);
        assert!(!second.had_errors);
        assert_eq!(client.gets.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_to_string(&archive).unwrap(), archive_after_first);

        // Deleted locally but archived: still no network
        std::fs::remove_file(dir.path().join("20240115-First.mp3")).unwrap();
        let third = orchestrator(client.clone(), options(dir.path()))
            .run_all(&feed, &items)
            .await
            .unwrap();
        assert_eq!(third.succeeded, 0);
        assert_eq!(client.gets.load(Ordering::SeqCst), 2);
        assert!(!dir.path().join("20240115-First.mp3").exists());
    }

    #[tokio::test]
    async fn corrupt_archive_aborts_the_run() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("archive.json"), "{not an array").unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/1.mp3"]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let result = orchestrator(client.clone(), options(dir.path()))
            .run_all(&feed, &items)
            .await;

        assert!(matches!(result, Err(RunError::Archive(_))));
        assert_eq!(client.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parallel_run_downloads_every_item() {
        let dir = tempdir().unwrap();
        let urls: Vec<String> = (0..6).map(|i| format!("https://example.com/{}.mp3", i)).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let client = Arc::new(MockHttpClient::serving(&url_refs));
        let feed = make_feed(
            urls.iter()
                .enumerate()
                .map(|(i, url)| make_item(i, &format!("Episode {}", i), Some(url)))
                .collect(),
        );
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.threads = 3;
        let summary = orchestrator(client, options).run_all(&feed, &items).await.unwrap();

        assert_eq!(summary.succeeded, 6);
        assert_eq!(summary.exit_code(), 0);
        for i in 0..6 {
            assert!(dir.path().join(format!("20240115-Episode {}.mp3", i)).exists());
        }
        let entries: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("archive.json")).unwrap())
                .unwrap();
        assert_eq!(entries.len(), 12);
    }

    #[tokio::test]
    async fn metadata_and_images_are_written_per_item() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/cover.png",
        ]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.include_episode_meta = true;
        options.include_episode_images = true;
        let summary = orchestrator(client, options).run_all(&feed, &items).await.unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert!(dir.path().join("20240115-First.png").exists());

        let meta = crate::metadata::read_item_meta(&dir.path().join("20240115-First.meta.json"))
            .await
            .unwrap();
        assert_eq!(meta.audio_filename, "20240115-First.mp3");
        assert!(meta.content_hash.is_some_and(|h| h.starts_with("sha256:")));

        let entries = std::fs::read_to_string(dir.path().join("archive.json")).unwrap();
        assert!(entries.contains("example.com/feed.xml-20240115-First.png"));
        assert!(entries.contains("example.com/feed.xml-20240115-First.meta.json"));
        assert!(entries.contains("example.com/feed.xml-guid-0"));
    }

    /// Renames the episode to `.ogg`, recording the tags it saw
    #[derive(Default)]
    struct RenamingProcessor(std::sync::Mutex<Vec<TagContext>>);

    #[async_trait]
    impl PostProcessor for RenamingProcessor {
        async fn process(&self, input: &Path, tags: &TagContext) -> Result<PathBuf, PostProcessError> {
            self.0.lock().unwrap().push(tags.clone());
            let output = input.with_extension("ogg");
            tokio::fs::rename(input, &output)
                .await
                .map_err(|e| PostProcessError::ReplaceFailed {
                    path: output.clone(),
                    source: e,
                })?;
            Ok(output)
        }
    }

    #[tokio::test]
    async fn post_processed_path_flows_into_later_stages() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/cover.png",
        ]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();
        let processor = Arc::new(RenamingProcessor::default());

        let mut options = options(dir.path());
        options.ffmpeg.add_metadata = true;
        options.include_episode_meta = true;
        let summary = orchestrator(client, options)
            .with_post_processor(Some(processor.clone() as Arc<dyn PostProcessor>))
            .run_all(&feed, &items)
            .await
            .unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert!(dir.path().join("20240115-First.ogg").exists());
        // Fetched only for tagging, then discarded
        assert!(!dir.path().join("20240115-First.png").exists());

        let seen = processor.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].album, "Show");
        assert_eq!(seen[0].cover, Some(dir.path().join("20240115-First.png")));

        let meta = crate::metadata::read_item_meta(&dir.path().join("20240115-First.meta.json"))
            .await
            .unwrap();
        assert_eq!(meta.audio_filename, "20240115-First.ogg");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_stage_keeps_the_item_succeeded() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/1.mp3"]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.exec = Some("exit 4".to_string());
        options.include_episode_meta = true;
        let summary = orchestrator(client, options).run_all(&feed, &items).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(summary.had_errors);
        assert_eq!(summary.exit_code(), 3);
        assert!(dir.path().join("20240115-First.mp3").exists());
        // Later stages still ran
        assert!(dir.path().join("20240115-First.meta.json").exists());
    }

    #[tokio::test]
    async fn always_postprocess_runs_pipeline_on_existing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("20240115-First.mp3"), b"local").unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/1.mp3"]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.include_episode_meta = true;
        let skipped = orchestrator(client.clone(), options.clone())
            .run_all(&feed, &items)
            .await
            .unwrap();
        assert_eq!(skipped.succeeded, 0);
        assert!(!dir.path().join("20240115-First.meta.json").exists());

        options.always_postprocess = true;
        let processed = orchestrator(client.clone(), options)
            .run_all(&feed, &items)
            .await
            .unwrap();
        assert_eq!(processed.succeeded, 1);
        assert!(dir.path().join("20240115-First.meta.json").exists());
        assert_eq!(client.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn feed_assets_are_written_and_archived() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/cover.png"]));
        let feed = make_feed(vec![]);

        let orchestrator = orchestrator(client.clone(), options(dir.path()));
        let failures = orchestrator.download_feed_assets(&feed).await.unwrap();

        assert!(failures.is_empty());
        assert!(dir.path().join("Show.image.png").exists());
        assert!(dir.path().join("Show.meta.json").exists());
        let entries = std::fs::read_to_string(dir.path().join("archive.json")).unwrap();
        assert!(entries.contains("example.com/feed.xml-Show.image.png"));
        assert!(entries.contains("example.com/feed.xml-Show.meta.json"));

        // Archived metadata is not rewritten
        std::fs::remove_file(dir.path().join("Show.meta.json")).unwrap();
        orchestrator.download_feed_assets(&feed).await.unwrap();
        assert!(!dir.path().join("Show.meta.json").exists());
        assert_eq!(client.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_feed_image_is_a_failure_not_an_abort() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::default());
        let feed = make_feed(vec![]);

        let mut summary = RunSummary::default();
        let failures = orchestrator(client, options(dir.path()))
            .download_feed_assets(&feed)
            .await
            .unwrap();
        summary.absorb(failures);

        assert!(summary.had_errors);
        assert_eq!(summary.failures.len(), 1);
        assert!(dir.path().join("Show.meta.json").exists());
    }

    #[tokio::test]
    async fn transcript_with_audio_mime_lands_next_to_the_episode() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/transcript",
        ]));
        let mut item = make_item(0, "First", Some("https://example.com/1.mp3"));
        item.transcripts = vec![Transcript {
            url: "https://example.com/transcript".to_string(),
            mime_type: Some("audio/mpeg".to_string()),
        }];
        let feed = make_feed(vec![item]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let mut options = options(dir.path());
        options.include_episode_transcripts = true;
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator(client.clone(), options).run_all(&feed, &items),
        )
        .await
        .expect("run finished")
        .unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert_eq!(client.gets.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read(dir.path().join("20240115-First.mp3")).unwrap(),
            b"content of https://example.com/1.mp3"
        );
        assert_eq!(
            std::fs::read(dir.path().join("20240115-First.txt")).unwrap(),
            b"content of https://example.com/transcript"
        );
    }

    #[tokio::test]
    async fn dependent_download_refuses_the_episode_path() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&[
            "https://example.com/1.mp3",
            "https://example.com/notes",
        ]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);
        let orchestrator = orchestrator(client.clone(), options(dir.path()));
        let run = orchestrator.run_context(&feed);

        let media = ResolvedMedia {
            url: "https://example.com/1.mp3".to_string(),
            extension: ".mp3".to_string(),
        };
        let context = ItemContext {
            item: feed.items[0].clone(),
            marker: "First".to_string(),
            media,
            episode_number: 1,
            episode_path: dir.path().join("20240115-First.mp3"),
            content_hash: None,
            image_path: None,
        };
        let pipeline = ItemPipeline {
            run: &*run,
            context: Mutex::new(context.clone()),
            ran: AtomicBool::new(false),
            errors: std::sync::Mutex::new(Vec::new()),
        };

        let clashing = ResolvedMedia {
            url: "https://example.com/notes".to_string(),
            extension: ".mp3".to_string(),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.download_dependent(&context, &clashing),
        )
        .await
        .expect("collision detected without waiting");

        assert!(matches!(result, Err(ItemError::PathCollision { .. })));
        assert_eq!(client.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overlong_title_still_downloads() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/1.mp3"]));
        let title = "x".repeat(300);
        let feed = make_feed(vec![make_item(0, &title, Some("https://example.com/1.mp3"))]);
        let items: Vec<&FeedItem> = feed.items.iter().collect();

        let summary = orchestrator(client, options(dir.path()))
            .run_all(&feed, &items)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.exit_code(), 0);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".mp3"))
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("20240115-xxx"));
        assert!(names[0].len() + crate::naming::TEMP_SUFFIX.len() <= 255);
    }

    #[tokio::test]
    async fn empty_selection_downloads_nothing() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient::serving(&["https://example.com/1.mp3"]));
        let feed = make_feed(vec![make_item(0, "First", Some("https://example.com/1.mp3"))]);

        let summary = orchestrator(client.clone(), options(dir.path()))
            .run_all(&feed, &[])
            .await
            .unwrap();

        assert_eq!(summary.attempted, 0);
        assert!(!summary.had_errors);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(client.gets.load(Ordering::SeqCst), 0);
    }
}
