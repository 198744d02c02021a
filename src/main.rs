// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use podcast_dl::feed::file_path_to_url;
use podcast_dl::metadata::plain_text;
use podcast_dl::naming::DEFAULT_MAX_LENGTH;
use podcast_dl::orchestrator::DEFAULT_EPISODE_TEMPLATE;
use podcast_dl::{
    ArchiveRegistry, Feed, FfmpegOptions, HttpConfig, ItemFilter, NamingOptions, NoopReporter,
    Orchestrator, ProgressEvent, ProgressReporter, ReqwestClient, RunOptions,
    SharedProgressReporter, SourceKind, archive_filename, archive_keys, archive_prefix,
    fetch_feed, list_entries, parse_feed_file, render_folder, resolve_audio, select_items,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[-] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

const DEFAULT_ARCHIVE: &str = "./{{podcast_title}}/.podcast-dl-archive.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListFormat {
    Table,
    Json,
}

/// Download, archive and post-process podcast episodes from RSS feeds
#[derive(Parser, Debug)]
#[command(name = "podcast-dl")]
#[command(about = "Download, archive and post-process podcast episodes from RSS feeds")]
#[command(version)]
struct Args {
    /// Path to a local RSS file
    #[arg(conflicts_with = "url", required_unless_present = "url")]
    file: Option<PathBuf>,

    /// URL of the podcast RSS feed
    #[arg(long)]
    url: Option<String>,

    /// Output directory, may use {{podcast_title}} and {{podcast_link}}
    #[arg(long, default_value = "./{{podcast_title}}")]
    out_dir: String,

    /// Only download or write items not listed in this archive file
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_ARCHIVE)]
    archive: Option<String>,

    /// Template for episode related filenames
    #[arg(long, default_value = DEFAULT_EPISODE_TEMPLATE)]
    episode_template: String,

    /// Minimum number of digits of {{episode_num}}, zero padded
    #[arg(long, default_value_t = 1)]
    episode_digits: usize,

    /// Added to every computed episode number
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    episode_num_offset: i64,

    /// Order in which item fields are tried for the episode URL
    #[arg(long, value_delimiter = ',', default_value = "enclosure,link")]
    episode_source_order: Vec<SourceKind>,

    /// Regexes matched against titles, exposed as {{custom_0}}, {{custom_1}}, ...
    #[arg(long, num_args = 1..)]
    episode_custom_template_options: Vec<String>,

    /// Write podcast metadata and image
    #[arg(long)]
    include_meta: bool,

    /// Write metadata of each episode
    #[arg(long)]
    include_episode_meta: bool,

    /// Download episode images
    #[arg(long)]
    include_episode_images: bool,

    /// Download episode transcripts
    #[arg(long)]
    include_episode_transcripts: bool,

    /// Preferred transcript MIME types, most wanted first
    #[arg(long, value_delimiter = ',')]
    episode_transcript_types: Vec<String>,

    /// Episodes to skip from the start (most recent = 0)
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Maximum number of episodes to download
    #[arg(long, value_parser = parse_positive)]
    limit: Option<usize>,

    /// Only episodes whose title matches this regex
    #[arg(long)]
    episode_regex: Option<String>,

    /// Skip episodes whose title matches this regex
    #[arg(long)]
    episode_regex_exclude: Option<String>,

    /// Only episodes published on or after this day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    after: Option<NaiveDate>,

    /// Only episodes published on or before this day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    before: Option<NaiveDate>,

    /// Only episodes of this season
    #[arg(long)]
    season: Option<u32>,

    /// Tag episodes with ffmpeg
    #[arg(long)]
    add_mp3_metadata: bool,

    /// Re-encode episodes to this bitrate with ffmpeg, e.g. 48k
    #[arg(long)]
    adjust_bitrate: Option<String>,

    /// Downmix episodes to mono with ffmpeg
    #[arg(long)]
    mono: bool,

    /// Convert episodes to this format with ffmpeg, e.g. opus
    #[arg(long)]
    audio_format: Option<String>,

    /// Replace existing local files
    #[arg(long = "override")]
    override_existing: bool,

    /// Run post-processing on episodes that already exist locally
    #[arg(long)]
    always_postprocess: bool,

    /// Walk the feed oldest first
    #[arg(long)]
    reverse: bool,

    /// Print podcast info instead of downloading
    #[arg(long)]
    info: bool,

    /// Print episodes instead of downloading
    #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "table")]
    list: Option<ListFormat>,

    /// Shell command run after each episode, e.g. "mv {{episode_path}} /media"
    #[arg(long)]
    exec: Option<String>,

    /// Number of episodes processed concurrently
    #[arg(long, default_value_t = 1, value_parser = parse_positive)]
    threads: usize,

    /// Attempts per download
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    attempts: u32,

    /// Keep the extension from the feed even if the server disagrees
    #[arg(long)]
    trust_ext: bool,

    /// User agent sent with every request
    #[arg(long, env = "PODCAST_DL_USER_AGENT")]
    user_agent: Option<String>,

    /// Maximum length of a file or folder name in bytes
    #[arg(long, env = "MAX_LENGTH_FILENAME", default_value_t = DEFAULT_MAX_LENGTH)]
    max_length_filename: usize,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, marker: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bar) = bars.get(marker) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(marker.to_string(), bar.clone());
        bar
    }

    fn take_bar(&self, marker: &str) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(marker)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { url } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Fetching feed: {}", url.cyan()));
            }

            ProgressEvent::ItemsSelected {
                podcast_title,
                total_items,
                to_download,
            } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}{} • {} episodes total, {} selected",
                    podcast_title.bold().green(),
                    total_items.to_string().cyan(),
                    to_download.to_string().yellow()
                ));
            }

            ProgressEvent::DownloadStarting {
                marker,
                attempt,
                content_length,
            } => {
                let bar = self.get_or_create_bar(&marker);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                let retry = if attempt > 1 {
                    format!(" (attempt {})", attempt).yellow().to_string()
                } else {
                    String::new()
                };
                bar.set_message(format!("{}{}", truncate_title(&marker, 40), retry));
            }

            ProgressEvent::DownloadProgress {
                marker,
                bytes_downloaded,
                total_bytes,
            } => {
                let bar = self.get_or_create_bar(&marker);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::DownloadCompleted {
                marker,
                bytes_downloaded,
            } => {
                if let Some(bar) = self.take_bar(&marker) {
                    bar.set_position(bytes_downloaded);
                    bar.finish_and_clear();
                }
                let _ = self
                    .multi
                    .println(format!("{SUCCESS}{}", truncate_title(&marker, 60).green()));
            }

            ProgressEvent::DownloadSkipped { marker, reason } => {
                let _ = self.multi.println(format!(
                    "{SKIP}{} - {}",
                    truncate_title(&marker, 50),
                    reason.dimmed()
                ));
            }

            ProgressEvent::ItemFailed { marker, error } => {
                if let Some(bar) = self.take_bar(&marker) {
                    bar.finish_and_clear();
                }
                let _ = self.multi.println(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&marker, 30).red(),
                    error.red()
                ));
            }

            ProgressEvent::RunCompleted {
                succeeded,
                attempted,
                had_errors,
            } => {
                self.main_bar.finish_and_clear();
                let headline = if had_errors {
                    "Finished with errors:".bold().yellow()
                } else {
                    "Finished:".bold().green()
                };
                println!(
                    "\n{PARTY}{} {} of {} episodes processed",
                    headline,
                    succeeded.to_string().green().bold(),
                    attempted.to_string().cyan()
                );
            }
        }
    }
}

fn truncate_title(title: &str, max_chars: usize) -> String {
    if title.chars().count() <= max_chars {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn print_info(feed: &Feed) {
    println!("{} {}", "Title:".bold(), feed.title);
    if let Some(description) = &feed.description {
        println!("{} {}", "Description:".bold(), plain_text(description));
    }
    println!("{} {}", "Total Episodes:".bold(), feed.items.len());
}

fn print_list(feed: &Feed, filter: &ItemFilter, format: ListFormat) -> Result<()> {
    let items = select_items(feed, filter, |_| false);
    if items.is_empty() {
        bail!("No episodes found with provided criteria to list");
    }

    let entries = list_entries(feed, &items);
    match format {
        ListFormat::Json => {
            println!("{}", serde_json::to_string(&entries)?);
        }
        ListFormat::Table => {
            println!(
                "{}",
                format!("{:>7}  {:>7}  {:<60}  {}", "Season", "Episode", "Title", "Published").bold()
            );
            for entry in entries {
                println!(
                    "{:>7}  {:>7}  {:<60}  {}",
                    entry.season.map(|s| s.to_string()).unwrap_or_default(),
                    entry.episode,
                    truncate_title(&entry.title, 60),
                    entry.pub_date.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn load_feed(args: &Args, client: &ReqwestClient, reporter: &SharedProgressReporter) -> Result<Feed> {
    match (&args.url, &args.file) {
        (Some(url), _) => {
            reporter.report(ProgressEvent::FetchingFeed { url: url.clone() });
            fetch_feed(client, url)
                .await
                .with_context(|| format!("Failed to fetch feed {}", url))
        }
        (None, Some(path)) => {
            reporter.report(ProgressEvent::FetchingFeed {
                url: file_path_to_url(path).to_string(),
            });
            parse_feed_file(path).with_context(|| format!("Failed to read feed {}", path.display()))
        }
        (None, None) => bail!("No feed URL or file provided"),
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut http = HttpConfig::default();
    if let Some(user_agent) = &args.user_agent {
        http.user_agent = user_agent.clone();
    }
    let client = ReqwestClient::with_config(http.clone());

    let listing = args.info || args.list.is_some();
    let reporter: SharedProgressReporter = if args.quiet || listing {
        NoopReporter::shared()
    } else {
        Arc::new(IndicatifReporter::new())
    };

    let mut filter = ItemFilter::new(
        args.episode_regex.as_deref(),
        args.episode_regex_exclude.as_deref(),
    )
    .context("Invalid episode regex")?;
    filter.offset = args.offset;
    filter.limit = args.limit;
    filter.reverse = args.reverse;
    filter.after = args.after;
    filter.before = args.before;
    filter.season = args.season;

    let feed = load_feed(&args, &client, &reporter).await?;
    let max_length = args.max_length_filename;

    if args.info {
        print_info(&feed);
    }
    if let Some(format) = args.list {
        print_list(&feed, &filter, format)?;
    }
    if listing {
        return Ok(0);
    }

    let out_dir = render_folder(&feed, &args.out_dir, max_length);
    let archive = args
        .archive
        .as_deref()
        .map(|template| render_folder(&feed, template, max_length));

    let mut naming = NamingOptions::default()
        .with_custom_patterns(&args.episode_custom_template_options)
        .context("Invalid custom template option")?;
    naming.episode_digits = args.episode_digits;
    naming.episode_offset = args.episode_num_offset;
    naming.max_length = max_length;

    let registry = Arc::new(ArchiveRegistry::new());
    let items = {
        let ledger = match &archive {
            Some(path) => Some(
                registry
                    .ledger(path)
                    .await
                    .with_context(|| format!("Failed to load archive {}", path.display()))?,
            ),
            None => None,
        };
        let ledger = match &ledger {
            Some(ledger) => Some(ledger.lock().await),
            None => None,
        };
        let prefix = archive_prefix(&feed.feed_url);

        select_items(&feed, &filter, |item| {
            let Some(ledger) = &ledger else {
                return false;
            };
            let Some(media) = resolve_audio(item, &args.episode_source_order) else {
                return false;
            };
            let name = archive_filename(item.pub_date.as_ref(), &item.title, &media.extension);
            ledger.contains_any(&archive_keys(&prefix, Some(name.as_str()), item.guid.as_deref()))
        })
    };

    let options = RunOptions {
        out_dir: out_dir.clone(),
        archive,
        episode_template: args.episode_template.clone(),
        naming,
        source_order: args.episode_source_order.clone(),
        threads: args.threads,
        attempts: args.attempts,
        include_episode_meta: args.include_episode_meta,
        include_episode_images: args.include_episode_images,
        include_episode_transcripts: args.include_episode_transcripts,
        transcript_types: args.episode_transcript_types.clone(),
        ffmpeg: FfmpegOptions {
            add_metadata: args.add_mp3_metadata,
            bitrate: args.adjust_bitrate.clone(),
            mono: args.mono,
            audio_format: args.audio_format.clone(),
        },
        exec: args.exec.clone(),
        override_existing: args.override_existing,
        always_postprocess: args.always_postprocess,
        trust_extension: args.trust_ext,
    };

    let orchestrator = Orchestrator::new(
        Arc::new(client),
        registry,
        reporter,
        http,
        options,
    );

    let feed_failures = if args.include_meta {
        orchestrator
            .download_feed_assets(&feed)
            .await
            .context("Failed to write podcast metadata")?
    } else {
        Vec::new()
    };

    // An empty selection downloads nothing and exits with 2
    if items.is_empty() && !args.quiet {
        println!(
            "{}",
            "No episodes found with the provided criteria to download".yellow()
        );
    }

    let mut summary = orchestrator
        .run_all(&feed, &items)
        .await
        .context("Failed to download episodes")?;
    summary.absorb(feed_failures);

    if !args.quiet && !summary.failures.is_empty() {
        println!("\n{}", "Failed items:".red().bold());
        for (marker, error) in &summary.failures {
            println!("  {}{} - {}", CROSS, marker.yellow(), error.dimmed());
        }
    }

    if !args.quiet {
        println!(
            "\n{FOLDER}Output: {}\n",
            out_dir.display().to_string().cyan()
        );
    }

    Ok(summary.exit_code())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.quiet);

    if !args.quiet && !args.info && args.list.is_none() {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podcast-dl".bold().magenta(),
            "- Podcast Downloader".dimmed()
        );
    }

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            1
        }
    };

    std::process::exit(code);
}
