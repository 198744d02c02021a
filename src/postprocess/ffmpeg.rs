// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::PostProcessError;
use crate::feed::{Feed, FeedItem};
use crate::metadata::plain_text;
use crate::naming::TEMP_SUFFIX;

use super::PostProcessor;

/// What ffmpeg should do to a downloaded episode
#[derive(Debug, Clone, Default)]
pub struct FfmpegOptions {
    /// Write feed and item tags, embedding the cover image when one is present
    pub add_metadata: bool,
    /// Target audio bitrate such as `48k`
    pub bitrate: Option<String>,
    /// Downmix to a single channel
    pub mono: bool,
    /// Target container extension, with or without the leading dot
    pub audio_format: Option<String>,
}

impl FfmpegOptions {
    /// True if any option requires running ffmpeg at all
    pub fn is_active(&self) -> bool {
        self.add_metadata || self.bitrate.is_some() || self.mono || self.audio_format.is_some()
    }

    fn target_extension(&self, current: &str) -> String {
        match &self.audio_format {
            Some(format) => format!(".{}", format.trim_start_matches('.').to_lowercase()),
            None => current.to_string(),
        }
    }
}

/// Tag values written into the processed file; empty values are skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagContext {
    pub album: String,
    pub artist: String,
    pub title: String,
    pub disc: String,
    pub track: String,
    pub episode_type: String,
    pub date: String,
    pub comment: String,
    pub subtitle: String,
    /// Cover image to embed alongside the tags
    pub cover: Option<PathBuf>,
}

impl TagContext {
    /// Tags for `item`; `track` is used when the item declares no episode number
    pub fn from_item(feed: &Feed, item: &FeedItem, track: i64, cover: Option<PathBuf>) -> Self {
        Self {
            album: feed.title.clone(),
            artist: item.author.clone().unwrap_or_default(),
            title: item.title.clone(),
            disc: item
                .season_number
                .map(|s| s.to_string())
                .unwrap_or_default(),
            track: item
                .episode_number
                .map(i64::from)
                .unwrap_or(track)
                .to_string(),
            episode_type: item.episode_type.clone().unwrap_or_default(),
            date: item
                .pub_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            comment: item.description.as_deref().map(plain_text).unwrap_or_default(),
            subtitle: item.subtitle.clone().unwrap_or_default(),
            cover,
        }
    }

    fn pairs(&self) -> [(&'static str, &str); 10] {
        [
            ("album", self.album.as_str()),
            ("artist", self.artist.as_str()),
            ("album_artist", self.artist.as_str()),
            ("title", self.title.as_str()),
            ("disc", self.disc.as_str()),
            ("track", self.track.as_str()),
            ("episode-type", self.episode_type.as_str()),
            ("date", self.date.as_str()),
            ("comment", self.comment.as_str()),
            ("subtitle", self.subtitle.as_str()),
        ]
    }
}

/// Audio codec used when re-encoding into a container
pub fn codec_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_lowercase().as_str() {
        "m4a" | "aac" | "mp4" | "mov" | "m4v" => "aac",
        "ogg" => "libvorbis",
        "opus" => "libopus",
        "flac" => "flac",
        "wav" => "pcm_s16le",
        _ => "libmp3lame",
    }
}

/// Argument vector for one ffmpeg run from `input` to `output`
pub fn build_args(
    input: &Path,
    output: &Path,
    tags: &TagContext,
    options: &FfmpegOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-loglevel".into(), "quiet".into(), "-i".into(), input.into()];

    let cover = tags.cover.as_deref().filter(|_| options.add_metadata);
    if let Some(cover) = cover {
        args.push("-i".into());
        args.push(cover.into());
    }

    if let Some(bitrate) = &options.bitrate {
        args.push("-b:a".into());
        args.push(bitrate.into());
    }

    if options.mono {
        args.push("-ac".into());
        args.push("1".into());
    }

    if options.add_metadata {
        args.push("-map_metadata".into());
        args.push("0".into());
        for (key, value) in tags.pairs().into_iter().filter(|(_, v)| !v.is_empty()) {
            args.push("-metadata".into());
            args.push(format!("{}={}", key, value).into());
        }
    }

    let output_ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let converting = input
        .extension()
        .is_some_and(|e| !e.eq_ignore_ascii_case(&output_ext));
    let reencode = options.bitrate.is_some() || options.mono || converting;

    if reencode {
        args.push("-c:a".into());
        args.push(codec_for_extension(&output_ext).into());
    } else if options.add_metadata {
        args.push("-codec".into());
        args.push("copy".into());
    }

    args.push("-map".into());
    args.push("0".into());
    if cover.is_some() {
        args.push("-map".into());
        args.push("1".into());
    }

    args.push(output.into());
    args
}

/// Runs the `ffmpeg` binary on committed episodes
#[derive(Debug, Clone)]
pub struct FfmpegPostProcessor {
    program: PathBuf,
    options: FfmpegOptions,
}

impl FfmpegPostProcessor {
    pub fn new(options: FfmpegOptions) -> Self {
        Self::with_program("ffmpeg", options)
    }

    pub fn with_program(program: impl Into<PathBuf>, options: FfmpegOptions) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    pub fn options(&self) -> &FfmpegOptions {
        &self.options
    }

    /// `<stem>.tmp.<ext>` and `<stem>.<ext>` next to `input`
    fn output_paths(&self, input: &Path) -> (PathBuf, PathBuf) {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let current = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let ext = self.options.target_extension(&current);
        let dir = input.parent().unwrap_or_else(|| Path::new(""));

        (
            dir.join(format!("{}{}{}", stem, TEMP_SUFFIX, ext)),
            dir.join(format!("{}{}", stem, ext)),
        )
    }
}

#[async_trait]
impl PostProcessor for FfmpegPostProcessor {
    async fn process(&self, input: &Path, tags: &TagContext) -> Result<PathBuf, PostProcessError> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(PostProcessError::MissingInput(input.to_path_buf()));
        }

        let program = self.program.to_string_lossy().into_owned();
        let (tmp, output) = self.output_paths(input);
        let args = build_args(input, &tmp, tags, &self.options);
        tracing::debug!(program = %program, ?args, "running post processor");

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PostProcessError::SpawnFailed {
                program: program.clone(),
                source: e,
            })?;

        if !status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(PostProcessError::ExitStatus {
                program,
                code: status.code(),
            });
        }

        tokio::fs::rename(&tmp, &output)
            .await
            .map_err(|e| PostProcessError::ReplaceFailed {
                path: output.clone(),
                source: e,
            })?;

        if output != input {
            tokio::fs::remove_file(input)
                .await
                .map_err(|e| PostProcessError::ReplaceFailed {
                    path: input.to_path_buf(),
                    source: e,
                })?;
        }

        Ok(output)
    }
}
