// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static MIME and extension tables, plus media URL resolution for feed items.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::feed::FeedItem;

/// The kind of artifact a file extension denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCategory {
    Audio,
    Image,
    Transcript,
}

/// Map a MIME type to a file extension (with leading dot)
///
/// Parameters such as `; charset=utf-8` are ignored.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();

    let ext = match essence.as_str() {
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" => ".mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => ".m4a",
        "audio/aac" | "audio/x-aac" => ".aac",
        "audio/ogg" | "audio/vorbis" => ".ogg",
        "audio/opus" => ".opus",
        "audio/flac" | "audio/x-flac" => ".flac",
        "audio/wav" | "audio/x-wav" | "audio/wave" => ".wav",
        "video/mp4" => ".mp4",
        "video/quicktime" => ".mov",
        "video/x-m4v" => ".m4v",
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "text/vtt" => ".vtt",
        "application/srt" | "application/x-subrip" | "text/srt" => ".srt",
        "application/json" | "application/json+chapters" => ".json",
        "text/html" => ".html",
        "text/plain" => ".txt",
        _ => return None,
    };

    Some(ext)
}

/// Category of a file extension (with or without leading dot)
///
/// Returns `None` for extensions absent from every table.
pub fn category_for_extension(ext: &str) -> Option<MediaCategory> {
    let ext = ext.trim_start_matches('.').to_lowercase();

    match ext.as_str() {
        "mp3" | "m4a" | "aac" | "ogg" | "opus" | "flac" | "wav" | "mp4" | "mov" | "m4v" => {
            Some(MediaCategory::Audio)
        }
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif" => Some(MediaCategory::Image),
        "vtt" | "srt" | "json" | "html" | "txt" => Some(MediaCategory::Transcript),
        _ => None,
    }
}

/// Extension of the last path segment of a URL, lowercased with leading dot
///
/// Query strings and fragments are ignored. Returns `None` for URLs that
/// fail to parse or whose final segment carries no extension.
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (stem, ext) = last.rsplit_once('.')?;

    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    Some(format!(".{}", ext.to_lowercase()))
}

/// Where a primary media URL may be taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Enclosure,
    Link,
}

impl SourceKind {
    /// Default preference: enclosure first, then the item link
    pub const DEFAULT_ORDER: [SourceKind; 2] = [SourceKind::Enclosure, SourceKind::Link];

    fn url<'a>(&self, item: &'a FeedItem) -> Option<&'a str> {
        let url = match self {
            SourceKind::Enclosure => item.enclosure.as_ref().map(|e| e.url.as_str()),
            SourceKind::Link => item.link.as_deref(),
        };
        url.filter(|url| !url.is_empty())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "enclosure" => Ok(SourceKind::Enclosure),
            "link" => Ok(SourceKind::Link),
            other => Err(format!("unknown episode source '{}'", other)),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Enclosure => write!(f, "enclosure"),
            SourceKind::Link => write!(f, "link"),
        }
    }
}

/// A media URL together with the extension chosen for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub url: String,
    pub extension: String,
}

/// Resolve the primary audio URL and extension of an item
///
/// Sources are tried in `order` for a URL whose path ends in a known audio
/// extension. Failing that, the enclosure's declared MIME type is consulted.
pub fn resolve_audio(item: &FeedItem, order: &[SourceKind]) -> Option<ResolvedMedia> {
    let by_url = order.iter().find_map(|source| {
        let url = source.url(item)?;
        let ext = url_extension(url)?;
        (category_for_extension(&ext) == Some(MediaCategory::Audio)).then(|| ResolvedMedia {
            url: url.to_string(),
            extension: ext,
        })
    });

    by_url.or_else(|| {
        let enclosure = item.enclosure.as_ref().filter(|e| !e.url.is_empty())?;
        let ext = enclosure.mime_type.as_deref().and_then(extension_for_mime)?;
        (category_for_extension(ext) == Some(MediaCategory::Audio)).then(|| ResolvedMedia {
            url: enclosure.url.clone(),
            extension: ext.to_string(),
        })
    })
}

/// Resolve an image URL, defaulting to `.jpg` when the URL has no usable extension
pub fn resolve_image(image_url: Option<&str>) -> Option<ResolvedMedia> {
    let url = image_url.filter(|u| !u.is_empty())?;
    let extension = url_extension(url)
        .filter(|ext| category_for_extension(ext) == Some(MediaCategory::Image))
        .unwrap_or_else(|| ".jpg".to_string());

    Some(ResolvedMedia {
        url: url.to_string(),
        extension,
    })
}

/// Pick a transcript of the item
///
/// With a non-empty `preferred` list of MIME types, the first type in that list
/// that the item offers wins; otherwise the first transcript is taken.
pub fn resolve_transcript(item: &FeedItem, preferred: &[String]) -> Option<ResolvedMedia> {
    let transcript = if preferred.is_empty() {
        item.transcripts.first()
    } else {
        preferred.iter().find_map(|wanted| {
            item.transcripts.iter().find(|t| {
                t.mime_type
                    .as_deref()
                    .is_some_and(|m| m.eq_ignore_ascii_case(wanted))
            })
        })
    }?;

    let extension = url_extension(&transcript.url)
        .filter(|ext| category_for_extension(ext) == Some(MediaCategory::Transcript))
        .or_else(|| {
            transcript
                .mime_type
                .as_deref()
                .and_then(extension_for_mime)
                .filter(|ext| category_for_extension(ext) == Some(MediaCategory::Transcript))
                .map(String::from)
        })
        .unwrap_or_else(|| ".txt".to_string());

    Some(ResolvedMedia {
        url: transcript.url.clone(),
        extension,
    })
}

/// Decide whether a served content type should change a chosen extension
///
/// Returns the corrected extension only when the content type maps to a
/// different extension of the same known category. Unknown categories on
/// either side never cause a swap.
pub fn corrected_extension(current: &str, content_type: Option<&str>) -> Option<&'static str> {
    let proposed = extension_for_mime(content_type?)?;

    if proposed.eq_ignore_ascii_case(current) {
        return None;
    }

    let current_category = category_for_extension(current)?;
    let proposed_category = category_for_extension(proposed)?;

    (current_category == proposed_category).then_some(proposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Enclosure, Transcript};

    fn item(link: Option<&str>, enclosure: Option<(&str, Option<&str>)>) -> FeedItem {
        FeedItem {
            title: "Test".to_string(),
            link: link.map(String::from),
            enclosure: enclosure.map(|(url, mime)| Enclosure {
                url: url.to_string(),
                length: None,
                mime_type: mime.map(String::from),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn mime_table_ignores_parameters_and_case() {
        assert_eq!(extension_for_mime("Audio/MPEG; charset=binary"), Some(".mp3"));
        assert_eq!(extension_for_mime("audio/mp4"), Some(".m4a"));
        assert_eq!(extension_for_mime("application/octet-stream"), None);
    }

    #[test]
    fn categories_are_explicit() {
        assert_eq!(category_for_extension(".mp3"), Some(MediaCategory::Audio));
        assert_eq!(category_for_extension("PNG"), Some(MediaCategory::Image));
        assert_eq!(category_for_extension(".vtt"), Some(MediaCategory::Transcript));
        assert_eq!(category_for_extension(".exe"), None);
    }

    #[test]
    fn url_extension_ignores_query_and_case() {
        assert_eq!(
            url_extension("https://example.com/a/episode.MP3?token=abc"),
            Some(".mp3".to_string())
        );
        assert_eq!(url_extension("https://example.com/episode"), None);
        assert_eq!(url_extension("https://example.com/.hidden"), None);
        assert_eq!(url_extension("not a url"), None);
    }

    #[test]
    fn resolve_prefers_order_for_audio_urls() {
        let item = item(
            Some("https://example.com/link.m4a"),
            Some(("https://example.com/enclosure.mp3", Some("audio/mpeg"))),
        );

        let by_default = resolve_audio(&item, &SourceKind::DEFAULT_ORDER).unwrap();
        assert_eq!(by_default.url, "https://example.com/enclosure.mp3");

        let link_first = resolve_audio(&item, &[SourceKind::Link, SourceKind::Enclosure]).unwrap();
        assert_eq!(link_first.url, "https://example.com/link.m4a");
        assert_eq!(link_first.extension, ".m4a");
    }

    #[test]
    fn resolve_skips_non_audio_link() {
        let item = item(
            Some("https://example.com/episode-page.html"),
            Some(("https://example.com/audio.ogg", None)),
        );

        let resolved = resolve_audio(&item, &[SourceKind::Link, SourceKind::Enclosure]).unwrap();
        assert_eq!(resolved.url, "https://example.com/audio.ogg");
        assert_eq!(resolved.extension, ".ogg");
    }

    #[test]
    fn resolve_falls_back_to_mime_type() {
        let item = item(
            None,
            Some(("https://cdn.example.com/stream?id=42", Some("audio/mp4"))),
        );

        let resolved = resolve_audio(&item, &SourceKind::DEFAULT_ORDER).unwrap();
        assert_eq!(resolved.url, "https://cdn.example.com/stream?id=42");
        assert_eq!(resolved.extension, ".m4a");
    }

    #[test]
    fn resolve_returns_none_without_usable_source() {
        assert!(resolve_audio(&item(None, None), &SourceKind::DEFAULT_ORDER).is_none());

        let unknown_mime = item(
            Some("https://example.com/page"),
            Some(("https://example.com/file", Some("application/octet-stream"))),
        );
        assert!(resolve_audio(&unknown_mime, &SourceKind::DEFAULT_ORDER).is_none());
    }

    #[test]
    fn source_kind_parses() {
        assert_eq!("link".parse::<SourceKind>(), Ok(SourceKind::Link));
        assert_eq!(" enclosure".parse::<SourceKind>(), Ok(SourceKind::Enclosure));
        assert!("guid".parse::<SourceKind>().is_err());
    }

    #[test]
    fn image_defaults_to_jpg() {
        let resolved = resolve_image(Some("https://example.com/cover")).unwrap();
        assert_eq!(resolved.extension, ".jpg");

        let png = resolve_image(Some("https://example.com/cover.PNG")).unwrap();
        assert_eq!(png.extension, ".png");

        assert!(resolve_image(None).is_none());
        assert!(resolve_image(Some("")).is_none());
    }

    #[test]
    fn transcript_respects_preferred_types() {
        let mut item = item(None, None);
        item.transcripts = vec![
            Transcript {
                url: "https://example.com/t.vtt".to_string(),
                mime_type: Some("text/vtt".to_string()),
            },
            Transcript {
                url: "https://example.com/t".to_string(),
                mime_type: Some("application/srt".to_string()),
            },
        ];

        let first = resolve_transcript(&item, &[]).unwrap();
        assert_eq!(first.extension, ".vtt");

        let srt = resolve_transcript(&item, &["application/srt".to_string()]).unwrap();
        assert_eq!(srt.url, "https://example.com/t");
        assert_eq!(srt.extension, ".srt");

        assert!(resolve_transcript(&item, &["text/html".to_string()]).is_none());
    }

    #[test]
    fn transcript_never_takes_an_audio_extension() {
        let mut item = item(None, None);
        item.transcripts = vec![Transcript {
            url: "https://example.com/transcript".to_string(),
            mime_type: Some("audio/mpeg".to_string()),
        }];

        let transcript = resolve_transcript(&item, &[]).unwrap();
        assert_eq!(transcript.extension, ".txt");

        item.transcripts[0].url = "https://example.com/transcript.mp3".to_string();
        assert_eq!(resolve_transcript(&item, &[]).unwrap().extension, ".txt");
    }

    #[test]
    fn correction_swaps_within_category() {
        assert_eq!(corrected_extension(".mp3", Some("audio/mp4")), Some(".m4a"));
        assert_eq!(corrected_extension(".jpg", Some("image/png")), Some(".png"));
    }

    #[test]
    fn correction_never_crosses_categories() {
        assert_eq!(corrected_extension(".mp3", Some("image/jpeg")), None);
        assert_eq!(corrected_extension(".png", Some("audio/mpeg")), None);
    }

    #[test]
    fn correction_is_conservative_for_unknowns() {
        assert_eq!(corrected_extension(".bin", Some("audio/mpeg")), None);
        assert_eq!(corrected_extension(".mp3", Some("application/octet-stream")), None);
        assert_eq!(corrected_extension(".mp3", None), None);
        assert_eq!(corrected_extension(".mp3", Some("audio/mpeg")), None);
    }
}
