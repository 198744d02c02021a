// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::error::FeedError;

/// Represents a parsed podcast feed
#[derive(Debug, Clone)]
pub struct Feed {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub feed_url: Url,
    /// Items in document order, newest first
    pub items: Vec<FeedItem>,
}

/// Represents a single feed entry (one episode)
#[derive(Debug, Clone, Default)]
pub struct FeedItem {
    /// Position of the item in the feed document
    pub index: usize,
    pub title: String,
    pub description: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub guid: Option<String>,
    pub link: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub image_url: Option<String>,
    pub transcripts: Vec<Transcript>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub duration: Option<String>,
    pub episode_type: Option<String>,
    pub episode_number: Option<u32>,
    pub season_number: Option<u32>,
}

/// Represents the media file attached to an item
#[derive(Debug, Clone, Default)]
pub struct Enclosure {
    pub url: String,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

/// One `podcast:transcript` variant of an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub url: String,
    pub mime_type: Option<String>,
}

/// Parse RSS feed XML bytes into a Feed
pub fn parse_feed(xml_bytes: &[u8], feed_url: Url) -> Result<Feed, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let items = channel
        .items()
        .iter()
        .enumerate()
        .map(|(index, item)| parse_item(index, item))
        .collect();

    let image_url = channel
        .image()
        .map(|img| img.url().to_string())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .map(String::from)
        })
        .filter(|s| !s.is_empty());

    let author = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    Ok(Feed {
        title: channel.title().to_string(),
        description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
        link: Some(channel.link().to_string()).filter(|s| !s.is_empty()),
        author,
        image_url,
        feed_url,
        items,
    })
}

fn parse_item(index: usize, item: &rss::Item) -> FeedItem {
    let pub_date = item.pub_date().and_then(|date_str| {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .or_else(|| parse_relaxed_date(date_str))
    });

    let enclosure = item.enclosure().map(|enclosure| Enclosure {
        url: enclosure.url().to_string(),
        length: enclosure.length().parse().ok(),
        mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
    });

    let itunes = item.itunes_ext();

    FeedItem {
        index,
        title: item.title().unwrap_or_default().to_string(),
        description: item
            .content()
            .or_else(|| item.description())
            .map(String::from),
        pub_date,
        guid: item.guid().map(|g| g.value().to_string()),
        link: item.link().map(String::from).filter(|s| !s.is_empty()),
        enclosure,
        image_url: itunes
            .and_then(|ext| ext.image())
            .map(String::from)
            .filter(|s| !s.is_empty()),
        transcripts: parse_transcripts(item),
        author: itunes
            .and_then(|ext| ext.author().map(String::from))
            .or_else(|| item.author().map(String::from))
            .or_else(|| {
                item.dublin_core_ext()
                    .and_then(|dc| dc.creators().first().cloned())
            }),
        subtitle: itunes.and_then(|ext| ext.subtitle().map(String::from)),
        duration: itunes.and_then(|ext| ext.duration().map(String::from)),
        episode_type: itunes.and_then(|ext| ext.episode_type().map(String::from)),
        episode_number: itunes.and_then(|ext| ext.episode().and_then(|e| e.parse().ok())),
        season_number: itunes.and_then(|ext| ext.season().and_then(|s| s.parse().ok())),
    }
}

/// Collect `<podcast:transcript url=".." type=".."/>` elements
fn parse_transcripts(item: &rss::Item) -> Vec<Transcript> {
    item.extensions()
        .get("podcast")
        .and_then(|ns| ns.get("transcript"))
        .map(|elements| {
            elements
                .iter()
                .filter_map(|ext| {
                    let url = ext.attrs().get("url")?.trim().to_string();
                    if url.is_empty() {
                        return None;
                    }
                    Some(Transcript {
                        url,
                        mime_type: ext.attrs().get("type").map(|t| t.trim().to_lowercase()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Try to parse dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date_str.trim()).ok())
}
