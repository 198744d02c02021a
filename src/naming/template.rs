// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::NamingError;
use crate::feed::{Feed, FeedItem};

use super::filters::apply_filters;
use super::sanitize::{DEFAULT_MAX_LENGTH, safe_filename, safe_name};

/// `{{token}}` or `{{token|filter|filter}}`
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)(\|[^}]+)?\}\}").expect("token pattern is valid"));

/// Stem used when a template renders to nothing
const EMPTY_STEM: &str = "untitled";

/// Options shaping how item paths are rendered
#[derive(Debug, Clone)]
pub struct NamingOptions {
    /// Minimum digits of `{{episode_num}}`, zero padded
    pub episode_digits: usize,
    /// Added to every computed episode number
    pub episode_offset: i64,
    /// Byte limit for every path segment, extension included
    pub max_length: usize,
    custom_patterns: Vec<Regex>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            episode_digits: 1,
            episode_offset: 0,
            max_length: DEFAULT_MAX_LENGTH,
            custom_patterns: Vec::new(),
        }
    }
}

impl NamingOptions {
    /// Compile `custom_N` patterns, matched against item titles
    pub fn with_custom_patterns<S: AsRef<str>>(
        mut self,
        patterns: &[S],
    ) -> Result<Self, NamingError> {
        self.custom_patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|e| NamingError::InvalidPattern {
                    pattern: pattern.as_ref().to_string(),
                    source: e,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(self)
    }
}

/// Episode number derived from feed position; the oldest item is episode `1 + offset`
pub fn episode_number(item: &FeedItem, feed: &Feed, offset: i64) -> i64 {
    feed.items.len() as i64 - item.index as i64 + offset
}

fn item_replacements(
    item: &FeedItem,
    feed: &Feed,
    url: &str,
    options: &NamingOptions,
) -> HashMap<String, String> {
    let date = |format: &str| {
        item.pub_date
            .map(|dt| dt.format(format).to_string())
            .unwrap_or_default()
    };

    let episode_num = format!(
        "{:0width$}",
        episode_number(item, feed, options.episode_offset),
        width = options.episode_digits
    );

    let mut replacements: HashMap<String, String> = [
        ("title", item.title.clone()),
        ("release_date", date("%Y%m%d")),
        ("release_year", date("%Y")),
        ("release_month", date("%m")),
        ("release_day", date("%d")),
        ("episode_num", episode_num),
        ("url", url.to_string()),
        ("podcast_title", feed.title.clone()),
        ("podcast_link", feed.link.clone().unwrap_or_default()),
        ("duration", item.duration.clone().unwrap_or_default()),
        ("guid", item.guid.clone().unwrap_or_default()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    for (i, pattern) in options.custom_patterns.iter().enumerate() {
        let value = pattern
            .find(&item.title)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        replacements.insert(format!("custom_{}", i), value);
    }

    replacements
}

fn substitute(
    segment: &str,
    replacements: &HashMap<String, String>,
    finish: impl Fn(String) -> String,
) -> String {
    TOKEN_RE
        .replace_all(segment, |caps: &Captures| {
            let value = replacements
                .get(&caps[1])
                .map(String::as_str)
                .unwrap_or_default();
            finish(apply_filters(value, caps.get(2).map(|m| m.as_str())))
        })
        .into_owned()
}

/// Render the relative output path of an artifact belonging to `item`
///
/// `template` may contain `/` to create subdirectories. Every segment is
/// sanitized on its own; the last one also receives `extension` and stays
/// within `options.max_length` bytes including it.
pub fn render_item_path(
    item: &FeedItem,
    feed: &Feed,
    template: &str,
    url: &str,
    extension: &str,
    options: &NamingOptions,
) -> PathBuf {
    let replacements = item_replacements(item, feed, url, options);
    let raw_segments: Vec<&str> = template.trim().split(['/', '\\']).collect();
    let last = raw_segments.len() - 1;

    let mut path = PathBuf::new();
    for (i, raw) in raw_segments.into_iter().enumerate() {
        let rendered = substitute(raw, &replacements, |v| v);

        if i == last {
            let stem = safe_name(&rendered, options.max_length);
            let stem = if stem.is_empty() { EMPTY_STEM } else { &stem };
            path.push(safe_filename(stem, extension, options.max_length));
        } else {
            let segment = safe_name(&rendered, options.max_length);
            if !segment.is_empty() {
                path.push(segment);
            }
        }
    }

    path
}

/// Render an output folder or archive path from feed-level tokens
///
/// Only `podcast_title` and `podcast_link` are known here; each substituted
/// value is sanitized while the literal template text is kept as written.
pub fn render_folder(feed: &Feed, template: &str, max_length: usize) -> PathBuf {
    let replacements: HashMap<String, String> = [
        ("podcast_title".to_string(), feed.title.clone()),
        (
            "podcast_link".to_string(),
            feed.link.clone().unwrap_or_default(),
        ),
    ]
    .into_iter()
    .collect();

    PathBuf::from(substitute(template, &replacements, |v| {
        safe_name(&v, max_length)
    }))
}
