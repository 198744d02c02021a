// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing which feed items a run works on.

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

use crate::error::NamingError;
use crate::feed::{Feed, FeedItem};
use crate::naming::episode_number;

/// Criteria narrowing the items of a feed
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Items skipped from the start (or from the end with `reverse`)
    pub offset: usize,
    pub limit: Option<usize>,
    /// Walk the feed oldest first
    pub reverse: bool,
    /// Earliest publish day, inclusive
    pub after: Option<NaiveDate>,
    /// Latest publish day, inclusive
    pub before: Option<NaiveDate>,
    pub season: Option<u32>,
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl ItemFilter {
    /// Build a filter, compiling the title include and exclude patterns
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, NamingError> {
        Ok(Self {
            include: include.map(compile).transpose()?,
            exclude: exclude.map(compile).transpose()?,
            ..Default::default()
        })
    }

    pub fn matches(&self, item: &FeedItem) -> bool {
        if !item.title.is_empty() {
            if self.include.as_ref().is_some_and(|re| !re.is_match(&item.title)) {
                return false;
            }
            if self.exclude.as_ref().is_some_and(|re| re.is_match(&item.title)) {
                return false;
            }
        }

        if self.after.is_some() || self.before.is_some() {
            let Some(day) = item.pub_date.map(|d| d.date_naive()) else {
                return false;
            };
            if self.after.is_some_and(|after| day < after) {
                return false;
            }
            if self.before.is_some_and(|before| day > before) {
                return false;
            }
        }

        match self.season {
            Some(season) => item.season_number == Some(season),
            None => true,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, NamingError> {
    Regex::new(pattern).map_err(|e| NamingError::InvalidPattern {
        pattern: pattern.to_string(),
        source: e,
    })
}

/// Items to work on, in walk order
///
/// `is_archived` is asked about every matching item and lets callers drop
/// items whose primary artifact is already on record.
pub fn select_items<'a>(
    feed: &'a Feed,
    filter: &ItemFilter,
    is_archived: impl Fn(&FeedItem) -> bool,
) -> Vec<&'a FeedItem> {
    let len = feed.items.len();
    let indices: Box<dyn Iterator<Item = usize>> = if filter.reverse {
        Box::new((0..len.saturating_sub(filter.offset)).rev())
    } else {
        Box::new(filter.offset.min(len)..len)
    };

    indices
        .map(|i| &feed.items[i])
        .filter(|item| filter.matches(item))
        .filter(|item| !is_archived(item))
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect()
}

/// One row of `--list` output
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListEntry {
    pub season: Option<u32>,
    pub episode: i64,
    pub title: String,
    pub pub_date: Option<String>,
}

pub fn list_entries(feed: &Feed, items: &[&FeedItem]) -> Vec<ListEntry> {
    items
        .iter()
        .map(|item| ListEntry {
            season: item.season_number,
            episode: episode_number(item, feed, 0),
            title: item.title.clone(),
            pub_date: item.pub_date.map(|d| d.to_rfc2822()),
        })
        .collect()
}
