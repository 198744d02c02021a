mod fetch;
mod parse;

pub use fetch::{archive_prefix, fetch_feed, file_path_to_url, is_url, parse_feed_file};
pub use parse::{Enclosure, Feed, FeedItem, Transcript, parse_feed};
