// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use sanitize_filename::{Options, sanitize_with_options};

/// Character substituted for anything illegal in a filename
pub const INVALID_CHAR_REPLACEMENT: char = '_';

/// Default upper bound, in bytes, for a single path segment
pub const DEFAULT_MAX_LENGTH: usize = 255;

/// Make a single path segment safe for every mainstream filesystem
///
/// Illegal characters become `_`, runs of `_` collapse to one and outer
/// `_` are stripped. The result is at most `max_len` bytes long.
pub fn safe_name(name: &str, max_len: usize) -> String {
    let replacement = INVALID_CHAR_REPLACEMENT.to_string();
    let sanitized = sanitize_with_options(
        name,
        Options {
            windows: true,
            truncate: false,
            replacement: &replacement,
        },
    );

    let collapsed = collapse_replacements(&sanitized);
    let truncated = truncate_at_char_boundary(&collapsed, max_len);

    // Truncation can expose a trailing dot or space, which Windows rejects
    truncated.trim_end_matches(['.', ' ']).to_string()
}

/// Suffix of in-flight sibling files; its length is reserved in every filename
pub const TEMP_SUFFIX: &str = ".tmp";

/// Safe name with an extension appended
///
/// Room is reserved for the extension and for [`TEMP_SUFFIX`], so the name
/// and its in-flight sibling both stay within `max_len` bytes.
pub fn safe_filename(name: &str, ext: &str, max_len: usize) -> String {
    let stem = safe_name(name, max_len.saturating_sub(ext.len() + TEMP_SUFFIX.len()));
    format!("{}{}", stem, ext)
}

/// Collapse runs of the replacement character and strip it from both ends
fn collapse_replacements(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_replacement = false;

    for c in s.chars() {
        if c == INVALID_CHAR_REPLACEMENT {
            if !last_was_replacement {
                result.push(c);
            }
            last_was_replacement = true;
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    if result.chars().count() > 1 {
        result
            .trim_matches(INVALID_CHAR_REPLACEMENT)
            .to_string()
    } else {
        result
    }
}

/// Truncate to at most `max_len` bytes without splitting a UTF-8 sequence
fn truncate_at_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }

    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
