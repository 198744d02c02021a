// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::LazyLock;

use regex::Regex;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*").expect("blank line pattern is valid"));

/// Reduce an HTML fragment to readable text
///
/// Line-breaking tags become newlines, other tags are dropped and entities
/// are decoded.
pub fn plain_text(html: &str) -> String {
    let with_breaks = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</p>", "\n\n");
    let stripped = TAG_RE.replace_all(&with_breaks, "");
    let decoded = html_escape::decode_html_entities(&stripped);
    BLANK_LINES_RE
        .replace_all(decoded.trim(), "\n\n")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_decodes_entities() {
        assert_eq!(
            plain_text("<p>Tom &amp; Jerry <b>live</b></p>"),
            "Tom & Jerry live"
        );
    }

    #[test]
    fn keeps_paragraph_breaks() {
        assert_eq!(
            plain_text("<p>One</p><p>Two<br/>Three</p>"),
            "One\n\nTwo\nThree"
        );
    }

    #[test]
    fn plain_input_is_untouched() {
        assert_eq!(plain_text("Just text"), "Just text");
    }
}
