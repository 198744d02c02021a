// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// String filters that can be chained onto a template token: `{{title|dash|lowercase}}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameFilter {
    /// Remove all whitespace
    Strip,
    /// Keep only ASCII letters, digits and whitespace
    StripSpecial,
    /// Whitespace runs become `_`
    Underscore,
    /// Whitespace runs become `-`
    Dash,
    /// Capitalize every word and join them
    CamelCase,
    Lowercase,
    Uppercase,
    Trim,
}

impl NameFilter {
    /// Look up a filter by name; unknown names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        let filter = match name.trim() {
            "strip" => NameFilter::Strip,
            "strip_special" => NameFilter::StripSpecial,
            "underscore" => NameFilter::Underscore,
            "dash" => NameFilter::Dash,
            "camelcase" => NameFilter::CamelCase,
            "lowercase" => NameFilter::Lowercase,
            "uppercase" => NameFilter::Uppercase,
            "trim" => NameFilter::Trim,
            _ => return None,
        };
        Some(filter)
    }

    pub fn apply(self, value: &str) -> String {
        match self {
            NameFilter::Strip => value.chars().filter(|c| !c.is_whitespace()).collect(),
            NameFilter::StripSpecial => value
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
                .collect(),
            NameFilter::Underscore => replace_whitespace_runs(value, "_"),
            NameFilter::Dash => replace_whitespace_runs(value, "-"),
            NameFilter::CamelCase => value.split_whitespace().map(capitalize).collect(),
            NameFilter::Lowercase => value.to_lowercase(),
            NameFilter::Uppercase => value.to_uppercase(),
            NameFilter::Trim => value.trim().to_string(),
        }
    }
}

/// Apply a `|a|b` filter chain; unknown filter names are skipped
pub fn apply_filters(value: &str, chain: Option<&str>) -> String {
    let Some(chain) = chain else {
        return value.to_string();
    };

    chain
        .split('|')
        .filter(|name| !name.is_empty())
        .filter_map(NameFilter::from_name)
        .fold(value.to_string(), |acc, filter| filter.apply(&acc))
}

fn replace_whitespace_runs(value: &str, with: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut in_run = false;

    for c in value.chars() {
        if c.is_whitespace() {
            if !in_run {
                result.push_str(with);
                in_run = true;
            }
        } else {
            result.push(c);
            in_run = false;
        }
    }

    result
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
