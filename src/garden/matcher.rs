//! Multi-keyword matcher.
//!
//! All keywords are compiled into one case-insensitive alternation, longest
//! keyword first, so overlapping keywords resolve to the longest one
//! ("data protection officer" wins over "data protection"). Keyword edges
//! made of word characters get a word boundary.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use regex::{Regex, RegexBuilder};

/// One keyword occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch<'t> {
    pub range: Range<usize>,
    /// Matched text as it appears in the haystack
    pub text: &'t str,
    /// Canonical (lowercased) keyword
    pub keyword: String,
    /// Owners registered for the keyword
    pub owners: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    regex: Option<Regex>,
    owners: HashMap<String, Vec<usize>>,
}

impl KeywordMatcher {
    /// Build from `(owner, keyword)` pairs. Blank keywords are skipped.
    pub fn new<I, S>(entries: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (usize, S)>,
        S: AsRef<str>,
    {
        let mut owners: HashMap<String, Vec<usize>> = HashMap::new();
        for (owner, keyword) in entries {
            let keyword = canonical(keyword.as_ref());
            if keyword.is_empty() {
                continue;
            }
            let list = owners.entry(keyword).or_default();
            if !list.contains(&owner) {
                list.push(owner);
            }
        }

        let mut keywords: Vec<&String> = owners.keys().collect();
        keywords.sort_by(|a, b| {
            b.chars()
                .count()
                .cmp(&a.chars().count())
                .then_with(|| a.cmp(b))
        });

        let regex = if keywords.is_empty() {
            None
        } else {
            let alternation = keywords
                .iter()
                .map(|k| bounded(k))
                .collect::<Vec<_>>()
                .join("|");
            Some(
                RegexBuilder::new(&alternation)
                    .case_insensitive(true)
                    .size_limit(32 * 1024 * 1024)
                    .build()?,
            )
        };

        Ok(Self { regex, owners })
    }

    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }

    /// Non-overlapping occurrences, left to right
    pub fn find_all<'t>(&self, text: &'t str) -> Vec<KeywordMatch<'t>> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };
        regex
            .find_iter(text)
            .filter_map(|m| {
                let keyword = canonical(m.as_str());
                let owners = self.owners.get(&keyword)?.clone();
                Some(KeywordMatch {
                    range: m.range(),
                    text: m.as_str(),
                    keyword,
                    owners,
                })
            })
            .collect()
    }

    /// Distinct keywords hit per owner
    pub fn distinct_hits(&self, text: &str) -> HashMap<usize, BTreeSet<String>> {
        let mut hits: HashMap<usize, BTreeSet<String>> = HashMap::new();
        for m in self.find_all(text) {
            for owner in m.owners {
                hits.entry(owner).or_default().insert(m.keyword.clone());
            }
        }
        hits
    }
}

/// Lowercase with internal whitespace collapsed
fn canonical(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bounded(keyword: &str) -> String {
    let escaped = keyword
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let word = |c: Option<char>| c.map(|c| c.is_alphanumeric() || c == '_').unwrap_or(false);
    let start = if word(keyword.chars().next()) { r"\b" } else { "" };
    let end = if word(keyword.chars().last()) { r"\b" } else { "" };
    format!("{}{}{}", start, escaped, end)
}
