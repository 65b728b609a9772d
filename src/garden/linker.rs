//! Wikilinks into existing vault notes.

use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::matcher::KeywordMatcher;
use crate::fsutil::is_hidden;

/// Titles shorter than this are never linked
const MIN_TITLE_CHARS: usize = 3;

/// A note that can be linked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub title: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    aliases: Option<serde_yaml::Value>,
}

fn protected_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```.*?```|`[^`\n]*`|\[\[[^\]\n]*\]\]|!?\[[^\]\n]*\]\([^)\n]*\)|<?https?://[^\s>)]+>?")
            .ok()
    })
    .as_ref()
}

fn wikilink_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]|#\n]+)").ok()).as_ref()
}

pub struct Linker {
    targets: Vec<LinkTarget>,
    matcher: KeywordMatcher,
}

impl Linker {
    pub fn new(targets: Vec<LinkTarget>) -> Result<Self, regex::Error> {
        let matcher = KeywordMatcher::new(targets.iter().enumerate().flat_map(|(idx, t)| {
            std::iter::once(t.title.as_str())
                .chain(t.aliases.iter().map(String::as_str))
                .filter(|name| name.trim().chars().count() >= MIN_TITLE_CHARS)
                .map(move |name| (idx, name))
        }))?;
        Ok(Self { targets, matcher })
    }

    /// Collect titles and aliases of every markdown note under `vault`
    pub async fn from_vault(vault: &Path) -> std::io::Result<Self> {
        let vault = vault.to_path_buf();
        let targets = tokio::task::spawn_blocking(move || scan_vault(&vault))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        debug!(notes = targets.len(), "Loaded link targets");
        Self::new(targets).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Link the first mention of each known note across `fields`, in order.
    ///
    /// Titles already linked anywhere in the fields, and `own_title`, are
    /// skipped. Returns the titles newly linked.
    pub fn link_fields(&self, fields: &mut [&mut String], own_title: &str) -> Vec<String> {
        let mut linked: HashSet<String> = fields
            .iter()
            .flat_map(|f| existing_links(f))
            .collect();
        linked.insert(own_title.trim().to_lowercase());

        let mut added = Vec::new();
        for field in fields.iter_mut() {
            let (text, titles) = self.link_text(field, &mut linked);
            **field = text;
            added.extend(titles);
        }
        added
    }

    /// Link a single text
    pub fn link(&self, text: &str) -> (String, Vec<String>) {
        let mut linked = existing_links(text).into_iter().collect();
        self.link_text(text, &mut linked)
    }

    fn link_text(&self, text: &str, linked: &mut HashSet<String>) -> (String, Vec<String>) {
        let mut out = String::with_capacity(text.len() + 32);
        let mut added = Vec::new();
        let mut cursor = 0;

        for segment in linkable_segments(text) {
            out.push_str(&text[cursor..segment.start]);
            let mut seg_cursor = segment.start;

            for m in self.matcher.find_all(&text[segment.clone()]) {
                let [owner] = m.owners.as_slice() else {
                    continue;
                };
                let target = &self.targets[*owner];
                let key = target.title.trim().to_lowercase();
                if linked.contains(&key) {
                    continue;
                }

                let start = segment.start + m.range.start;
                let end = segment.start + m.range.end;
                out.push_str(&text[seg_cursor..start]);
                if m.text == target.title {
                    out.push_str(&format!("[[{}]]", target.title));
                } else {
                    out.push_str(&format!("[[{}|{}]]", target.title, m.text));
                }
                seg_cursor = end;

                linked.insert(key);
                added.push(target.title.clone());
            }

            out.push_str(&text[seg_cursor..segment.end]);
            cursor = segment.end;
        }
        out.push_str(&text[cursor..]);
        (out, added)
    }
}

/// Lowercased targets of wikilinks already in `text`
fn existing_links(text: &str) -> Vec<String> {
    let Some(re) = wikilink_re() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_lowercase())
        .collect()
}

/// Byte ranges of `text` outside code, links and URLs
fn linkable_segments(text: &str) -> Vec<Range<usize>> {
    let Some(re) = protected_re() else {
        return Vec::new();
    };
    let mut segments = Vec::new();
    let mut cursor = 0;
    for m in re.find_iter(text) {
        if m.start() > cursor {
            segments.push(cursor..m.start());
        }
        cursor = m.end();
    }
    if cursor < text.len() {
        segments.push(cursor..text.len());
    }
    segments
}

/// Lowercase, strip `#`, dash-join words, dedupe and sort
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| {
            t.trim()
                .trim_start_matches('#')
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-")
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn scan_vault(vault: &Path) -> std::io::Result<Vec<LinkTarget>> {
    let mut targets = Vec::new();
    if !vault.exists() {
        return Ok(targets);
    }

    let mut stack = vec![vault.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path.strip_prefix(vault).unwrap_or(&path);
            if is_hidden(rel) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e == "md").unwrap_or(false) {
                let content = std::fs::read_to_string(&path).unwrap_or_default();
                if let Some(target) = target_for(&path, &content) {
                    targets.push(target);
                }
            }
        }
    }

    targets.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(targets)
}

fn target_for(path: &Path, content: &str) -> Option<LinkTarget> {
    let front = front_matter(content);
    let title = front
        .title
        .filter(|t| !t.trim().is_empty())
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))?;

    let aliases = match front.aliases {
        Some(serde_yaml::Value::String(s)) => vec![s],
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Some(LinkTarget {
        title: title.trim().to_string(),
        aliases,
    })
}

fn front_matter(content: &str) -> FrontMatter {
    let Some(rest) = content.strip_prefix("---") else {
        return FrontMatter::default();
    };
    let Some(end) = rest.find("\n---") else {
        return FrontMatter::default();
    };
    serde_yaml::from_str(&rest[..end]).unwrap_or_default()
}
