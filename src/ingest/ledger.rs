//! Link-queue files.
//!
//! A queue file is a markdown list the user edits by hand:
//!
//! ```text
//! - [ ] https://youtu.be/abc  talk on storage engines
//! - [ ] https://example.com/post 🔄
//! - [x] https://example.com/done ✅
//! - [ ] https://example.com/broken ❌ HTTP 404
//! ```
//!
//! The file itself is the source of truth. Only the checkbox character and
//! the trailing status segment of an entry are ever rewritten; every other
//! byte (comments, headings, blank lines, line endings) is kept as is.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::write_atomic;

const PENDING: char = '⏳';
const IN_PROGRESS: char = '🔄';
const DONE: char = '✅';
const ERROR: char = '❌';

/// Longest error reason written back into a queue file
const MAX_REASON_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to read queue file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write queue file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Processing state of one queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Done,
    Error { reason: String },
}

impl QueueStatus {
    fn segment(&self) -> String {
        match self {
            Self::Pending => PENDING.to_string(),
            Self::InProgress => IN_PROGRESS.to_string(),
            Self::Done => DONE.to_string(),
            Self::Error { reason } => {
                let reason = short_reason(reason);
                if reason.is_empty() {
                    ERROR.to_string()
                } else {
                    format!("{} {}", ERROR, reason)
                }
            }
        }
    }
}

/// One-line reason without status symbols
fn short_reason(reason: &str) -> String {
    let flat: String = reason
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| ![PENDING, IN_PROGRESS, DONE, ERROR].contains(c))
        .collect();
    let flat = flat.trim();
    if flat.chars().count() > MAX_REASON_CHARS {
        let cut: String = flat.chars().take(MAX_REASON_CHARS - 1).collect();
        format!("{}…", cut.trim_end())
    } else {
        flat.to_string()
    }
}

/// A queue line carrying a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub url: String,
    pub status: QueueStatus,
    lead: String,
    checkbox: Option<(char, String)>,
    body: String,
    gap: String,
    segment: String,
    ending: String,
}

impl QueueEntry {
    /// Parse one line (without its line ending)
    fn parse(line: &str, ending: &str) -> Option<Self> {
        let re = regexes()?;
        let caps = re.entry.captures(line)?;
        let lead = caps.name("lead")?.as_str().to_string();
        let checkbox = caps
            .name("check")
            .and_then(|c| c.as_str().chars().next())
            .map(|c| (c, caps.name("after").map_or("", |m| m.as_str()).to_string()));
        let rest = caps.name("rest")?.as_str();

        let (before, segment) = match rest.rfind([PENDING, IN_PROGRESS, DONE, ERROR]) {
            Some(idx) if is_status_segment(&rest[idx..]) => (&rest[..idx], &rest[idx..]),
            _ => (rest, ""),
        };
        let body = before.trim_end();
        let gap = &before[body.len()..];

        let url = re.url.find(body)?.as_str().to_string();

        let status = match segment.chars().next() {
            Some(IN_PROGRESS) => QueueStatus::InProgress,
            Some(DONE) => QueueStatus::Done,
            Some(ERROR) => QueueStatus::Error {
                reason: segment[ERROR.len_utf8()..].trim().to_string(),
            },
            Some(_) => QueueStatus::Pending,
            None => match checkbox {
                Some((c, _)) if c.eq_ignore_ascii_case(&'x') => QueueStatus::Done,
                _ => QueueStatus::Pending,
            },
        };

        Some(Self {
            url,
            status,
            lead,
            checkbox,
            body: body.to_string(),
            gap: gap.to_string(),
            segment: segment.to_string(),
            ending: ending.to_string(),
        })
    }

    fn set_status(&mut self, status: QueueStatus) {
        if status == QueueStatus::Done {
            if let Some((c, _)) = self.checkbox.as_mut() {
                *c = 'x';
            }
        }
        if self.gap.is_empty() {
            self.gap = " ".to_string();
        }
        self.segment = status.segment();
        self.status = status;
    }

    fn render(&self, out: &mut String) {
        out.push_str(&self.lead);
        if let Some((c, after)) = &self.checkbox {
            out.push('[');
            out.push(*c);
            out.push(']');
            out.push_str(after);
        }
        out.push_str(&self.body);
        out.push_str(&self.gap);
        out.push_str(&self.segment);
        out.push_str(&self.ending);
    }
}

/// A status symbol closes the line; only `❌` may carry trailing text (the reason)
fn is_status_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(ERROR) => true,
        Some(_) => chars.as_str().trim().is_empty(),
        None => false,
    }
}

struct Regexes {
    entry: Regex,
    url: Regex,
}

fn regexes() -> Option<&'static Regexes> {
    static RE: OnceLock<Option<Regexes>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(Regexes {
            entry: Regex::new(
                r"^(?P<lead>\s*(?:[-*+]|\d+[.)])\s+)(?:\[(?P<check>[ xX])\](?P<after>\s+))?(?P<rest>.*)$",
            )
            .ok()?,
            url: Regex::new(r#"https?://[^\s<>()\[\]"']+"#).ok()?,
        })
    })
    .as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueLine {
    Entry(QueueEntry),
    /// Any other line, verbatim including its ending
    Other(String),
}

/// A parsed queue file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDocument {
    lines: Vec<QueueLine>,
}

impl QueueDocument {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .split_inclusive('\n')
            .map(|raw| {
                let content = raw.trim_end_matches(['\n', '\r']);
                let ending = &raw[content.len()..];
                match QueueEntry::parse(content, ending) {
                    Some(entry) => QueueLine::Entry(entry),
                    None => QueueLine::Other(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                QueueLine::Entry(entry) => entry.render(&mut out),
                QueueLine::Other(raw) => out.push_str(raw),
            }
        }
        out
    }

    /// Entries with their line numbers (0-based)
    pub fn entries(&self) -> impl Iterator<Item = (usize, &QueueEntry)> {
        self.lines.iter().enumerate().filter_map(|(i, l)| match l {
            QueueLine::Entry(e) => Some((i, e)),
            QueueLine::Other(_) => None,
        })
    }

    fn entry_mut(&mut self, line: usize) -> Option<&mut QueueEntry> {
        match self.lines.get_mut(line) {
            Some(QueueLine::Entry(e)) => Some(e),
            _ => None,
        }
    }

    /// Update the entry for `url`, preferring the hinted line, then an
    /// in-progress entry, then any entry. Returns false if no entry matches.
    pub fn set_status(&mut self, url: &str, line_hint: Option<usize>, status: QueueStatus) -> bool {
        let hinted = line_hint.filter(|&i| {
            matches!(self.lines.get(i), Some(QueueLine::Entry(e)) if e.url == url)
        });
        let target = hinted
            .or_else(|| {
                self.entries()
                    .find(|(_, e)| e.url == url && e.status == QueueStatus::InProgress)
                    .map(|(i, _)| i)
            })
            .or_else(|| self.entries().find(|(_, e)| e.url == url).map(|(i, _)| i));

        match target.and_then(|i| self.entry_mut(i)) {
            Some(entry) => {
                entry.set_status(status);
                true
            }
            None => false,
        }
    }
}

/// A queue entry handed to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedLink {
    pub url: String,
    pub queue_file: PathBuf,
    pub line: usize,
}

/// Outcome of claiming a queue file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueClaim {
    /// Pending entries that were just marked in-progress
    pub claimed: Vec<ClaimedLink>,
    /// Entries that were already in-progress before this claim
    pub in_flight: Vec<ClaimedLink>,
}

/// Reads and rewrites one queue file
#[derive(Debug, Clone)]
pub struct QueueLedger {
    path: PathBuf,
}

impl QueueLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(text: &str) -> QueueDocument {
        QueueDocument::parse(text)
    }

    pub async fn load(&self) -> Result<QueueDocument, LedgerError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| LedgerError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(QueueDocument::parse(&text))
    }

    async fn store(&self, doc: &QueueDocument) -> Result<(), LedgerError> {
        write_atomic(&self.path, doc.render().into_bytes())
            .await
            .map_err(|source| LedgerError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Mark every pending entry in-progress (one atomic write) and return
    /// them, together with the entries that were in-progress already
    pub async fn claim_pending(&self) -> Result<QueueClaim, LedgerError> {
        let mut doc = self.load().await?;
        let link = |line: usize, entry: &QueueEntry| ClaimedLink {
            url: entry.url.clone(),
            queue_file: self.path.clone(),
            line,
        };

        let mut claim = QueueClaim::default();
        for (line, entry) in doc.entries() {
            match entry.status {
                QueueStatus::Pending => claim.claimed.push(link(line, entry)),
                QueueStatus::InProgress => claim.in_flight.push(link(line, entry)),
                _ => {}
            }
        }

        if claim.claimed.is_empty() {
            debug!(path = %self.path.display(), in_flight = claim.in_flight.len(), "No pending queue entries");
            return Ok(claim);
        }

        for claimed in &claim.claimed {
            if let Some(entry) = doc.entry_mut(claimed.line) {
                entry.set_status(QueueStatus::InProgress);
            }
        }
        self.store(&doc).await?;

        info!(path = %self.path.display(), count = claim.claimed.len(), "Claimed queue entries");
        Ok(claim)
    }

    /// Rewrite the status of one entry; a missing entry or file is not an error
    pub async fn mark(
        &self,
        url: &str,
        line_hint: Option<usize>,
        status: QueueStatus,
    ) -> Result<bool, LedgerError> {
        let mut doc = match self.load().await {
            Ok(doc) => doc,
            Err(LedgerError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e),
        };

        if !doc.set_status(url, line_hint, status) {
            return Ok(false);
        }
        self.store(&doc).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "# Reading list\r\n\r\n- [ ] https://youtu.be/abc  talk on storage\r\n* https://example.com/a ⏳\r\n- [x] https://example.com/old\r\n- [ ] https://example.com/b 🔄\r\nnot a link line\r\n1. [ ] https://example.com/c ❌ HTTP 404\r\n- [ ] no url here";

    #[test]
    fn test_parse_render_is_lossless() {
        let doc = QueueDocument::parse(SAMPLE);
        assert_eq!(doc.render(), SAMPLE);

        let statuses: Vec<_> = doc.entries().map(|(_, e)| e.status.clone()).collect();
        assert_eq!(
            statuses,
            vec![
                QueueStatus::Pending,
                QueueStatus::Pending,
                QueueStatus::Done,
                QueueStatus::InProgress,
                QueueStatus::Error {
                    reason: "HTTP 404".into()
                },
            ]
        );
        let urls: Vec<_> = doc.entries().map(|(_, e)| e.url.as_str()).collect();
        assert_eq!(urls[0], "https://youtu.be/abc");
    }

    #[test]
    fn test_status_rewrite_touches_only_checkbox_and_symbol() {
        let mut doc = QueueDocument::parse("- [ ] https://example.com/x some comment\n");
        assert!(doc.set_status("https://example.com/x", None, QueueStatus::InProgress));
        assert_eq!(doc.render(), "- [ ] https://example.com/x some comment 🔄\n");

        assert!(doc.set_status("https://example.com/x", None, QueueStatus::Done));
        assert_eq!(doc.render(), "- [x] https://example.com/x some comment ✅\n");

        let mut doc = QueueDocument::parse("- [ ] https://example.com/y\t🔄");
        doc.set_status(
            "https://example.com/y",
            None,
            QueueStatus::Error {
                reason: "timed out\nafter 60s".into(),
            },
        );
        assert_eq!(doc.render(), "- [ ] https://example.com/y\t❌ timed out after 60s");
    }

    #[test]
    fn test_reason_is_clipped() {
        let long = "x".repeat(500);
        let segment = QueueStatus::Error { reason: long }.segment();
        assert!(segment.chars().count() <= MAX_REASON_CHARS + 2);
    }

    #[tokio::test]
    async fn test_claim_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.md");
        std::fs::write(&path, SAMPLE).unwrap();
        let ledger = QueueLedger::new(&path);

        let claim = ledger.claim_pending().await.unwrap();
        let urls: Vec<_> = claim.claimed.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://youtu.be/abc", "https://example.com/a"]);
        let in_flight: Vec<_> = claim.in_flight.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(in_flight, vec!["https://example.com/b"]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("- [ ] https://youtu.be/abc  talk on storage 🔄\r\n"));
        assert!(text.contains("* https://example.com/a 🔄\r\n"));
        assert!(text.ends_with("- [ ] no url here"));

        let again = ledger.claim_pending().await.unwrap();
        assert!(again.claimed.is_empty());
        assert_eq!(again.in_flight.len(), 3);

        let claim = &claim.claimed[1];
        assert!(ledger
            .mark(&claim.url, Some(claim.line), QueueStatus::Done)
            .await
            .unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("* https://example.com/a ✅\r\n"));
    }

    #[test]
    fn test_status_symbol_inside_comment_is_not_a_status() {
        let doc = QueueDocument::parse("- [ ] https://example.com/x  see ✅ later\n");
        let (_, entry) = doc.entries().next().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);

        let mut doc = doc;
        doc.set_status("https://example.com/x", Some(0), QueueStatus::InProgress);
        assert_eq!(doc.render(), "- [ ] https://example.com/x  see ✅ later 🔄\n");
        let reparsed = QueueDocument::parse(&doc.render());
        assert_eq!(reparsed.entries().next().unwrap().1.status, QueueStatus::InProgress);
    }

    #[tokio::test]
    async fn test_duplicate_urls_are_marked_by_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.md");
        std::fs::write(&path, "- [ ] https://example.com/x\n- [ ] https://example.com/x\n").unwrap();
        let ledger = QueueLedger::new(&path);

        let claim = ledger.claim_pending().await.unwrap();
        assert_eq!(claim.claimed.len(), 2);
        for link in &claim.claimed {
            ledger
                .mark(&link.url, Some(link.line), QueueStatus::Done)
                .await
                .unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "- [x] https://example.com/x ✅\n- [x] https://example.com/x ✅\n"
        );
    }

    #[tokio::test]
    async fn test_mark_missing_file() {
        let temp = TempDir::new().unwrap();
        let ledger = QueueLedger::new(temp.path().join("gone.md"));
        assert!(!ledger
            .mark("https://x", None, QueueStatus::Done)
            .await
            .unwrap());
    }
}
