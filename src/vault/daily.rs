//! Daily log: one report entry per committed note in `<vault>/<daily>/<date>.md`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;

use crate::domain::NoteDraft;
use crate::fsutil::write_atomic;

/// Summary characters quoted in an entry
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct DailyLog {
    dir: PathBuf,
}

impl DailyLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, at: DateTime<Local>) -> PathBuf {
        self.dir.join(format!("{}.md", at.format("%Y-%m-%d")))
    }

    /// Append an entry linking `note_link`; returns false if it is already logged
    pub async fn append(
        &self,
        at: DateTime<Local>,
        note_link: &str,
        draft: &NoteDraft,
    ) -> std::io::Result<bool> {
        let path = self.path_for(at);
        let link = format!("[[{}]]", note_link);

        let mut content = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => template(at),
            Err(e) => return Err(e),
        };
        if content.contains(&link) {
            debug!(path = %path.display(), "Daily entry already present");
            return Ok(false);
        }

        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&entry(at, &link, draft));
        write_atomic(&path, content.into_bytes()).await?;
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn template(at: DateTime<Local>) -> String {
    format!("# {}\n\n## Processed\n\n", at.format("%Y-%m-%d"))
}

fn entry(at: DateTime<Local>, link: &str, draft: &NoteDraft) -> String {
    let mut out = format!("- {} {}", at.format("%H:%M"), link);

    let summary: String = draft
        .summary
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if !summary.is_empty() {
        let excerpt: String = summary.chars().take(EXCERPT_CHARS).collect();
        let ellipsis = if summary.chars().count() > EXCERPT_CHARS { "…" } else { "" };
        out.push_str(&format!(": {}{}", excerpt, ellipsis));
    }
    out.push('\n');

    for item in &draft.action_items {
        out.push_str("    - ");
        out.push_str(&item.to_task_line());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionItem;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_creates_from_template_and_skips_duplicates() {
        let temp = TempDir::new().unwrap();
        let log = DailyLog::new(temp.path().join("Daily"));
        let at = Local.with_ymd_and_hms(2026, 10, 19, 14, 5, 0).unwrap();
        let draft = NoteDraft {
            title: "Bill".into(),
            summary: "Electricity bill\narrived.".into(),
            action_items: vec![ActionItem::new("Pay it")],
            ..Default::default()
        };

        assert!(log.append(at, "2026-10-19-bill", &draft).await.unwrap());
        assert!(!log.append(at, "2026-10-19-bill", &draft).await.unwrap());

        let content = std::fs::read_to_string(log.path_for(at)).unwrap();
        assert_eq!(
            content,
            "# 2026-10-19\n\n## Processed\n\n- 14:05 [[2026-10-19-bill]]: Electricity bill arrived.\n    - [ ] Pay it\n"
        );
    }
}
