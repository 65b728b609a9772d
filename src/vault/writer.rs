//! Note Writer: renders a draft and its decision into the vault.
//!
//! Output: `<vault>/<folder>/<YYYY-MM-DD>-<slug>.md`
//!
//! ```text
//! ---
//! title: ...
//! created: 2026-10-19T09:00:00+00:00
//! category: Finance
//! tags: [finance]
//! source: memo.m4a
//! item: 5f0c...
//! extraction_model: large-v3
//! decision: rule:Finance (2 hits)
//! review: false
//! ---
//! # Title
//! summary, action items, sections, asset embeds
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::domain::{CategoryDecision, NoteDraft, StagedArtifact, WorkItem};
use crate::fsutil::{slugify, write_atomic};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Note writer IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Front matter serialization failed: {0}")]
    FrontMatter(#[from] serde_yaml::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WriterError + '_ {
    move |source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Serialize)]
struct FrontMatter<'a> {
    title: &'a str,
    created: String,
    category: &'a str,
    tags: &'a [String],
    source: String,
    item: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    extraction_model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_model: Option<&'a str>,
    decision: String,
    review: bool,
}

/// Result of a committed note
#[derive(Debug, Clone)]
pub struct WrittenNote {
    pub path: PathBuf,
    pub assets: Vec<PathBuf>,
}

impl WrittenNote {
    /// Wikilink target for the note (file stem)
    pub fn link_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NoteWriter {
    vault: PathBuf,
    assets_dir: String,
}

impl NoteWriter {
    pub fn new(vault: impl Into<PathBuf>, assets_dir: impl Into<String>) -> Self {
        Self {
            vault: vault.into(),
            assets_dir: assets_dir.into(),
        }
    }

    pub fn vault(&self) -> &Path {
        &self.vault
    }

    /// Write the note for `item`. Re-writing the same item overwrites its note.
    #[instrument(skip_all, fields(item = %item.short_id(), folder = %decision.folder))]
    pub async fn write(
        &self,
        item: &WorkItem,
        artifact: Option<&StagedArtifact>,
        draft: &NoteDraft,
        decision: &CategoryDecision,
    ) -> Result<WrittenNote, WriterError> {
        let assets = match artifact {
            Some(a) => self.relocate_assets(item, &a.assets).await?,
            None => Vec::new(),
        };

        let asset_names: Vec<(String, String)> = artifact
            .map(|a| a.assets.as_slice())
            .unwrap_or_default()
            .iter()
            .zip(&assets)
            .filter_map(|(original, moved)| {
                Some((
                    original.file_name()?.to_string_lossy().to_string(),
                    moved.file_name()?.to_string_lossy().to_string(),
                ))
            })
            .collect();

        let front = FrontMatter {
            title: &draft.title,
            created: item.discovered_at.to_rfc3339(),
            category: &decision.folder,
            tags: &decision.tags,
            source: item.identity.display_name(),
            item: item.id.to_string(),
            extraction_model: artifact.and_then(|a| a.extraction_model.as_deref()),
            generation_model: draft.generation_model.as_deref(),
            decision: decision.source.to_string(),
            review: decision.needs_review,
        };

        let content = format!(
            "---\n{}---\n{}",
            serde_yaml::to_string(&front)?,
            render_body(draft, &asset_names)
        );

        let folder = self.vault.join(&decision.folder);
        let path = self.target_path(&folder, item, draft).await?;
        write_atomic(&path, content.into_bytes())
            .await
            .map_err(io_err(&path))?;

        info!(path = %path.display(), assets = assets.len(), "Wrote note");
        Ok(WrittenNote { path, assets })
    }

    /// `<folder>/<date>-<slug>.md`, or a numbered variant if taken by another item
    async fn target_path(
        &self,
        folder: &Path,
        item: &WorkItem,
        draft: &NoteDraft,
    ) -> Result<PathBuf, WriterError> {
        let base = format!(
            "{}-{}",
            item.discovered_at.format("%Y-%m-%d"),
            slugify(&draft.title)
        );
        let marker = format!("item: {}", item.id);

        let mut n = 1;
        loop {
            let name = if n == 1 {
                format!("{}.md", base)
            } else {
                format!("{}-{}.md", base, n)
            };
            let candidate = folder.join(name);
            match tokio::fs::read_to_string(&candidate).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
                Err(e) => return Err(io_err(&candidate)(e)),
                Ok(existing) if front_matter_has(&existing, &marker) => {
                    debug!(path = %candidate.display(), "Overwriting note of the same item");
                    return Ok(candidate);
                }
                Ok(_) => n += 1,
            }
        }
    }

    /// Move staged assets to `<vault>/<assets>/<short id>-<name>`
    async fn relocate_assets(
        &self,
        item: &WorkItem,
        staged: &[PathBuf],
    ) -> Result<Vec<PathBuf>, WriterError> {
        let dir = self.vault.join(&self.assets_dir);
        if !staged.is_empty() {
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }

        let short = item.short_id();
        let mut moved = Vec::with_capacity(staged.len());
        for asset in staged {
            let Some(name) = asset.file_name() else {
                continue;
            };
            let dest = dir.join(format!("{}-{}", short, name.to_string_lossy()));

            if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                if tokio::fs::rename(asset, &dest).await.is_err() {
                    tokio::fs::copy(asset, &dest).await.map_err(io_err(asset))?;
                    tokio::fs::remove_file(asset).await.map_err(io_err(asset))?;
                }
            }
            moved.push(dest);
        }
        Ok(moved)
    }
}

fn front_matter_has(content: &str, line: &str) -> bool {
    let Some(rest) = content.strip_prefix("---\n") else {
        return false;
    };
    let end = rest.find("\n---").unwrap_or(rest.len());
    rest[..end]
        .lines()
        .any(|l| l.trim().replace(['"', '\''], "") == line)
}

fn render_body(draft: &NoteDraft, assets: &[(String, String)]) -> String {
    let mut body = format!("# {}\n\n", draft.title.trim());

    if !draft.summary.trim().is_empty() {
        body.push_str(draft.summary.trim());
        body.push_str("\n\n");
    }

    if !draft.action_items.is_empty() {
        body.push_str("## Action items\n\n");
        for item in &draft.action_items {
            body.push_str("- ");
            body.push_str(&item.to_task_line());
            body.push('\n');
        }
        body.push('\n');
    }

    for section in &draft.sections {
        if !section.heading.trim().is_empty() {
            body.push_str(&format!("## {}\n\n", section.heading.trim()));
        }
        if !section.body.trim().is_empty() {
            body.push_str(section.body.trim());
            body.push_str("\n\n");
        }
    }

    let mut unreferenced = Vec::new();
    for (original, moved) in assets {
        if body.contains(original.as_str()) {
            body = body.replace(original.as_str(), moved);
        } else {
            unreferenced.push(moved);
        }
    }
    if !unreferenced.is_empty() {
        body.push_str("## Attachments\n\n");
        for name in unreferenced {
            body.push_str(&format!("![[{}]]\n", name));
        }
        body.push('\n');
    }

    format!("{}\n", body.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ActionItem, DecisionSource, Identity, NoteSection, Priority, WorkKind,
    };
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn decision() -> CategoryDecision {
        CategoryDecision {
            folder: "Finance".into(),
            tags: vec!["finance".into()],
            links: vec![],
            source: DecisionSource::RuleBased {
                rule: "Finance".into(),
                hits: 2,
            },
            needs_review: false,
        }
    }

    fn draft() -> NoteDraft {
        NoteDraft {
            title: "Electricity Bill".into(),
            summary: "The bill arrived.".into(),
            sections: vec![NoteSection {
                heading: "Details".into(),
                body: "See scan.png for the amount.".into(),
            }],
            action_items: vec![ActionItem {
                task: "Pay the electricity bill".into(),
                due: NaiveDate::from_ymd_opt(2026, 10, 23),
                priority: Priority::High,
                context: None,
            }],
            tags: vec![],
            generation_model: Some("qwen2.5:14b".into()),
        }
    }

    #[tokio::test]
    async fn test_note_layout_and_front_matter() {
        let temp = TempDir::new().unwrap();
        let writer = NoteWriter::new(temp.path().join("vault"), "Assets");
        let item = WorkItem::from_file("/drop/bill.png".into(), WorkKind::Document, "h".into());

        let staged = temp.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("scan.png"), b"png").unwrap();
        std::fs::write(staged.join("extra.png"), b"png").unwrap();
        let artifact = StagedArtifact::new(
            item.id,
            Identity::Path("/drop/bill.png".into()),
            WorkKind::Document,
            "text".into(),
        )
        .with_model("eng", false)
        .with_assets(vec![staged.join("scan.png"), staged.join("extra.png")]);

        let note = writer
            .write(&item, Some(&artifact), &draft(), &decision())
            .await
            .unwrap();

        let expected_name = format!(
            "{}-electricity-bill.md",
            item.discovered_at.format("%Y-%m-%d")
        );
        assert_eq!(note.path, temp.path().join("vault/Finance").join(expected_name));

        let content = std::fs::read_to_string(&note.path).unwrap();
        assert!(content.starts_with("---\ntitle: Electricity Bill\n"));
        assert!(content.contains(&format!("item: {}", item.id)));
        assert!(content.contains("extraction_model: eng"));
        assert!(content.contains("review: false"));
        assert!(content.contains("- [ ] Pay the electricity bill 📅 2026-10-23 ⏫"));

        let short = item.short_id();
        assert!(content.contains(&format!("See {}-scan.png for the amount.", short)));
        assert!(content.contains(&format!("![[{}-extra.png]]", short)));
        assert!(temp
            .path()
            .join(format!("vault/Assets/{}-scan.png", short))
            .exists());
        assert!(!staged.join("scan.png").exists());
    }

    #[tokio::test]
    async fn test_rewrite_same_item_overwrites_other_item_gets_suffix() {
        let temp = TempDir::new().unwrap();
        let writer = NoteWriter::new(temp.path(), "Assets");
        let item = WorkItem::from_file("/drop/a.md".into(), WorkKind::Note, "h".into());

        let first = writer.write(&item, None, &draft(), &decision()).await.unwrap();
        let again = writer.write(&item, None, &draft(), &decision()).await.unwrap();
        assert_eq!(first.path, again.path);

        let mut other = WorkItem::from_file("/drop/b.md".into(), WorkKind::Note, "h2".into());
        other.discovered_at = item.discovered_at;
        let second = writer.write(&other, None, &draft(), &decision()).await.unwrap();
        assert_ne!(second.path, first.path);
        assert!(second.path.to_string_lossy().ends_with("-electricity-bill-2.md"));
    }
}
