//! Refinery stage: staged text → structured note draft.
//!
//! Long sources are split into overlapping chunks; every chunk is sent to the
//! generation model under a single lease and the JSON answers are merged.
//! Action items are then grounded by the obligation detector.

use std::iter;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::obligations;
use super::safety::SafetyLimits;
use super::stage::StageError;
use crate::adapters::{ModelError, ModelKind, ModelRequest};
use crate::domain::{ActionItem, NoteDraft, NoteSection, Priority, StagedArtifact};
use crate::resources::{AcquireMode, ResourceManager};

pub const CHUNK_CHARS: usize = 6000;
pub const CHUNK_OVERLAP: usize = 500;

/// Maximum title length taken from the first line of a source
const TITLE_CHARS: usize = 80;

const SYSTEM_PROMPT: &str = "You turn raw transcripts, documents and articles into structured notes. \
Answer with a single JSON object and nothing else, using exactly these keys:\n\
{\"title\": string, \"summary\": string, \
\"sections\": [{\"heading\": string, \"body\": string}], \
\"action_items\": [{\"task\": string, \"due\": \"YYYY-MM-DD\" or null, \"priority\": \"high\"|\"normal\"|\"low\"}], \
\"tags\": [string]}\n\
Only list action items the text explicitly asks someone to do. Keep the language of the source.";

#[derive(Debug, Default, Deserialize)]
struct ChunkOutput {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    sections: Vec<NoteSection>,
    #[serde(default)]
    action_items: Vec<ProposedItem>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProposedItem {
    task: String,
    #[serde(default)]
    due: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

impl ProposedItem {
    fn into_action_item(self, reference: NaiveDate) -> ActionItem {
        let due = self.due.as_deref().and_then(|d| {
            NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| obligations::resolve_due(d, reference))
        });
        ActionItem {
            task: self.task.trim().to_string(),
            due,
            priority: self
                .priority
                .as_deref()
                .map(Priority::parse_loose)
                .unwrap_or_default(),
            context: None,
        }
    }
}

pub struct Refinery {
    resources: ResourceManager,
    limits: SafetyLimits,
}

impl Refinery {
    pub fn new(resources: ResourceManager, limits: SafetyLimits) -> Self {
        Self { resources, limits }
    }

    /// Draft a note from `artifact` (one attempt)
    #[instrument(skip(self, artifact), fields(item = %artifact.item_id))]
    pub async fn run(&self, artifact: &StagedArtifact) -> Result<NoteDraft, StageError> {
        let text = self.limits.clip_text(&artifact.text);
        let reference = artifact.reference_date();
        let detected = obligations::detect(text, reference);

        if text.trim().is_empty() {
            debug!("Nothing to refine, drafting from provenance only");
            return Ok(NoteDraft {
                title: fallback_title(artifact),
                ..Default::default()
            });
        }

        let chunks = chunk_text(text, CHUNK_CHARS, CHUNK_OVERLAP);
        let total = chunks.len();
        let requests: Vec<ModelRequest> = chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| ModelRequest::Generate {
                system: SYSTEM_PROMPT.to_string(),
                prompt: build_prompt(artifact, chunk, idx, total),
                json: true,
            })
            .collect();

        let (answers, model) = self
            .resources
            .scoped(ModelKind::Generation, AcquireMode::Wait, move |lease| {
                Box::pin(async move {
                    let mut answers = Vec::with_capacity(requests.len());
                    for request in requests {
                        answers.push(lease.invoke(request).await?.into_text()?);
                    }
                    Ok::<_, StageError>((answers, lease.model().to_string()))
                })
            })
            .await?;

        let outputs = answers
            .iter()
            .map(|answer| parse_answer(answer))
            .collect::<Result<Vec<_>, _>>()?;

        let mut draft = merge(outputs, reference);
        let proposed = std::mem::take(&mut draft.action_items);
        let proposed_count = proposed.len();
        draft.action_items = obligations::ground(proposed, detected);
        if draft.title.trim().is_empty() {
            draft.title = fallback_title(artifact);
        }
        draft.generation_model = Some(model);

        info!(
            chunks = total,
            sections = draft.sections.len(),
            proposed = proposed_count,
            action_items = draft.action_items.len(),
            "Drafted note"
        );
        Ok(draft)
    }
}

/// Split into windows of `size` chars, consecutive windows sharing `overlap` chars
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<&str> {
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(iter::once(text.len()))
        .collect();
    let chars = bounds.len() - 1;
    if chars <= size || size == 0 {
        return vec![text];
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars);
        chunks.push(&text[bounds[start]..bounds[end]]);
        if end == chars {
            break;
        }
        start += step;
    }
    chunks
}

fn build_prompt(artifact: &StagedArtifact, chunk: &str, idx: usize, total: usize) -> String {
    let mut prompt = format!(
        "Source: {} ({})\nToday's date: {}\n",
        artifact.identity.display_name(),
        artifact.kind,
        artifact.reference_date().format("%Y-%m-%d"),
    );
    if let Some(hint) = &artifact.title_hint {
        prompt.push_str(&format!("Suggested title: {}\n", hint));
    }
    if total > 1 {
        prompt.push_str(&format!(
            "This is part {} of {} of a longer source; describe only this part.\n",
            idx + 1,
            total
        ));
    }
    prompt.push_str("\n---\n");
    prompt.push_str(chunk);
    prompt
}

/// Parse the JSON object in a model answer, tolerating prose around it
fn parse_answer(answer: &str) -> Result<ChunkOutput, ModelError> {
    let start = answer.find('{');
    let end = answer.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &answer[s..=e],
        _ => {
            return Err(ModelError::Malformed(format!(
                "no JSON object in answer: {}",
                answer.chars().take(120).collect::<String>()
            )))
        }
    };
    serde_json::from_str(json).map_err(|e| ModelError::Malformed(e.to_string()))
}

fn merge(outputs: Vec<ChunkOutput>, reference: NaiveDate) -> NoteDraft {
    let mut draft = NoteDraft::default();
    let mut summaries = Vec::new();

    for output in outputs {
        if draft.title.trim().is_empty() {
            draft.title = output.title.trim().to_string();
        }
        if !output.summary.trim().is_empty() {
            summaries.push(output.summary.trim().to_string());
        }

        for section in output.sections {
            let heading = section.heading.trim();
            if heading.is_empty() && section.body.trim().is_empty() {
                continue;
            }
            match draft
                .sections
                .iter_mut()
                .find(|s| s.heading.eq_ignore_ascii_case(heading))
            {
                Some(existing) => {
                    existing.body.push_str("\n\n");
                    existing.body.push_str(section.body.trim());
                }
                None => draft.sections.push(NoteSection {
                    heading: heading.to_string(),
                    body: section.body.trim().to_string(),
                }),
            }
        }

        draft.action_items.extend(
            output
                .action_items
                .into_iter()
                .filter(|i| !i.task.trim().is_empty())
                .map(|i| i.into_action_item(reference)),
        );

        for tag in output.tags {
            if !draft.tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                draft.tags.push(tag);
            }
        }
    }

    draft.summary = summaries.join("\n\n");
    draft
}

fn fallback_title(artifact: &StagedArtifact) -> String {
    if let Some(hint) = artifact.title_hint.as_deref().filter(|h| !h.trim().is_empty()) {
        return hint.trim().to_string();
    }
    artifact
        .text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches('#').trim().chars().take(TITLE_CHARS).collect())
        .unwrap_or_else(|| artifact.identity.display_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockRuntime;
    use crate::config::ModelsSettings;
    use crate::domain::{Identity, WorkKind};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn artifact(text: &str) -> StagedArtifact {
        let mut artifact = StagedArtifact::new(
            Uuid::new_v4(),
            Identity::Path("/drop/memo.m4a".into()),
            WorkKind::Audio,
            text.to_string(),
        )
        .with_title_hint("memo");
        // Monday
        artifact.extracted_at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        artifact
    }

    fn refinery(mock: Arc<MockRuntime>) -> Refinery {
        Refinery::new(
            ResourceManager::new(mock, ModelsSettings::default()),
            SafetyLimits::default(),
        )
    }

    #[test]
    fn test_chunking_overlaps() {
        let text = "a".repeat(13_000);
        let chunks = chunk_text(&text, CHUNK_CHARS, CHUNK_OVERLAP);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 6000);
        assert_eq!(chunks[2].len(), 2000);

        assert_eq!(chunk_text("short", CHUNK_CHARS, CHUNK_OVERLAP), vec!["short"]);
    }

    #[test]
    fn test_chunking_respects_char_boundaries() {
        let text = "żółw ".repeat(3000);
        let chunks = chunk_text(&text, 1000, 100);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn test_parse_answer_tolerates_prose() {
        let answer = "Sure! Here it is:\n{\"title\": \"T\", \"summary\": \"S\"}\nHope that helps.";
        let parsed = parse_answer(answer).unwrap();
        assert_eq!(parsed.title, "T");
        assert!(parse_answer("no json here").is_err());
    }

    #[tokio::test]
    async fn test_obligation_grounds_action_items() {
        let mock = Arc::new(MockRuntime::new());
        let refinery = refinery(mock.clone());

        let draft = refinery
            .run(&artifact("We talked about the house. Pay the electricity bill by Friday."))
            .await
            .unwrap();

        assert_eq!(draft.title, "memo");
        assert_eq!(draft.action_items.len(), 1);
        assert_eq!(
            draft.action_items[0].due,
            NaiveDate::from_ymd_opt(2026, 10, 23)
        );
        assert_eq!(draft.action_items[0].priority, Priority::High);
        assert_eq!(draft.generation_model.as_deref(), Some("qwen2.5:14b"));
        assert!(mock.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_ungrounded_model_items_are_dropped() {
        let answer = r#"{"title": "Walk", "summary": "A walk.", "sections": [],
            "action_items": [{"task": "Water the plants", "due": "2026-10-20", "priority": "high"}],
            "tags": ["walks"]}"#;
        let mock = Arc::new(MockRuntime::new().with_text(ModelKind::Generation, answer));
        let refinery = refinery(mock);

        let draft = refinery
            .run(&artifact("We walked along the river. It was sunny."))
            .await
            .unwrap();

        assert_eq!(draft.title, "Walk");
        assert_eq!(draft.tags, vec!["walks".to_string()]);
        assert!(draft.action_items.is_empty());
    }

    #[tokio::test]
    async fn test_long_source_is_chunked() {
        let mock = Arc::new(MockRuntime::new());
        let refinery = refinery(mock.clone());

        let text = "word ".repeat(2600);
        let draft = refinery.run(&artifact(&text)).await.unwrap();

        assert_eq!(mock.invoke_count(ModelKind::Generation), 3);
        assert_eq!(mock.load_count(), 1);
        assert_eq!(draft.summary.matches("Summary of").count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_retryable_error() {
        let mock = Arc::new(MockRuntime::new().with_text(ModelKind::Generation, "I cannot help"));
        let err = refinery(mock)
            .run(&artifact("Some text"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Model(ModelError::Malformed(_))));
        assert!(err.is_retryable());
    }
}
