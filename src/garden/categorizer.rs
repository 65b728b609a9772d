//! Folder routing for note drafts.
//!
//! Phase one matches the configured keyword rules; phase two asks the
//! classification model when no rule wins clearly. Anything still ambiguous
//! goes to the default folder flagged for review.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::linker::normalize_tags;
use super::matcher::KeywordMatcher;
use crate::adapters::{ModelKind, ModelRequest};
use crate::domain::{CategoryDecision, DecisionSource, NoteDraft};
use crate::resources::{AcquireMode, ResourceError, ResourceManager};

/// Characters of the draft shown to the classification model
const CLASSIFY_CHARS: usize = 4000;

/// A keyword rule. Rules without a folder only contribute tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CategoryRule {
    fn folder_rule(folder: &str, keywords: &[&str], tags: &[&str]) -> Self {
        Self {
            name: None,
            folder: Some(folder.to_string()),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn tag_rule(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: Some(name.to_string()),
            folder: None,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            tags: vec![name.to_string()],
        }
    }

    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.folder.as_deref())
            .unwrap_or("unnamed")
    }
}

/// Destination folders and the rules that route into them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default = "default_folder")]
    pub default_folder: String,

    /// Distinct keyword hits a rule needs to decide
    #[serde(default = "default_min_rule_hits")]
    pub min_rule_hits: usize,

    /// Minimum confidence for a model decision
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    #[serde(default = "default_rules")]
    pub rules: Vec<CategoryRule>,
}

fn default_folder() -> String {
    "Inbox".to_string()
}
fn default_min_rule_hits() -> usize {
    2
}
fn default_min_confidence() -> f32 {
    0.6
}

fn default_rules() -> Vec<CategoryRule> {
    vec![
        CategoryRule::folder_rule(
            "Finance",
            &[
                "invoice", "bill", "bills", "payment", "bank", "tax", "taxes", "budget", "salary",
                "receipt", "insurance", "mortgage", "electricity", "loan", "expense", "expenses",
            ],
            &["finance"],
        ),
        CategoryRule::folder_rule(
            "Health",
            &[
                "doctor", "dentist", "appointment", "medication", "prescription", "symptoms",
                "hospital", "therapy", "workout", "sleep", "diet",
            ],
            &["health"],
        ),
        CategoryRule::folder_rule(
            "Work",
            &[
                "meeting", "project", "client", "deadline", "sprint", "roadmap", "stakeholder",
                "presentation", "quarterly", "standup", "colleague",
            ],
            &["work"],
        ),
        CategoryRule::folder_rule(
            "Learning",
            &[
                "course", "lecture", "tutorial", "book", "paper", "research", "chapter", "study",
                "exam", "lesson",
            ],
            &["learning"],
        ),
        CategoryRule::tag_rule(
            "gdpr",
            &[
                "gdpr",
                "rodo",
                "personal data",
                "data protection",
                "data subject",
                "data controller",
                "dpo",
            ],
        ),
        CategoryRule::tag_rule(
            "dora",
            &[
                "dora",
                "digital operational resilience",
                "ict risk",
                "ict third-party",
            ],
        ),
        CategoryRule::tag_rule(
            "nis2",
            &[
                "nis2",
                "nis 2",
                "network and information security",
                "essential entities",
                "incident reporting",
            ],
        ),
    ]
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self {
            default_folder: default_folder(),
            min_rule_hits: default_min_rule_hits(),
            min_confidence: default_min_confidence(),
            rules: default_rules(),
        }
    }
}

impl Taxonomy {
    /// Every routable folder, default first
    pub fn folders(&self) -> Vec<&str> {
        let mut folders = vec![self.default_folder.as_str()];
        for folder in self.rules.iter().filter_map(|r| r.folder.as_deref()) {
            if !folders.iter().any(|f| f.eq_ignore_ascii_case(folder)) {
                folders.push(folder);
            }
        }
        folders
    }

    /// Canonical spelling of `folder` if it is part of the taxonomy
    pub fn canonical_folder(&self, folder: &str) -> Option<&str> {
        let folder = folder.trim().trim_matches('/');
        self.folders()
            .into_iter()
            .find(|f| f.eq_ignore_ascii_case(folder))
    }
}

/// Outcome of the keyword phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleVerdict {
    /// Winning folder rule and its distinct hit count
    pub winner: Option<(usize, usize)>,
    /// Tags contributed by the winner and by tag-only rules
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct Categorizer {
    taxonomy: Taxonomy,
    matcher: KeywordMatcher,
}

impl Categorizer {
    pub fn new(taxonomy: Taxonomy) -> Result<Self, regex::Error> {
        let matcher = KeywordMatcher::new(taxonomy.rules.iter().enumerate().flat_map(
            |(idx, rule)| rule.keywords.iter().map(move |k| (idx, k.as_str())),
        ))?;
        Ok(Self { taxonomy, matcher })
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Keyword phase only
    pub fn by_rules(&self, text: &str) -> RuleVerdict {
        let hits = self.matcher.distinct_hits(text);

        let mut tags = Vec::new();
        let mut ranked: Vec<(usize, usize)> = Vec::new();
        for (idx, keywords) in &hits {
            let rule = &self.taxonomy.rules[*idx];
            if rule.folder.is_some() {
                ranked.push((*idx, keywords.len()));
            } else {
                tags.extend(rule.tags.iter().cloned());
            }
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let winner = match ranked.as_slice() {
            [(idx, best), rest @ ..]
                if *best >= self.taxonomy.min_rule_hits
                    && rest.first().map(|(_, second)| best > second).unwrap_or(true) =>
            {
                Some((*idx, *best))
            }
            _ => None,
        };

        if let Some((idx, _)) = winner {
            tags.extend(self.taxonomy.rules[idx].tags.iter().cloned());
        }

        RuleVerdict {
            winner,
            tags: normalize_tags(&tags),
        }
    }

    /// Decide the folder for `draft`; never fails
    pub async fn categorize(
        &self,
        draft: &NoteDraft,
        resources: Option<&ResourceManager>,
    ) -> CategoryDecision {
        let text = draft.full_text();
        let verdict = self.by_rules(&text);

        let mut tags = draft.tags.clone();
        tags.extend(verdict.tags.iter().cloned());

        if let Some((idx, hits)) = verdict.winner {
            let rule = &self.taxonomy.rules[idx];
            debug!(rule = rule.label(), hits, "Keyword rule decided");
            return CategoryDecision {
                folder: rule
                    .folder
                    .clone()
                    .unwrap_or_else(|| self.taxonomy.default_folder.clone()),
                tags: normalize_tags(&tags),
                links: Vec::new(),
                source: DecisionSource::RuleBased {
                    rule: rule.label().to_string(),
                    hits,
                },
                needs_review: false,
            };
        }

        let Some(resources) = resources else {
            return self.review(tags, "no rule matched".to_string());
        };

        match self.ask_model(&text, resources).await {
            Ok((model, verdict)) => self.accept_model(model, verdict, tags),
            Err(e) => {
                warn!(error = %e, "Classification model failed, routing to review");
                self.review(tags, format!("classification failed: {}", e))
            }
        }
    }

    fn accept_model(
        &self,
        model: String,
        verdict: ModelVerdict,
        mut tags: Vec<String>,
    ) -> CategoryDecision {
        tags.extend(verdict.tags);

        let folder = verdict
            .folder
            .as_deref()
            .and_then(|f| self.taxonomy.canonical_folder(f))
            .map(str::to_string);

        match folder {
            Some(folder) if verdict.confidence >= self.taxonomy.min_confidence => {
                info!(%folder, confidence = verdict.confidence, %model, "Model decided folder");
                CategoryDecision {
                    folder,
                    tags: normalize_tags(&tags),
                    links: Vec::new(),
                    source: DecisionSource::ModelBased {
                        model,
                        confidence: verdict.confidence,
                    },
                    needs_review: false,
                }
            }
            Some(folder) => self.review(
                tags,
                format!(
                    "low confidence {:.2} for {} from {}",
                    verdict.confidence, folder, model
                ),
            ),
            None => self.review(
                tags,
                match verdict.folder {
                    Some(f) => format!("unknown folder {:?} from {}", f, model),
                    None => format!("no folder from {}", model),
                },
            ),
        }
    }

    fn review(&self, tags: Vec<String>, reason: String) -> CategoryDecision {
        debug!(%reason, "Routing to review");
        let mut decision = CategoryDecision::review(
            self.taxonomy.default_folder.clone(),
            DecisionSource::Unresolved { reason },
        );
        decision.tags = normalize_tags(&tags);
        decision
    }

    async fn ask_model(
        &self,
        text: &str,
        resources: &ResourceManager,
    ) -> Result<(String, ModelVerdict), ResourceError> {
        let folders = self.taxonomy.folders().join(", ");
        let excerpt: String = text.chars().take(CLASSIFY_CHARS).collect();
        let request = ModelRequest::Generate {
            system: format!(
                "You file notes into exactly one of these folders: {}. \
                 Answer with a JSON object {{\"folder\": string, \"confidence\": number between 0 and 1, \"tags\": [string]}}.",
                folders
            ),
            prompt: excerpt,
            json: true,
        };

        let (answer, model) = resources
            .scoped(ModelKind::Classification, AcquireMode::Wait, move |lease| {
                Box::pin(async move {
                    let answer = lease.invoke(request).await?.into_text()?;
                    Ok::<_, ResourceError>((answer, lease.model().to_string()))
                })
            })
            .await?;

        let start = answer.find('{').unwrap_or(0);
        let end = answer.rfind('}').map(|e| e + 1).unwrap_or(answer.len());
        let verdict = serde_json::from_str(answer.get(start..end).unwrap_or(""))
            .map_err(|e| crate::adapters::ModelError::Malformed(e.to_string()))?;
        Ok((model, verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockRuntime;
    use crate::config::ModelsSettings;
    use std::sync::Arc;

    fn categorizer() -> Categorizer {
        Categorizer::new(Taxonomy::default()).unwrap()
    }

    fn draft(title: &str, summary: &str) -> NoteDraft {
        NoteDraft {
            title: title.to_string(),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rule_needs_two_distinct_hits() {
        let c = categorizer();
        assert!(c.by_rules("the bill, the bill, the bill").winner.is_none());

        let verdict = c.by_rules("Pay the electricity bill by Friday");
        let (idx, hits) = verdict.winner.unwrap();
        assert_eq!(c.taxonomy().rules[idx].folder.as_deref(), Some("Finance"));
        assert_eq!(hits, 2);
        assert_eq!(verdict.tags, vec!["finance".to_string()]);
    }

    #[test]
    fn test_tie_is_undecided() {
        let verdict = categorizer().by_rules("bank invoice doctor dentist");
        assert!(verdict.winner.is_none());
    }

    #[test]
    fn test_compliance_tags() {
        let verdict = categorizer()
            .by_rules("The new GDPR guidance on personal data and NIS2 incident reporting");
        assert_eq!(verdict.tags, vec!["gdpr".to_string(), "nis2".to_string()]);
    }

    #[tokio::test]
    async fn test_ambiguous_goes_to_review() {
        let mock = Arc::new(MockRuntime::new());
        let resources = ResourceManager::new(mock.clone(), ModelsSettings::default());

        let decision = categorizer()
            .categorize(&draft("Walk", "A walk by the river"), Some(&resources))
            .await;

        assert_eq!(decision.folder, "Inbox");
        assert!(decision.needs_review);
        assert!(matches!(decision.source, DecisionSource::Unresolved { .. }));
        assert_eq!(mock.invoke_count(ModelKind::Classification), 1);
        assert!(mock.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_confident_model_decision() {
        let mock = Arc::new(MockRuntime::new().with_text(
            ModelKind::Classification,
            r#"{"folder": "learning", "confidence": 0.9, "tags": ["Rust"]}"#,
        ));
        let resources = ResourceManager::new(mock, ModelsSettings::default());

        let decision = categorizer()
            .categorize(&draft("Ownership", "Borrowing rules"), Some(&resources))
            .await;

        assert_eq!(decision.folder, "Learning");
        assert!(!decision.needs_review);
        assert_eq!(decision.tags, vec!["rust".to_string()]);
        assert!(matches!(
            decision.source,
            DecisionSource::ModelBased { confidence, .. } if confidence > 0.8
        ));
    }

    #[tokio::test]
    async fn test_unknown_or_unsure_model_folder_is_reviewed() {
        for answer in [
            r#"{"folder": "Recipes", "confidence": 0.95}"#,
            r#"{"folder": "Work", "confidence": 0.3}"#,
        ] {
            let mock = Arc::new(MockRuntime::new().with_text(ModelKind::Classification, answer));
            let resources = ResourceManager::new(mock, ModelsSettings::default());
            let decision = categorizer()
                .categorize(&draft("Soup", "Tomato soup"), Some(&resources))
                .await;
            assert_eq!(decision.folder, "Inbox");
            assert!(decision.needs_review);
        }
    }

    #[test]
    fn test_taxonomy_from_yaml() {
        let yaml = r#"
default_folder: Review
rules:
  - folder: Recipes
    keywords: [soup, bake]
    tags: [food]
"#;
        let taxonomy: Taxonomy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(taxonomy.min_rule_hits, 2);
        assert_eq!(taxonomy.folders(), vec!["Review", "Recipes"]);
        assert_eq!(taxonomy.canonical_folder("recipes/"), Some("Recipes"));
    }
}
