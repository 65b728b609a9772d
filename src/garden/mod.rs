//! The Gardener: folder routing, tags and links for note drafts.
//!
//! ```text
//! NoteDraft ──► Categorizer ──► rules ──► model ──► CategoryDecision
//!          └──► Linker (vault titles/aliases) ──► [[wikilinks]] in the draft
//! ```

pub mod categorizer;
pub mod linker;
pub mod matcher;

use std::path::PathBuf;

use tracing::{info, instrument, warn};

pub use categorizer::{CategoryRule, Categorizer, RuleVerdict, Taxonomy};
pub use linker::{normalize_tags, LinkTarget, Linker};
pub use matcher::{KeywordMatch, KeywordMatcher};

use crate::domain::{CategoryDecision, NoteDraft};
use crate::resources::ResourceManager;

pub struct Gardener {
    categorizer: Categorizer,
    vault: PathBuf,
    resources: Option<ResourceManager>,
}

impl Gardener {
    pub fn new(
        taxonomy: Taxonomy,
        vault: impl Into<PathBuf>,
        resources: Option<ResourceManager>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            categorizer: Categorizer::new(taxonomy)?,
            vault: vault.into(),
            resources,
        })
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    /// Decide the folder and tags for `draft` and link it into the vault.
    ///
    /// Links are written into the draft's summary and section bodies.
    #[instrument(skip(self, draft), fields(title = %draft.title))]
    pub async fn tend(&self, draft: &mut NoteDraft) -> CategoryDecision {
        let mut decision = self
            .categorizer
            .categorize(draft, self.resources.as_ref())
            .await;

        match Linker::from_vault(&self.vault).await {
            Ok(linker) if !linker.is_empty() => {
                let own_title = draft.title.clone();
                let mut fields: Vec<&mut String> = std::iter::once(&mut draft.summary)
                    .chain(draft.sections.iter_mut().map(|s| &mut s.body))
                    .collect();
                decision.links = linker.link_fields(&mut fields, &own_title);
            }
            Ok(_) => {}
            Err(e) => warn!(vault = %self.vault.display(), error = %e, "Could not scan vault for links"),
        }

        info!(
            folder = %decision.folder,
            source = %decision.source,
            review = decision.needs_review,
            tags = decision.tags.len(),
            links = decision.links.len(),
            "Categorized draft"
        );
        decision
    }
}
