//! Concrete action skills, the language-model router, and the dataset search index.

use std::sync::Arc;

use fundr_core::{LanguageModel, SearchIndex, SkillRegistry};

mod clarify;
mod dataset_index;
mod mentor;
mod model_router;
mod search;

pub use clarify::{ClarifyingQuestions, ProjectUpdate};
pub use dataset_index::DatasetIndex;
pub use mentor::Mentor;
pub use model_router::{LlmMode, ModelRouter};
pub use search::{render_results, CompanySearch, InvestorSearch};

/// Registry with every action skill the engine can dispatch to.
pub fn default_registry(model: Arc<dyn LanguageModel>, index: Arc<dyn SearchIndex>) -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(InvestorSearch::new(index.clone())));
    registry.register(Arc::new(CompanySearch::new(index)));
    registry.register(Arc::new(Mentor::new(model)));
    registry.register(Arc::new(ClarifyingQuestions));
    registry.register(Arc::new(ProjectUpdate));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundr_core::ActionKind;

    #[test]
    fn default_registry_covers_dispatchable_actions() {
        let registry = default_registry(
            Arc::new(ModelRouter::with_mode(LlmMode::Mock)),
            Arc::new(DatasetIndex::empty()),
        );
        for kind in ActionKind::all() {
            if kind != ActionKind::RejectSpam {
                assert!(registry.get(kind).is_some(), "missing skill for {}", kind);
            }
        }
    }
}
