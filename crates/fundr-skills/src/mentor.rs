//! Mentor skill: free-form fundraising advice from the language model.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use fundr_core::{
    render_prompt, Action, ActionKind, ActionSkill, LanguageModel, ModelError, ModelTask, SkillError, SkillOutput,
    SkillRequest, TurnContext,
};

const DEFAULT_TIMEOUT_MS: u64 = 20_000;

pub struct Mentor {
    model: Arc<dyn LanguageModel>,
    timeout_ms: u64,
}

impl Mentor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn prompt(&self, topic: &str, request: &SkillRequest) -> String {
        let completeness = request.profile.completeness.total.to_string();
        render_prompt(
            ModelTask::Mentor,
            &format!(
                "You are an experienced startup mentor helping a founder prepare to raise money. \
                 Give concrete, actionable advice on the topic in at most three short paragraphs, \
                 using what the profile says about the project.\n{}",
                request.language.instructions()
            ),
            &[
                ("topic", topic),
                ("message", &request.message),
                ("profile", &request.profile.profile.summary()),
                ("completeness", &completeness),
            ],
        )
    }
}

#[async_trait]
impl ActionSkill for Mentor {
    fn kind(&self) -> ActionKind {
        ActionKind::Mentor
    }

    async fn execute(&self, ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError> {
        let Action::Mentor { topic } = &request.action else {
            return Err(SkillError::Other("mentor received a different action".into()));
        };
        let prompt = self.prompt(topic, request);
        let reply = tokio::time::timeout(Duration::from_millis(self.timeout_ms), self.model.generate(&prompt))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout_ms))??;
        if reply.trim().is_empty() {
            return Err(ModelError::Parse("empty mentor answer".into()).into());
        }
        tracing::debug!(target: "fundr::skills", user_id = %ctx.user_id, chars = reply.len(), "mentor answered");
        Ok(SkillOutput::text(reply.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmMode, ModelRouter};
    use fundr_core::{Language, Plan, StoredProfile};

    fn request(language: Language) -> SkillRequest {
        SkillRequest {
            action: Action::Mentor {
                topic: "pricing".into(),
            },
            profile: StoredProfile::empty(),
            language,
            message: "How should I price?".into(),
        }
    }

    struct Silent;

    #[async_trait]
    impl LanguageModel for Silent {
        async fn classify(&self, _prompt: &str) -> Result<serde_json::Value, ModelError> {
            Err(ModelError::Provider("unused".into()))
        }
        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn answers_through_the_model() {
        let skill = Mentor::new(Arc::new(ModelRouter::with_mode(LlmMode::Mock)));
        let ctx = TurnContext::new("u1", "p1", Plan::Free);
        let out = skill.execute(&ctx, &request(Language::English)).await.unwrap();
        assert!(out.reply.starts_with("On \"pricing\""));
        assert_eq!(out.actual_cost, None);
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let skill = Mentor::new(Arc::new(Silent)).with_timeout_ms(20);
        let ctx = TurnContext::new("u1", "p1", Plan::Free);
        let err = skill.execute(&ctx, &request(Language::English)).await.unwrap_err();
        assert!(matches!(err, SkillError::Model(ModelError::Timeout(20))));
    }
}
