//! Free conversational skills: clarifying questions and project-update acknowledgements.

use async_trait::async_trait;
use serde_json::json;

use fundr_core::judge::required_questions;
use fundr_core::{Action, ActionKind, ActionSkill, Language, SkillError, SkillOutput, SkillRequest, TurnContext};

fn question_intro(language: Language) -> &'static str {
    match language.reply_language() {
        Language::Spanish => "Para ayudarte mejor necesito saber un poco más:",
        _ => "To help you better I need a bit more detail:",
    }
}

fn render_questions(questions: &[String], language: Language) -> String {
    let mut out = String::from(question_intro(language));
    for q in questions {
        out.push_str("\n- ");
        out.push_str(q.trim());
    }
    out
}

/// Asks the questions chosen by the judge, or the profile's highest-weight gaps.
pub struct ClarifyingQuestions;

#[async_trait]
impl ActionSkill for ClarifyingQuestions {
    fn kind(&self) -> ActionKind {
        ActionKind::AskClarifyingQuestions
    }

    async fn execute(&self, _ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError> {
        let questions = match &request.action {
            Action::AskClarifyingQuestions { questions } if !questions.is_empty() => questions.clone(),
            _ => required_questions(&request.profile.completeness.missing, request.language),
        };
        Ok(SkillOutput {
            reply: render_questions(&questions, request.language),
            actual_cost: None,
            data: json!({ "questions": questions }),
        })
    }
}

/// Acknowledges project details; the reconciler applies them after the reply.
pub struct ProjectUpdate;

#[async_trait]
impl ActionSkill for ProjectUpdate {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateOrUpdateProject
    }

    async fn execute(&self, _ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError> {
        let language = request.language.reply_language();
        let mut reply = match language {
            Language::Spanish => "¡Anotado! Actualizo el perfil de tu proyecto con esta información.".to_string(),
            _ => "Got it! I'm updating your project profile with this information.".to_string(),
        };
        let next = required_questions(&request.profile.completeness.missing, language);
        if let Some(question) = next.first() {
            reply.push_str(match language {
                Language::Spanish => "\n\nSiguiente paso: ",
                _ => "\n\nNext step: ",
            });
            reply.push_str(question);
        }
        Ok(SkillOutput {
            reply,
            actual_cost: None,
            data: json!({ "completeness": request.profile.completeness.total }),
        })
    }
}
