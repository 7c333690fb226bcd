//! Greeting for a user opening a project: onboarding for newcomers, a welcome back
//! that reports completeness for returning users.

use serde::{Deserialize, Serialize};

use crate::gate::Language;
use crate::judge::required_questions;
use crate::store::StoredProfile;

/// Questions listed in a low-completeness welcome.
const GAP_QUESTIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeKind {
    /// No turns from this user anywhere.
    NewUser,
    /// Known user, project without conversation yet.
    NewProject,
    /// Returning to a project still below the search threshold.
    LowCompleteness,
    ReturningUser,
}

impl WelcomeKind {
    pub fn classify(first_time: bool, project_has_turns: bool, completeness: u8, search_threshold: u8) -> Self {
        match (first_time, project_has_turns) {
            (true, false) => WelcomeKind::NewUser,
            (_, false) => WelcomeKind::NewProject,
            _ if completeness < search_threshold => WelcomeKind::LowCompleteness,
            _ => WelcomeKind::ReturningUser,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub kind: WelcomeKind,
    pub message: String,
    pub completeness: u8,
    pub suggested_actions: Vec<String>,
}

fn suggested_actions(kind: WelcomeKind, language: Language) -> Vec<String> {
    let labels: &[&str] = match (kind, language) {
        (WelcomeKind::NewUser, Language::Spanish) => &[
            "Cuéntame sobre tu startup",
            "Buscar inversores especializados",
            "Necesito mentoría",
            "Buscar empresas o servicios",
        ],
        (WelcomeKind::NewUser, _) => &[
            "Tell me about your startup",
            "Find specialised investors",
            "I need mentoring",
            "Find companies or services",
        ],
        (WelcomeKind::LowCompleteness, Language::Spanish) => &[
            "Completar mi perfil",
            "Buscar inversores ahora",
            "Necesito mentoría",
        ],
        (WelcomeKind::LowCompleteness, _) => &["Complete my profile", "Find investors now", "I need mentoring"],
        (_, Language::Spanish) => &[
            "Buscar inversores",
            "Buscar empresas o servicios",
            "Mentoría",
            "Actualizar mi proyecto",
        ],
        _ => &[
            "Find investors",
            "Find companies or services",
            "Mentoring",
            "Update my project",
        ],
    };
    labels.iter().map(|s| s.to_string()).collect()
}

fn bullets(questions: &[String]) -> String {
    questions.iter().map(|q| format!("\n- {}", q)).collect()
}

/// Builds the localized greeting for `kind`.
pub fn compose(kind: WelcomeKind, profile: &StoredProfile, language: Language) -> Welcome {
    let language = language.reply_language();
    let completeness = profile.completeness.total;
    let gaps = || {
        let mut questions = required_questions(&profile.completeness.missing, language);
        questions.truncate(GAP_QUESTIONS);
        bullets(&questions)
    };
    let message = match (kind, language) {
        (WelcomeKind::NewUser, Language::Spanish) => format!(
            "¡Bienvenido/a! Te ayudo a conectar con inversores y empresas especializadas, y te doy mentoría para tu ronda.\n\n\
             Para empezar, cuéntame brevemente sobre tu startup:{}",
            bullets(&required_questions(&profile.completeness.missing, language))
        ),
        (WelcomeKind::NewUser, _) => format!(
            "Welcome! I help you connect with investors and specialised companies, and mentor you through your round.\n\n\
             To get started, tell me briefly about your startup:{}",
            bullets(&required_questions(&profile.completeness.missing, language))
        ),
        (WelcomeKind::NewProject, Language::Spanish) => format!(
            "¡Nuevo proyecto en marcha! Su perfil está completo al {}%. ¿Qué hace esta startup y en qué etapa está?",
            completeness
        ),
        (WelcomeKind::NewProject, _) => format!(
            "New project underway! Its profile is {}% complete. What does this startup do and what stage is it at?",
            completeness
        ),
        (WelcomeKind::LowCompleteness, Language::Spanish) => format!(
            "¡Hola de nuevo! Tu perfil está completo al {}%. Para darte las mejores recomendaciones necesito un poco más:{}",
            completeness,
            gaps()
        ),
        (WelcomeKind::LowCompleteness, _) => format!(
            "Welcome back! Your profile is {}% complete. To give you the best matches I need a bit more:{}",
            completeness,
            gaps()
        ),
        (WelcomeKind::ReturningUser, Language::Spanish) => format!(
            "¡Bienvenido/a de vuelta! Tu perfil está completo al {}%. ¿Buscamos inversores, empresas especializadas o prefieres mentoría?",
            completeness
        ),
        (WelcomeKind::ReturningUser, _) => format!(
            "Welcome back! Your profile is {}% complete. Shall we look for investors, specialised companies, or would you like mentoring?",
            completeness
        ),
    };
    Welcome {
        kind,
        message,
        completeness,
        suggested_actions: suggested_actions(kind, language),
    }
}
