//! Structured, partially-known project profile.
//!
//! Every fact carries the confidence of whoever set it so later merges can decide
//! whether a new proposal is allowed to replace it.

mod completeness;

pub use completeness::{score, CompletenessReport, ProfileField};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::decision::FactCandidates;

/// Funding-stage vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idea,
    Prototype,
    Mvp,
    Seed,
    EarlyRevenue,
    SeriesA,
    SeriesB,
    Growth,
    Scale,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idea => "idea",
            Stage::Prototype => "prototype",
            Stage::Mvp => "mvp",
            Stage::Seed => "seed",
            Stage::EarlyRevenue => "early_revenue",
            Stage::SeriesA => "series_a",
            Stage::SeriesB => "series_b",
            Stage::Growth => "growth",
            Stage::Scale => "scale",
        }
    }

    /// Lenient parse: accepts spaces, dashes, and common Spanish spellings.
    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "idea" | "ideacion" | "ideación" => Some(Stage::Idea),
            "prototype" | "prototipo" => Some(Stage::Prototype),
            "mvp" => Some(Stage::Mvp),
            "seed" | "semilla" | "pre_seed" | "preseed" => Some(Stage::Seed),
            "early_revenue" | "revenue" | "primeros_ingresos" => Some(Stage::EarlyRevenue),
            "series_a" | "serie_a" => Some(Stage::SeriesA),
            "series_b" | "serie_b" => Some(Stage::SeriesB),
            "growth" | "crecimiento" => Some(Stage::Growth),
            "scale" | "escala" | "scaleup" | "scale_up" => Some(Stage::Scale),
            _ => None,
        }
    }
}

/// Addressable profile facts. Confidence is tracked per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactKey {
    #[serde(rename = "categories")]
    Categories,
    #[serde(rename = "stage")]
    Stage,
    #[serde(rename = "metrics.revenue")]
    Revenue,
    #[serde(rename = "metrics.users")]
    Users,
    #[serde(rename = "metrics.growth_rate")]
    GrowthRate,
    #[serde(rename = "team.size")]
    TeamSize,
    #[serde(rename = "team.roles")]
    TeamRoles,
    #[serde(rename = "team.experience")]
    TeamExperience,
    #[serde(rename = "problem")]
    Problem,
    #[serde(rename = "product.phase")]
    ProductPhase,
    #[serde(rename = "product.detail")]
    ProductDetail,
    #[serde(rename = "funding.amount")]
    FundingAmount,
    #[serde(rename = "funding.round")]
    FundingRound,
}

impl FactKey {
    pub fn all() -> [Self; 13] {
        [
            FactKey::Categories,
            FactKey::Stage,
            FactKey::Revenue,
            FactKey::Users,
            FactKey::GrowthRate,
            FactKey::TeamSize,
            FactKey::TeamRoles,
            FactKey::TeamExperience,
            FactKey::Problem,
            FactKey::ProductPhase,
            FactKey::ProductDetail,
            FactKey::FundingAmount,
            FactKey::FundingRound,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKey::Categories => "categories",
            FactKey::Stage => "stage",
            FactKey::Revenue => "metrics.revenue",
            FactKey::Users => "metrics.users",
            FactKey::GrowthRate => "metrics.growth_rate",
            FactKey::TeamSize => "team.size",
            FactKey::TeamRoles => "team.roles",
            FactKey::TeamExperience => "team.experience",
            FactKey::Problem => "problem",
            FactKey::ProductPhase => "product.phase",
            FactKey::ProductDetail => "product.detail",
            FactKey::FundingAmount => "funding.amount",
            FactKey::FundingRound => "funding.round",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let key = s.trim().to_lowercase();
        Self::all().into_iter().find(|k| k.as_str() == key).or(match key.as_str() {
            "category" | "industry" | "industries" => Some(FactKey::Categories),
            "revenue" => Some(FactKey::Revenue),
            "users" => Some(FactKey::Users),
            "growth_rate" | "growth" => Some(FactKey::GrowthRate),
            "team_size" => Some(FactKey::TeamSize),
            "problem_statement" => Some(FactKey::Problem),
            "product_status" | "product_phase" => Some(FactKey::ProductPhase),
            "prior_funding" | "funding_amount" => Some(FactKey::FundingAmount),
            "funding_round" => Some(FactKey::FundingRound),
            _ => None,
        })
    }
}

/// A proposed or stored value for one [`FactKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FactValue {
    Categories(BTreeSet<String>),
    Stage(Stage),
    Text(String),
}

impl FactValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FactValue::Categories(set) => set.is_empty(),
            FactValue::Stage(_) => false,
            FactValue::Text(t) => t.trim().is_empty(),
        }
    }
}

/// Normalizes a category tag: lowercase, trimmed, inner whitespace collapsed.
pub fn normalize_category(tag: &str) -> String {
    tag.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub revenue: Option<String>,
    pub users: Option<String>,
    pub growth_rate: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub size: Option<String>,
    pub roles: Option<String>,
    pub experience: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStatus {
    pub phase: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorFunding {
    pub amount: Option<String>,
    pub round: Option<String>,
}

/// How a merge treats existing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Candidate wins only with strictly higher confidence or over an empty field.
    Confidence,
    /// Explicit user edit: always wins, categories are replaced rather than unioned.
    Authoritative,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectProfile {
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub team: TeamInfo,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub product: ProductStatus,
    #[serde(default)]
    pub funding: PriorFunding,
    /// Confidence (0-100) of the value currently stored under each key.
    #[serde(default)]
    pub confidence: BTreeMap<FactKey, u8>,
}

impl ProjectProfile {
    fn text_slot(&mut self, key: FactKey) -> Option<&mut Option<String>> {
        match key {
            FactKey::Revenue => Some(&mut self.metrics.revenue),
            FactKey::Users => Some(&mut self.metrics.users),
            FactKey::GrowthRate => Some(&mut self.metrics.growth_rate),
            FactKey::TeamSize => Some(&mut self.team.size),
            FactKey::TeamRoles => Some(&mut self.team.roles),
            FactKey::TeamExperience => Some(&mut self.team.experience),
            FactKey::Problem => Some(&mut self.problem),
            FactKey::ProductPhase => Some(&mut self.product.phase),
            FactKey::ProductDetail => Some(&mut self.product.detail),
            FactKey::FundingAmount => Some(&mut self.funding.amount),
            FactKey::FundingRound => Some(&mut self.funding.round),
            FactKey::Categories | FactKey::Stage => None,
        }
    }

    /// Current value under `key`, `None` when empty.
    pub fn get(&self, key: FactKey) -> Option<FactValue> {
        let text = |v: &Option<String>| {
            v.as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| FactValue::Text(s.clone()))
        };
        match key {
            FactKey::Categories => {
                (!self.categories.is_empty()).then(|| FactValue::Categories(self.categories.clone()))
            }
            FactKey::Stage => self.stage.map(FactValue::Stage),
            FactKey::Revenue => text(&self.metrics.revenue),
            FactKey::Users => text(&self.metrics.users),
            FactKey::GrowthRate => text(&self.metrics.growth_rate),
            FactKey::TeamSize => text(&self.team.size),
            FactKey::TeamRoles => text(&self.team.roles),
            FactKey::TeamExperience => text(&self.team.experience),
            FactKey::Problem => text(&self.problem),
            FactKey::ProductPhase => text(&self.product.phase),
            FactKey::ProductDetail => text(&self.product.detail),
            FactKey::FundingAmount => text(&self.funding.amount),
            FactKey::FundingRound => text(&self.funding.round),
        }
    }

    pub fn confidence_of(&self, key: FactKey) -> u8 {
        self.confidence.get(&key).copied().unwrap_or(0)
    }

    /// Writes `value` under `key` unconditionally. Mismatched value shapes are ignored.
    fn set(&mut self, key: FactKey, value: &FactValue) -> bool {
        match (key, value) {
            (FactKey::Categories, FactValue::Categories(tags)) => {
                self.categories = tags.iter().map(|t| normalize_category(t)).collect();
                true
            }
            (FactKey::Stage, FactValue::Stage(stage)) => {
                self.stage = Some(*stage);
                true
            }
            (FactKey::Stage, FactValue::Text(raw)) => match Stage::parse(raw) {
                Some(stage) => {
                    self.stage = Some(stage);
                    true
                }
                None => false,
            },
            (key, FactValue::Text(text)) => match self.text_slot(key) {
                Some(slot) => {
                    *slot = Some(text.trim().to_string());
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Merges candidate facts. Returns true when anything (value or confidence) changed.
    ///
    /// Categories always merge as a set union and keep the max confidence. Every
    /// other key is replaced only when the field is empty or the candidate's
    /// confidence is strictly greater than the stored one.
    pub fn merge(&mut self, candidates: &FactCandidates, mode: MergeMode) -> bool {
        let mut changed = false;
        for (key, candidate) in candidates {
            if candidate.value.is_empty() {
                continue;
            }
            let existing_conf = self.confidence_of(*key);
            let confidence = candidate.confidence.min(100);

            if *key == FactKey::Categories && mode == MergeMode::Confidence {
                if let FactValue::Categories(tags) = &candidate.value {
                    for tag in tags {
                        let tag = normalize_category(tag);
                        if !tag.is_empty() && self.categories.insert(tag) {
                            changed = true;
                        }
                    }
                    if confidence > existing_conf {
                        self.confidence.insert(*key, confidence);
                        changed = true;
                    }
                }
                continue;
            }

            let current = self.get(*key);
            let wins = match mode {
                MergeMode::Authoritative => true,
                MergeMode::Confidence => current.is_none() || confidence > existing_conf,
            };
            if !wins {
                continue;
            }
            let before = current;
            if !self.set(*key, &candidate.value) {
                continue;
            }
            if self.get(*key) != before || existing_conf != confidence {
                changed = true;
            }
            self.confidence.insert(*key, confidence);
        }
        changed
    }

    /// Compact, prompt-friendly rendering of the known facts.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for key in FactKey::all() {
            if let Some(value) = self.get(key) {
                let rendered = match value {
                    FactValue::Categories(tags) => tags.into_iter().collect::<Vec<_>>().join(", "),
                    FactValue::Stage(stage) => stage.as_str().to_string(),
                    FactValue::Text(text) => text,
                };
                lines.push(format!("{}: {}", key.as_str(), rendered));
            }
        }
        if lines.is_empty() {
            "(empty profile)".to_string()
        } else {
            lines.join("\n")
        }
    }
}
