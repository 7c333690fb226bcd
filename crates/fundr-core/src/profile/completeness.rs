//! Deterministic completeness scoring.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ProjectProfile;

/// Words after which a problem statement counts as fully described.
const PROBLEM_FULL_WORDS: f64 = 12.0;

/// Scored sections of a profile, in descending weight order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Categories,
    Stage,
    Metrics,
    Team,
    Problem,
    Product,
    Funding,
}

impl ProfileField {
    pub fn all() -> [Self; 7] {
        [
            ProfileField::Categories,
            ProfileField::Stage,
            ProfileField::Metrics,
            ProfileField::Team,
            ProfileField::Problem,
            ProfileField::Product,
            ProfileField::Funding,
        ]
    }

    /// Weights sum to 100.
    pub fn weight(&self) -> f64 {
        match self {
            ProfileField::Categories => 25.0,
            ProfileField::Stage => 25.0,
            ProfileField::Metrics => 15.0,
            ProfileField::Team => 10.0,
            ProfileField::Problem => 10.0,
            ProfileField::Product => 10.0,
            ProfileField::Funding => 5.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileField::Categories => "categories",
            ProfileField::Stage => "stage",
            ProfileField::Metrics => "metrics",
            ProfileField::Team => "team",
            ProfileField::Problem => "problem",
            ProfileField::Product => "product",
            ProfileField::Funding => "funding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// 0-100.
    pub total: u8,
    pub breakdown: BTreeMap<ProfileField, f64>,
    /// Absent or partial fields, highest weight first.
    pub missing: Vec<ProfileField>,
}

fn filled(values: &[&Option<String>]) -> f64 {
    values
        .iter()
        .filter(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
        .count() as f64
}

fn sub_score(profile: &ProjectProfile, field: ProfileField) -> f64 {
    let weight = field.weight();
    match field {
        ProfileField::Categories => {
            if profile.categories.is_empty() {
                0.0
            } else {
                weight
            }
        }
        ProfileField::Stage => {
            if profile.stage.is_some() {
                weight
            } else {
                0.0
            }
        }
        ProfileField::Metrics => {
            let m = &profile.metrics;
            weight * filled(&[&m.revenue, &m.users, &m.growth_rate]) / 3.0
        }
        ProfileField::Team => {
            let t = &profile.team;
            weight * filled(&[&t.size, &t.roles, &t.experience]) / 3.0
        }
        ProfileField::Problem => {
            let words = profile
                .problem
                .as_deref()
                .map(|p| p.split_whitespace().count())
                .unwrap_or(0) as f64;
            weight * (words / PROBLEM_FULL_WORDS).min(1.0)
        }
        ProfileField::Product => {
            let p = &profile.product;
            weight * filled(&[&p.phase, &p.detail]) / 2.0
        }
        ProfileField::Funding => {
            let f = &profile.funding;
            weight * filled(&[&f.amount, &f.round]) / 2.0
        }
    }
}

/// Scores a profile. Pure; adding non-empty information never lowers the total.
pub fn score(profile: &ProjectProfile) -> CompletenessReport {
    let mut breakdown = BTreeMap::new();
    let mut missing = Vec::new();
    let mut sum = 0.0;

    for field in ProfileField::all() {
        let sub = sub_score(profile, field);
        if sub < field.weight() {
            missing.push(field);
        }
        sum += sub;
        breakdown.insert(field, sub);
    }

    // `all()` is already weight-descending; the stable sort keeps that order for ties.
    missing.sort_by(|a, b| b.weight().total_cmp(&a.weight()));

    CompletenessReport {
        total: sum.round().clamp(0.0, 100.0) as u8,
        breakdown,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Stage;

    #[test]
    fn empty_profile_scores_zero_and_misses_everything() {
        let report = score(&ProjectProfile::default());
        assert_eq!(report.total, 0);
        assert_eq!(report.missing.first(), Some(&ProfileField::Categories));
        assert_eq!(report.missing.last(), Some(&ProfileField::Funding));
        assert_eq!(report.missing.len(), 7);
    }

    #[test]
    fn categories_and_stage_score_fifty() {
        let mut p = ProjectProfile::default();
        p.categories.insert("fintech".into());
        p.stage = Some(Stage::Seed);
        let report = score(&p);
        assert_eq!(report.total, 50);
        assert_eq!(report.missing.first(), Some(&ProfileField::Metrics));
    }

    #[test]
    fn partial_sections_score_proportionally() {
        let mut p = ProjectProfile::default();
        p.metrics.revenue = Some("20k MRR".into());
        p.problem = Some("small shops cannot get credit".into());
        p.funding.round = Some("pre-seed".into());
        let report = score(&p);
        assert!((report.breakdown[&ProfileField::Metrics] - 5.0).abs() < 1e-9);
        assert!((report.breakdown[&ProfileField::Funding] - 2.5).abs() < 1e-9);
        // 5 + 10*5/12 + 2.5 = 11.67
        assert_eq!(report.total, 12);
        assert!(report.missing.contains(&ProfileField::Problem));
    }

    #[test]
    fn full_profile_scores_hundred() {
        let mut p = ProjectProfile::default();
        p.categories.insert("saas".into());
        p.stage = Some(Stage::SeriesA);
        p.metrics = crate::profile::Metrics {
            revenue: Some("1M ARR".into()),
            users: Some("12000".into()),
            growth_rate: Some("15% MoM".into()),
        };
        p.team = crate::profile::TeamInfo {
            size: Some("14".into()),
            roles: Some("CEO, CTO, 10 engineers".into()),
            experience: Some("two prior exits".into()),
        };
        p.problem = Some("mid-sized logistics firms waste a third of their fleet capacity on empty return trips".into());
        p.product.phase = Some("live".into());
        p.product.detail = Some("routing marketplace".into());
        p.funding.amount = Some("2M".into());
        p.funding.round = Some("seed".into());
        let report = score(&p);
        assert_eq!(report.total, 100);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn adding_fields_never_decreases_score() {
        let mut p = ProjectProfile::default();
        let mut last = score(&p).total;
        let steps: Vec<Box<dyn Fn(&mut ProjectProfile)>> = vec![
            Box::new(|p| p.team.size = Some("3".into())),
            Box::new(|p| p.problem = Some("founders".into())),
            Box::new(|p| p.metrics.users = Some("900".into())),
            Box::new(|p| {
                p.categories.insert("edtech".into());
            }),
            Box::new(|p| p.funding.amount = Some("50k".into())),
            Box::new(|p| p.stage = Some(Stage::Idea)),
            Box::new(|p| p.product.detail = Some("mobile app".into())),
        ];
        for step in steps {
            step(&mut p);
            let now = score(&p).total;
            assert!(now >= last, "score decreased from {last} to {now}");
            last = now;
        }
    }
}
