//! Search index over a JSON dataset of investors and service companies.
//!
//! File shape: `{ "investors": [SearchCandidate], "companies": [SearchCandidate] }`.
//! Ranking is category overlap first, then stage fit, then keyword overlap with the
//! problem description.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use fundr_core::profile::normalize_category;
use fundr_core::{SearchCandidate, SearchError, SearchIndex, SearchKind, SearchQuery};

const CATEGORY_WEIGHT: f64 = 2.0;
const STAGE_WEIGHT: f64 = 1.5;
const KEYWORD_WEIGHT: f64 = 0.5;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Dataset {
    investors: Vec<SearchCandidate>,
    companies: Vec<SearchCandidate>,
}

#[derive(Debug, Default)]
pub struct DatasetIndex {
    investors: Vec<SearchCandidate>,
    companies: Vec<SearchCandidate>,
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(|w| w.to_lowercase())
        .collect()
}

impl DatasetIndex {
    pub fn new(investors: Vec<SearchCandidate>, companies: Vec<SearchCandidate>) -> Self {
        Self { investors, companies }
    }

    /// Index with no entries; every query returns zero candidates.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SearchError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SearchError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let dataset: Dataset = serde_json::from_str(&raw)
            .map_err(|e| SearchError::Unavailable(format!("{}: {}", path.display(), e)))?;
        tracing::info!(
            target: "fundr::skills",
            path = %path.display(),
            investors = dataset.investors.len(),
            companies = dataset.companies.len(),
            "search dataset loaded"
        );
        Ok(Self::new(dataset.investors, dataset.companies))
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.investors.len(), self.companies.len())
    }

    fn relevance(candidate: &SearchCandidate, query: &SearchQuery, wanted: &BTreeSet<String>, terms: &BTreeSet<String>) -> f64 {
        let tags: BTreeSet<String> = candidate.categories.iter().map(|c| normalize_category(c)).collect();
        let overlap = tags.intersection(wanted).count() as f64;
        let stage_fit = match query.stage {
            Some(stage) if candidate.stages.contains(&stage) => 1.0,
            _ => 0.0,
        };
        let text = keywords(&format!("{} {}", candidate.name, candidate.description));
        let keyword_hits = text.intersection(terms).count() as f64;
        overlap * CATEGORY_WEIGHT + stage_fit * STAGE_WEIGHT + keyword_hits * KEYWORD_WEIGHT
    }
}

#[async_trait]
impl SearchIndex for DatasetIndex {
    async fn query(&self, kind: SearchKind, query: &SearchQuery) -> Result<Vec<SearchCandidate>, SearchError> {
        let pool = match kind {
            SearchKind::Investors => &self.investors,
            SearchKind::Companies => &self.companies,
        };
        let wanted: BTreeSet<String> = query.categories.iter().map(|c| normalize_category(c)).collect();
        let terms = query.problem_context.as_deref().map(keywords).unwrap_or_default();

        let mut ranked: Vec<SearchCandidate> = pool
            .iter()
            .filter_map(|c| {
                let score = Self::relevance(c, query, &wanted, &terms);
                (score > 0.0).then(|| SearchCandidate { score, ..c.clone() })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        ranked.truncate(query.limit.max(1));
        tracing::debug!(target: "fundr::skills", kind = ?kind, results = ranked.len(), "dataset query");
        Ok(ranked)
    }
}
