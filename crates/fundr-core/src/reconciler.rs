//! Background reconciler: merges extracted facts into the stored profile off the
//! reply path.
//!
//! Merges use optimistic concurrency: read profile + revision, merge, write only
//! if the revision is unchanged, otherwise re-read and retry (bounded). Jobs arrive
//! through a bounded queue drained by a single worker task that spawns one merge
//! task per job; [`ReconcilerHandle::shutdown`] closes the queue and waits for
//! every accepted job to finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::collaborators::{render_prompt, LanguageModel, ModelTask};
use crate::decision::{merge_candidates, FactCandidate, FactCandidates};
use crate::error::{EngineError, EngineResult};
use crate::gate::Language;
use crate::judge::parse_facts;
use crate::profile::{FactKey, FactValue, MergeMode};
use crate::shared::ReconcilerConfig;
use crate::store::{ProfileStore, Role, TurnStore};

/// Turns re-read by a forced history reconciliation.
const HISTORY_TURNS: usize = 10;

/// Base backoff between conflicting merge attempts.
const RETRY_BACKOFF_MS: u64 = 15;

/// One unit of reconciliation work.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub project_id: String,
    pub facts: FactCandidates,
    /// Revision the judge saw when it proposed `facts`.
    pub revision_seen: u64,
    /// Original message, used for enrichment.
    pub message: Option<String>,
    pub language: Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { revision: u64, completeness: u8 },
    Unchanged,
}

pub struct Reconciler {
    profiles: Arc<dyn ProfileStore>,
    turns: Arc<dyn TurnStore>,
    model: Option<Arc<dyn LanguageModel>>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        turns: Arc<dyn TurnStore>,
        model: Option<Arc<dyn LanguageModel>>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            profiles,
            turns,
            model,
            config,
        }
    }

    /// Asks the model for facts in free text. Errors only cost the enrichment.
    async fn enrich(&self, text: &str, language: Language) -> FactCandidates {
        let Some(model) = self.model.as_ref().filter(|_| self.config.enrichment) else {
            return FactCandidates::new();
        };
        let keys = FactKey::all().map(|k| k.as_str()).join(", ");
        let prompt = render_prompt(
            ModelTask::ExtractFacts,
            &format!(
                "Extract startup profile facts from the text. Keys: {keys}. Numbers stay as written. \
                 Answer as JSON: {{\"facts\": {{key: {{\"value\": ..., \"confidence\": 0-100}}}}}}. Omit unknown keys.\n{}",
                language.instructions()
            ),
            &[("text", text)],
        );
        match model.classify(&prompt).await {
            Ok(value) => value
                .get("facts")
                .and_then(|f| f.as_object())
                .map(parse_facts)
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!(target: "fundr::reconciler", error = %e, "enrichment skipped");
                FactCandidates::new()
            }
        }
    }

    async fn merge_with_retry(
        &self,
        project_id: &str,
        facts: &FactCandidates,
        mode: MergeMode,
        revision_seen: Option<u64>,
    ) -> EngineResult<ReconcileOutcome> {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            let stored = self.profiles.read(project_id)?;
            if let Some(seen) = revision_seen {
                if seen != stored.revision {
                    tracing::debug!(
                        target: "fundr::reconciler",
                        project_id = %project_id,
                        revision_seen = seen,
                        revision = stored.revision,
                        "profile moved since classification"
                    );
                }
            }

            let mut merged = stored.profile.clone();
            if !merged.merge(facts, mode) {
                return Ok(ReconcileOutcome::Unchanged);
            }
            let next = stored.next(merged);
            if self.profiles.write_if_revision(project_id, &next, stored.revision)? {
                tracing::info!(
                    target: "fundr::reconciler",
                    project_id = %project_id,
                    revision = next.revision,
                    completeness = next.completeness.total,
                    attempt,
                    "profile merged"
                );
                return Ok(ReconcileOutcome::Applied {
                    revision: next.revision,
                    completeness: next.completeness.total,
                });
            }

            tracing::debug!(target: "fundr::reconciler", project_id = %project_id, attempt, "merge conflict, retrying");
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
            }
        }

        tracing::warn!(
            target: "fundr::reconciler",
            project_id = %project_id,
            attempts,
            "reconciliation dropped after exhausting retries"
        );
        Err(EngineError::MergeConflict {
            project_id: project_id.to_string(),
            attempts,
        })
    }

    /// Merges candidate facts into the profile. Re-running with the same facts
    /// against an unchanged profile is a no-op.
    pub async fn reconcile(
        &self,
        project_id: &str,
        facts: FactCandidates,
        revision_seen: u64,
    ) -> EngineResult<ReconcileOutcome> {
        self.merge_with_retry(project_id, &facts, MergeMode::Confidence, Some(revision_seen))
            .await
    }

    /// Runs a queued job: enrichment (if enabled) then [`Self::reconcile`].
    pub async fn run_job(&self, job: ReconcileJob) -> EngineResult<ReconcileOutcome> {
        let facts = match job.message.as_deref() {
            Some(message) if !message.trim().is_empty() => {
                let extra = self.enrich(message, job.language).await;
                merge_candidates(job.facts, extra)
            }
            _ => job.facts,
        };
        if facts.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.reconcile(&job.project_id, facts, job.revision_seen).await
    }

    /// Applies facts the user set explicitly; they always win over extracted ones.
    pub async fn apply_user_edit(
        &self,
        project_id: &str,
        edits: Vec<(FactKey, FactValue)>,
    ) -> EngineResult<ReconcileOutcome> {
        let facts: FactCandidates = edits
            .into_iter()
            .map(|(key, value)| (key, FactCandidate { value, confidence: 100 }))
            .collect();
        self.merge_with_retry(project_id, &facts, MergeMode::Authoritative, None)
            .await
    }

    /// Re-extracts facts from the project's recent user turns and merges them.
    pub async fn reconcile_history(&self, project_id: &str, language: Language) -> EngineResult<ReconcileOutcome> {
        let text = self
            .turns
            .recent_turns(project_id, HISTORY_TURNS)?
            .into_iter()
            .filter(|t| t.role == Role::User && !t.meta.spam)
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }
        let facts = self.enrich(&text, language).await;
        if facts.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }
        let revision = self.profiles.read(project_id)?.revision;
        self.reconcile(project_id, facts, revision).await
    }

    /// Starts the queue worker.
    pub fn spawn(self: Arc<Self>) -> (ReconcilerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(self, rx));
        (ReconcilerHandle { tx }, worker)
    }
}

enum Command {
    Job(ReconcileJob),
    Shutdown(oneshot::Sender<()>),
}

async fn run_worker(reconciler: Arc<Reconciler>, mut rx: mpsc::Receiver<Command>) {
    let mut tasks = JoinSet::new();
    let spawn_job = |tasks: &mut JoinSet<()>, job: ReconcileJob| {
        let reconciler = reconciler.clone();
        tasks.spawn(async move {
            let project_id = job.project_id.clone();
            if let Err(e) = reconciler.run_job(job).await {
                tracing::warn!(target: "fundr::reconciler", project_id = %project_id, error = %e, "reconciliation failed");
            }
        });
    };

    let mut ack = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Job(job) => spawn_job(&mut tasks, job),
            Command::Shutdown(done) => {
                ack = Some(done);
                break;
            }
        }
        while tasks.try_join_next().is_some() {}
    }

    rx.close();
    while let Some(cmd) = rx.recv().await {
        if let Command::Job(job) = cmd {
            spawn_job(&mut tasks, job);
        }
    }
    let pending = tasks.len();
    while tasks.join_next().await.is_some() {}
    tracing::info!(target: "fundr::reconciler", drained = pending, "reconciler stopped");
    if let Some(done) = ack {
        let _ = done.send(());
    }
}

/// Cloneable producer side of the reconciliation queue.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<Command>,
}

impl ReconcilerHandle {
    /// Fire-and-forget enqueue. A full or closed queue drops the job with a warning.
    pub fn enqueue(&self, job: ReconcileJob) -> bool {
        let project_id = job.project_id.clone();
        match self.tx.try_send(Command::Job(job)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(target: "fundr::reconciler", project_id = %project_id, "queue full, reconciliation dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(target: "fundr::reconciler", project_id = %project_id, "queue closed, reconciliation dropped");
                false
            }
        }
    }

    /// Stops accepting jobs and waits until every accepted job has finished.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Stage;
    use crate::store::SledStore;

    fn stage_fact(stage: Stage, confidence: u8) -> FactCandidates {
        let mut f = FactCandidates::new();
        f.insert(FactKey::Stage, FactCandidate { value: FactValue::Stage(stage), confidence });
        f
    }

    fn reconciler(store: Arc<SledStore>) -> Reconciler {
        Reconciler::new(store.clone(), store, None, ReconcilerConfig::default())
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let r = reconciler(store.clone());
        let out = r.reconcile("p1", stage_fact(Stage::Seed, 80), 0).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Applied { revision: 1, completeness: 25 }));
        let first = store.read("p1").unwrap();
        assert_eq!(r.reconcile("p1", stage_fact(Stage::Seed, 80), 1).await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(store.read("p1").unwrap(), first);
    }

    #[tokio::test]
    async fn higher_confidence_wins_in_either_order() {
        for order in [[(Stage::Mvp, 60), (Stage::Seed, 90)], [(Stage::Seed, 90), (Stage::Mvp, 60)]] {
            let store = Arc::new(SledStore::temporary().unwrap());
            let r = reconciler(store.clone());
            for (stage, conf) in order {
                r.reconcile("p1", stage_fact(stage, conf), 0).await.unwrap();
            }
            let doc = store.read("p1").unwrap();
            assert_eq!(doc.profile.stage, Some(Stage::Seed));
            assert_eq!(doc.profile.confidence_of(FactKey::Stage), 90);
        }
    }

    #[tokio::test]
    async fn user_edit_overrides_confident_fact() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let r = reconciler(store.clone());
        r.reconcile("p1", stage_fact(Stage::Seed, 95), 0).await.unwrap();
        r.apply_user_edit("p1", vec![(FactKey::Stage, FactValue::Stage(Stage::Mvp))])
            .await
            .unwrap();
        let doc = store.read("p1").unwrap();
        assert_eq!(doc.profile.stage, Some(Stage::Mvp));
        assert_eq!(doc.profile.confidence_of(FactKey::Stage), 100);
        assert_eq!(doc.revision, 2);
    }

    struct AlwaysConflicting;

    impl ProfileStore for AlwaysConflicting {
        fn read(&self, _project_id: &str) -> Result<crate::store::StoredProfile, crate::error::StoreError> {
            Ok(crate::store::StoredProfile::empty())
        }
        fn write_if_revision(
            &self,
            _project_id: &str,
            _doc: &crate::store::StoredProfile,
            _expected_revision: u64,
        ) -> Result<bool, crate::error::StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_merge_conflict() {
        let turns = Arc::new(SledStore::temporary().unwrap());
        let r = Reconciler::new(Arc::new(AlwaysConflicting), turns, None, ReconcilerConfig::default());
        let err = r.reconcile("p1", stage_fact(Stage::Seed, 90), 0).await.unwrap_err();
        assert!(matches!(err, EngineError::MergeConflict { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let (handle, worker) = Arc::new(reconciler(store.clone())).spawn();
        for (i, stage) in [Stage::Idea, Stage::Mvp, Stage::Seed].into_iter().enumerate() {
            assert!(handle.enqueue(ReconcileJob {
                project_id: format!("p{i}"),
                facts: stage_fact(stage, 70),
                revision_seen: 0,
                message: None,
                language: Language::English,
            }));
        }
        handle.shutdown().await;
        worker.await.unwrap();
        for i in 0..3 {
            assert_eq!(store.read(&format!("p{i}")).unwrap().revision, 1);
        }
        assert!(!handle.enqueue(ReconcileJob {
            project_id: "late".into(),
            facts: stage_fact(Stage::Seed, 70),
            revision_seen: 0,
            message: None,
            language: Language::English,
        }));
    }
}
