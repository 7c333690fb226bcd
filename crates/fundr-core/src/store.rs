//! Sled-backed persistence: one tree per record family.
//!
//! | Tree          | Key                                   | Value              |
//! |---------------|---------------------------------------|--------------------|
//! | `profiles`    | `{project_id}`                        | [`StoredProfile`]  |
//! | `turns`       | `p/{scope(project_id)}{seq:020}`      | [`ConversationTurn`] |
//! |               | `u/{scope(user_id)}{seq:020}`         | [`ConversationTurn`] |
//! | `accounts`    | `{user_id}`                           | credit account     |
//! | `reservations`| `{scope(user_id)}{uuid}`              | credit reservation |
//! | `ledger`      | `{scope(user_id)}{ts_ms:013}_{uuid}`  | [`LedgerEntry`]    |
//! | `upsells`     | `{scope(user_id)}{ts_ms:013}_{uuid}`  | [`UpsellRecord`]   |
//!
//! [`scope`] length-prefixes ids, so an id containing `/` never shares a prefix
//! with another id.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use uuid::Uuid;

use crate::decision::ActionKind;
use crate::error::StoreError;
use crate::profile::{score, CompletenessReport, ProjectProfile};
use crate::shared::Plan;

const DEFAULT_PATH: &str = "./data/fundr";

/// Key prefix owning every record of one id: `{len:04x}:{id}/`.
pub fn scope(id: &str) -> String {
    format!("{:04x}:{}/", id.len(), id)
}

/// Profile document plus its cached score and optimistic-concurrency revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProfile {
    pub profile: ProjectProfile,
    pub completeness: CompletenessReport,
    /// 0 = never written.
    pub revision: u64,
}

impl StoredProfile {
    pub fn empty() -> Self {
        let profile = ProjectProfile::default();
        Self {
            completeness: score(&profile),
            profile,
            revision: 0,
        }
    }

    /// Builds the document to write after a merge: score recomputed, revision bumped.
    pub fn next(&self, profile: ProjectProfile) -> Self {
        Self {
            completeness: score(&profile),
            profile,
            revision: self.revision + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Decision metadata attached to a persisted turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    #[serde(default)]
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_intent: Option<ActionKind>,
    #[serde(default)]
    pub spam: bool,
    #[serde(default)]
    pub spam_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub completeness: u8,
}

/// Immutable record of one message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_id: String,
    pub project_id: String,
    pub role: Role,
    pub text: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub meta: TurnMeta,
    #[serde(default)]
    pub credits_charged: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Committed,
    Released,
    Expired,
}

/// One row per billable action. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub reservation_id: String,
    pub action: ActionKind,
    pub reserved: u64,
    pub committed: u64,
    pub outcome: LedgerOutcome,
    pub timestamp_ms: i64,
}

/// One row per upsell shown to a user. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsellRecord {
    pub user_id: String,
    pub target_plan: Plan,
    pub trigger: String,
    pub confidence: u8,
    /// The user's turn number when the suggestion was shown.
    pub turn_index: u64,
    pub timestamp_ms: i64,
}

/// Project profile persistence with optimistic concurrency.
pub trait ProfileStore: Send + Sync {
    /// Current document; an unknown project reads as the empty profile at revision 0.
    fn read(&self, project_id: &str) -> Result<StoredProfile, StoreError>;

    /// Writes `doc` only if the stored revision still equals `expected_revision`.
    /// Returns false on conflict.
    fn write_if_revision(
        &self,
        project_id: &str,
        doc: &StoredProfile,
        expected_revision: u64,
    ) -> Result<bool, StoreError>;
}

/// Append-only ledger of billable actions.
pub trait LedgerStore: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Entries of one user at or after `since_ms`, oldest first.
    fn entries_since(&self, user_id: &str, since_ms: i64) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// Append-only conversation history.
pub trait TurnStore: Send + Sync {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError>;

    /// Last `limit` turns of a project in arrival order.
    fn recent_turns(&self, project_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, StoreError>;

    /// User-role turns of one user at or after `since_ms`, in arrival order.
    fn user_turns_since(&self, user_id: &str, since_ms: i64) -> Result<Vec<ConversationTurn>, StoreError>;

    /// Number of user-role turns a user has sent across all projects.
    fn user_turn_count(&self, user_id: &str) -> Result<u64, StoreError>;
}

/// History of shown upsells.
pub trait UpsellStore: Send + Sync {
    fn record_upsell(&self, record: &UpsellRecord) -> Result<(), StoreError>;

    /// All records of one user, oldest first.
    fn upsells_for(&self, user_id: &str) -> Result<Vec<UpsellRecord>, StoreError>;
}

/// Single sled database holding every engine tree.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    profiles: Tree,
    turns: Tree,
    accounts: Tree,
    reservations: Tree,
    ledger: Tree,
    upsells: Tree,
}

impl SledStore {
    /// Opens or creates the database at `./data/fundr`.
    pub fn new() -> Result<Self, StoreError> {
        Self::open_path(DEFAULT_PATH)
    }

    /// Opens or creates the database at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. Used by tests.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            profiles: db.open_tree("profiles")?,
            turns: db.open_tree("turns")?,
            accounts: db.open_tree("accounts")?,
            reservations: db.open_tree("reservations")?,
            ledger: db.open_tree("ledger")?,
            upsells: db.open_tree("upsells")?,
            db,
        })
    }

    pub(crate) fn accounts(&self) -> &Tree {
        &self.accounts
    }

    pub(crate) fn reservations(&self) -> &Tree {
        &self.reservations
    }

    /// Entry counts per tree, for the status endpoint.
    pub fn tree_counts(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("profiles", self.profiles.len()),
            ("turns", self.turns.len()),
            ("accounts", self.accounts.len()),
            ("reservations", self.reservations.len()),
            ("ledger", self.ledger.len()),
            ("upsells", self.upsells.len()),
        ]
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn timestamped_key(user_id: &str, ts_ms: i64) -> String {
        format!("{}{:013}_{}", scope(user_id), ts_ms.max(0), Uuid::new_v4().simple())
    }

    fn scan_values<T: for<'de> Deserialize<'de>>(tree: &Tree, prefix: &str) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

impl ProfileStore for SledStore {
    fn read(&self, project_id: &str) -> Result<StoredProfile, StoreError> {
        match self.profiles.get(project_id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(StoredProfile::empty()),
        }
    }

    fn write_if_revision(
        &self,
        project_id: &str,
        doc: &StoredProfile,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        let current = self.profiles.get(project_id.as_bytes())?;
        let current_revision = match &current {
            Some(bytes) => serde_json::from_slice::<StoredProfile>(bytes)?.revision,
            None => 0,
        };
        if current_revision != expected_revision {
            return Ok(false);
        }
        let new_bytes = serde_json::to_vec(doc)?;
        let swapped = self
            .profiles
            .compare_and_swap(project_id.as_bytes(), current, Some(new_bytes))?;
        let ok = swapped.is_ok();
        tracing::debug!(
            target: "fundr::store",
            project_id = %project_id,
            revision = doc.revision,
            expected_revision,
            ok,
            "profile conditional write"
        );
        Ok(ok)
    }
}

impl LedgerStore for SledStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let key = Self::timestamped_key(&entry.user_id, entry.timestamp_ms);
        self.ledger.insert(key.as_bytes(), serde_json::to_vec(entry)?)?;
        tracing::info!(
            target: "fundr::store",
            user_id = %entry.user_id,
            action = %entry.action,
            reserved = entry.reserved,
            committed = entry.committed,
            outcome = ?entry.outcome,
            "ledger entry appended"
        );
        Ok(())
    }

    fn entries_since(&self, user_id: &str, since_ms: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        let prefix = scope(user_id);
        let start = format!("{}{:013}", prefix, since_ms.max(0));
        let end = format!("{}~", prefix);
        let mut out = Vec::new();
        for item in self.ledger.range(start.as_bytes()..end.as_bytes()) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

impl TurnStore for SledStore {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError> {
        let seq = self.db.generate_id()?;
        let bytes = serde_json::to_vec(turn)?;
        let mut batch = sled::Batch::default();
        batch.insert(format!("p/{}{:020}", scope(&turn.project_id), seq).as_bytes(), bytes.clone());
        if turn.role == Role::User {
            batch.insert(format!("u/{}{:020}", scope(&turn.user_id), seq).as_bytes(), bytes);
        }
        self.turns.apply_batch(batch)?;
        Ok(())
    }

    fn recent_turns(&self, project_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, StoreError> {
        let prefix = format!("p/{}", scope(project_id));
        let mut out = Vec::with_capacity(limit);
        for item in self.turns.scan_prefix(prefix.as_bytes()).rev().take(limit) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        out.reverse();
        Ok(out)
    }

    fn user_turns_since(&self, user_id: &str, since_ms: i64) -> Result<Vec<ConversationTurn>, StoreError> {
        let prefix = format!("u/{}", scope(user_id));
        let mut out: Vec<ConversationTurn> = Vec::new();
        for item in self.turns.scan_prefix(prefix.as_bytes()).rev() {
            let (_, v) = item?;
            let turn: ConversationTurn = serde_json::from_slice(&v)?;
            if turn.timestamp_ms < since_ms {
                break;
            }
            out.push(turn);
        }
        out.reverse();
        Ok(out)
    }

    fn user_turn_count(&self, user_id: &str) -> Result<u64, StoreError> {
        let prefix = format!("u/{}", scope(user_id));
        Ok(self.turns.scan_prefix(prefix.as_bytes()).keys().count() as u64)
    }
}

impl UpsellStore for SledStore {
    fn record_upsell(&self, record: &UpsellRecord) -> Result<(), StoreError> {
        let key = Self::timestamped_key(&record.user_id, record.timestamp_ms);
        self.upsells.insert(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn upsells_for(&self, user_id: &str) -> Result<Vec<UpsellRecord>, StoreError> {
        Self::scan_values(&self.upsells, &scope(user_id))
    }
}
