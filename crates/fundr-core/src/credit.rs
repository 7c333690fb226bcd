//! Two-phase credit meter: reserve the maximum cost, then commit the actual cost
//! or release the hold.
//!
//! Account and reservation rows change together in one sled transaction keyed by
//! user id, so concurrent requests from one user cannot both pass the caps. Holds
//! that are never settled expire after `reservation_ttl_secs` and are released by
//! [`CreditMeter::sweep_expired`] (and lazily by the owning user's next `reserve`).

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use std::sync::Arc;
use uuid::Uuid;

use crate::decision::ActionKind;
use crate::error::{CreditError, StoreError};
use crate::shared::{Clock, CreditConfig, Plan};
use crate::store::{scope, LedgerEntry, LedgerOutcome, LedgerStore, SledStore};

const DAY_MS: i64 = 24 * 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub plan: Plan,
    /// Remaining total balance. `None` = unlimited.
    pub balance: Option<u64>,
    pub window_start_ms: i64,
    pub committed_in_window: u64,
    /// Sum of outstanding reservations.
    pub held: u64,
}

impl Account {
    fn roll_window(&mut self, now_ms: i64) {
        if now_ms - self.window_start_ms >= DAY_MS {
            self.window_start_ms = now_ms;
            self.committed_in_window = 0;
        }
    }

    /// Largest cost that both caps still admit.
    fn available(&self, daily_allowance: u64) -> u64 {
        let daily = daily_allowance.saturating_sub(self.committed_in_window + self.held);
        match self.balance {
            Some(balance) => daily.min(balance.saturating_sub(self.held)),
            None => daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub action: ActionKind,
    pub amount: u64,
    pub created_ms: i64,
    pub expires_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveOutcome {
    pub allowed: bool,
    pub reservation_id: Option<String>,
    /// Maximum cost reserved (or that would have been).
    pub cost: u64,
    /// Capacity left before this reservation.
    pub available: u64,
}

/// Point-in-time view of an account for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSnapshot {
    pub plan: Plan,
    pub balance: Option<u64>,
    pub daily_allowance: u64,
    pub used_today: u64,
    pub held: u64,
    pub available: u64,
}

/// Result of settling a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Charged(u64),
    Expired,
}

type TxResult<T> = Result<T, ConflictableTransactionError<CreditError>>;

fn abort<T>(err: CreditError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> TxResult<T> {
    serde_json::from_slice(bytes).or_else(|e| abort(CreditError::Store(StoreError::Serde(e))))
}

fn encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    serde_json::to_vec(value).or_else(|e| abort(CreditError::Store(StoreError::Serde(e))))
}

fn flatten(err: TransactionError<CreditError>) -> CreditError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => CreditError::Store(StoreError::Sled(e)),
    }
}

fn load_account(accounts: &TransactionalTree, user_id: &str) -> TxResult<Option<Account>> {
    match accounts.get(user_id.as_bytes())? {
        Some(bytes) => decode(&bytes).map(Some),
        None => Ok(None),
    }
}

pub struct CreditMeter {
    store: Arc<SledStore>,
    config: CreditConfig,
    clock: Arc<dyn Clock>,
}

impl CreditMeter {
    pub fn new(store: Arc<SledStore>, config: CreditConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    fn fresh_account(&self, user_id: &str, plan: Plan) -> Account {
        Account {
            user_id: user_id.to_string(),
            plan,
            balance: self.config.limits(plan).balance,
            window_start_ms: self.clock.now_ms(),
            committed_in_window: 0,
            held: 0,
        }
    }

    /// Returns the user's account, creating it on `plan` if it does not exist yet.
    pub fn open_account(&self, user_id: &str, plan: Plan) -> Result<Account, CreditError> {
        let fresh = self.fresh_account(user_id, plan);
        let bytes = serde_json::to_vec(&fresh).map_err(StoreError::from)?;
        let accounts = self.store.accounts();
        match accounts
            .compare_and_swap(user_id.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(StoreError::from)?
        {
            Ok(()) => {
                tracing::info!(target: "fundr::credit", user_id = %user_id, plan = plan.as_str(), "account opened");
                Ok(fresh)
            }
            Err(existing) => match existing.current {
                Some(current) => Ok(serde_json::from_slice(&current).map_err(StoreError::from)?),
                None => Ok(fresh),
            },
        }
    }

    /// Moves an account to another plan. Switching to a plan with a finite balance
    /// from an unlimited one grants that plan's starting balance.
    pub fn set_plan(&self, user_id: &str, plan: Plan) -> Result<Account, CreditError> {
        let plan_balance = self.config.limits(plan).balance;
        let updated = self
            .store
            .accounts()
            .transaction(|accounts| {
                let mut account = match load_account(accounts, user_id)? {
                    Some(account) => account,
                    None => self.fresh_account(user_id, plan),
                };
                account.balance = match (plan_balance, account.balance) {
                    (None, _) => None,
                    (Some(granted), None) => Some(granted),
                    (Some(_), Some(current)) => Some(current),
                };
                account.plan = plan;
                accounts.insert(user_id.as_bytes(), encode(&account)?)?;
                Ok(account)
            })
            .map_err(flatten)?;
        tracing::info!(target: "fundr::credit", user_id = %user_id, plan = plan.as_str(), "plan changed");
        Ok(updated)
    }

    pub fn balance(&self, user_id: &str) -> Result<Option<CreditSnapshot>, CreditError> {
        let Some(bytes) = self.store.accounts().get(user_id.as_bytes()).map_err(StoreError::from)? else {
            return Ok(None);
        };
        let mut account: Account = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        account.roll_window(self.clock.now_ms());
        let daily_allowance = self.config.limits(account.plan).daily_allowance;
        Ok(Some(CreditSnapshot {
            plan: account.plan,
            balance: account.balance,
            daily_allowance,
            used_today: account.committed_in_window,
            held: account.held,
            available: account.available(daily_allowance),
        }))
    }

    /// Maximum cost of `action` for the user's current plan.
    pub fn cost_of(&self, plan: Plan, action: ActionKind) -> u64 {
        self.config.limits(plan).cost_of(action)
    }

    /// Places a hold for the action's maximum cost if both the daily allowance and
    /// the balance admit it. A user without an account is metered on the free plan.
    pub fn reserve(&self, user_id: &str, action: ActionKind) -> Result<ReserveOutcome, CreditError> {
        self.release_expired(Some(user_id))?;

        let now = self.clock.now_ms();
        // The id doubles as the key, so a user's holds sit under one prefix.
        let reservation_id = format!("{}{}", scope(user_id), Uuid::new_v4().simple());
        let ttl_ms = self.config.reservation_ttl_secs as i64 * 1_000;

        let outcome = (self.store.accounts(), self.store.reservations())
            .transaction(|(accounts, reservations)| {
                let mut account = match load_account(accounts, user_id)? {
                    Some(account) => account,
                    None => self.fresh_account(user_id, Plan::Free),
                };
                account.roll_window(now);
                let limits = self.config.limits(account.plan);
                let cost = limits.cost_of(action);
                let available = account.available(limits.daily_allowance);

                if cost > available {
                    return Ok(ReserveOutcome {
                        allowed: false,
                        reservation_id: None,
                        cost,
                        available,
                    });
                }

                account.held += cost;
                let reservation = Reservation {
                    id: reservation_id.clone(),
                    user_id: user_id.to_string(),
                    action,
                    amount: cost,
                    created_ms: now,
                    expires_ms: now + ttl_ms,
                };
                accounts.insert(user_id.as_bytes(), encode(&account)?)?;
                reservations.insert(reservation_id.as_bytes(), encode(&reservation)?)?;
                Ok(ReserveOutcome {
                    allowed: true,
                    reservation_id: Some(reservation_id.clone()),
                    cost,
                    available,
                })
            })
            .map_err(flatten)?;

        if outcome.allowed {
            tracing::info!(
                target: "fundr::credit",
                user_id = %user_id,
                action = %action,
                reservation_id = %reservation_id,
                cost = outcome.cost,
                "credit reserved"
            );
        } else {
            tracing::info!(
                target: "fundr::credit",
                user_id = %user_id,
                action = %action,
                cost = outcome.cost,
                available = outcome.available,
                "reservation denied"
            );
        }
        Ok(outcome)
    }

    /// Removes the hold and charges at most its amount. `release_only` charges nothing.
    fn settle(&self, reservation_id: &str, actual_cost: u64, release_only: bool) -> Result<(Reservation, Settlement), CreditError> {
        let now = self.clock.now_ms();
        (self.store.accounts(), self.store.reservations())
            .transaction(|(accounts, reservations)| {
                let Some(bytes) = reservations.get(reservation_id.as_bytes())? else {
                    return abort(CreditError::UnknownReservation(reservation_id.to_string()));
                };
                let reservation: Reservation = decode(&bytes)?;
                let expired = !release_only && now > reservation.expires_ms;
                let charged = if release_only || expired {
                    0
                } else {
                    actual_cost.min(reservation.amount)
                };

                if let Some(mut account) = load_account(accounts, &reservation.user_id)? {
                    account.roll_window(now);
                    account.held = account.held.saturating_sub(reservation.amount);
                    account.committed_in_window += charged;
                    account.balance = account.balance.map(|b| b.saturating_sub(charged));
                    accounts.insert(reservation.user_id.as_bytes(), encode(&account)?)?;
                }
                reservations.remove(reservation_id.as_bytes())?;

                let settlement = if expired {
                    Settlement::Expired
                } else {
                    Settlement::Charged(charged)
                };
                Ok((reservation, settlement))
            })
            .map_err(flatten)
    }

    fn append_ledger(&self, reservation: &Reservation, committed: u64, outcome: LedgerOutcome) -> Result<(), CreditError> {
        self.store.append(&LedgerEntry {
            user_id: reservation.user_id.clone(),
            reservation_id: reservation.id.clone(),
            action: reservation.action,
            reserved: reservation.amount,
            committed,
            outcome,
            timestamp_ms: self.clock.now_ms(),
        })?;
        Ok(())
    }

    /// Finalizes a reservation at `actual_cost` (capped at the reserved amount).
    /// A reservation past its expiry is released instead and reported as unknown.
    pub fn commit(&self, reservation_id: &str, actual_cost: u64) -> Result<u64, CreditError> {
        let (reservation, settlement) = self.settle(reservation_id, actual_cost, false)?;
        match settlement {
            Settlement::Charged(charged) => {
                self.append_ledger(&reservation, charged, LedgerOutcome::Committed)?;
                tracing::info!(
                    target: "fundr::credit",
                    user_id = %reservation.user_id,
                    reservation_id = %reservation_id,
                    reserved = reservation.amount,
                    committed = charged,
                    "credit committed"
                );
                Ok(charged)
            }
            Settlement::Expired => {
                self.append_ledger(&reservation, 0, LedgerOutcome::Expired)?;
                tracing::warn!(
                    target: "fundr::credit",
                    user_id = %reservation.user_id,
                    reservation_id = %reservation_id,
                    "commit after expiry, hold released"
                );
                Err(CreditError::UnknownReservation(reservation_id.to_string()))
            }
        }
    }

    /// Refunds a reservation in full.
    pub fn release(&self, reservation_id: &str) -> Result<(), CreditError> {
        let (reservation, _) = self.settle(reservation_id, 0, true)?;
        self.append_ledger(&reservation, 0, LedgerOutcome::Released)?;
        tracing::info!(
            target: "fundr::credit",
            user_id = %reservation.user_id,
            reservation_id = %reservation_id,
            "credit released"
        );
        Ok(())
    }

    fn release_expired(&self, user_id: Option<&str>) -> Result<usize, CreditError> {
        let now = self.clock.now_ms();
        let mut expired = Vec::new();
        let rows = match user_id {
            Some(user_id) => self.store.reservations().scan_prefix(scope(user_id).as_bytes()),
            None => self.store.reservations().iter(),
        };
        for item in rows {
            let (_, bytes) = item.map_err(StoreError::from)?;
            let reservation: Reservation = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
            if reservation.expires_ms < now {
                expired.push(reservation.id);
            }
        }

        let mut released = 0;
        for id in expired {
            match self.settle(&id, 0, true) {
                Ok((reservation, _)) => {
                    self.append_ledger(&reservation, 0, LedgerOutcome::Expired)?;
                    tracing::warn!(
                        target: "fundr::credit",
                        user_id = %reservation.user_id,
                        reservation_id = %id,
                        amount = reservation.amount,
                        "expired reservation auto-released"
                    );
                    released += 1;
                }
                // Settled concurrently.
                Err(CreditError::UnknownReservation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Auto-releases every reservation past its expiry. Returns how many were released.
    pub fn sweep_expired(&self) -> Result<usize, CreditError> {
        self.release_expired(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ManualClock;

    fn meter() -> (CreditMeter, Arc<ManualClock>, Arc<SledStore>) {
        let store = Arc::new(SledStore::temporary().unwrap());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let meter = CreditMeter::new(store.clone(), CreditConfig::default(), clock.clone());
        (meter, clock, store)
    }

    #[test]
    fn reserve_commit_charges_actual_cost() {
        let (meter, _, store) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        assert!(r.allowed);
        assert_eq!(r.cost, 50);
        let charged = meter.commit(r.reservation_id.as_deref().unwrap(), 0).unwrap();
        assert_eq!(charged, 0);

        let snap = meter.balance("u1").unwrap().unwrap();
        assert_eq!(snap.used_today, 0);
        assert_eq!(snap.held, 0);
        assert_eq!(snap.balance, Some(200));

        let ledger = store.entries_since("u1", 0).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].reserved, 50);
        assert_eq!(ledger[0].committed, 0);
    }

    #[test]
    fn daily_allowance_blocks_second_search() {
        let (meter, _, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        meter.commit(r.reservation_id.as_deref().unwrap(), 50).unwrap();
        let second = meter.reserve("u1", ActionKind::Mentor).unwrap();
        assert!(!second.allowed);
        assert_eq!(second.available, 0);
    }

    #[test]
    fn outstanding_holds_count_against_caps() {
        let (meter, _, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let first = meter.reserve("u1", ActionKind::SearchCompanies).unwrap();
        let second = meter.reserve("u1", ActionKind::SearchCompanies).unwrap();
        let third = meter.reserve("u1", ActionKind::Mentor).unwrap();
        assert!(first.allowed && second.allowed);
        assert!(!third.allowed);
    }

    #[test]
    fn window_resets_after_a_day() {
        let (meter, clock, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        meter.commit(r.reservation_id.as_deref().unwrap(), 50).unwrap();
        clock.advance_hours(23);
        assert!(!meter.reserve("u1", ActionKind::SearchCompanies).unwrap().allowed);
        clock.advance_hours(1);
        assert!(meter.reserve("u1", ActionKind::SearchCompanies).unwrap().allowed);
    }

    #[test]
    fn balance_cap_is_independent_of_daily_cap() {
        let (meter, clock, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        for _ in 0..4 {
            let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
            assert!(r.allowed);
            meter.commit(r.reservation_id.as_deref().unwrap(), 50).unwrap();
            clock.advance_hours(25);
        }
        let snap = meter.balance("u1").unwrap().unwrap();
        assert_eq!(snap.balance, Some(0));
        assert!(!meter.reserve("u1", ActionKind::Mentor).unwrap().allowed);
    }

    #[test]
    fn release_refunds_and_unknown_is_error() {
        let (meter, _, store) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        let id = r.reservation_id.unwrap();
        meter.release(&id).unwrap();
        assert_eq!(meter.balance("u1").unwrap().unwrap().held, 0);
        assert!(matches!(meter.release(&id), Err(CreditError::UnknownReservation(_))));
        assert_eq!(store.entries_since("u1", 0).unwrap()[0].outcome, LedgerOutcome::Released);
    }

    #[test]
    fn expired_holds_are_swept() {
        let (meter, clock, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        clock.advance_ms(301_000);
        assert_eq!(meter.sweep_expired().unwrap(), 1);
        assert_eq!(meter.balance("u1").unwrap().unwrap().held, 0);
        assert!(matches!(
            meter.commit(r.reservation_id.as_deref().unwrap(), 50),
            Err(CreditError::UnknownReservation(_))
        ));
    }

    #[test]
    fn reserve_only_sweeps_the_requesting_users_holds() {
        let (meter, clock, store) = meter();
        for user in ["u", "u/x"] {
            meter.open_account(user, Plan::Free).unwrap();
            assert!(meter.reserve(user, ActionKind::SearchInvestors).unwrap().allowed);
        }
        clock.advance_ms(301_000);
        assert!(meter.reserve("u", ActionKind::SearchInvestors).unwrap().allowed);
        assert_eq!(meter.balance("u/x").unwrap().unwrap().held, 50);
        assert!(store.entries_since("u/x", 0).unwrap().is_empty());
        assert_eq!(meter.sweep_expired().unwrap(), 1);
        assert_eq!(meter.balance("u/x").unwrap().unwrap().held, 0);
    }

    #[test]
    fn late_commit_releases_instead_of_charging() {
        let (meter, clock, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        clock.advance_ms(301_000);
        assert!(meter.commit(r.reservation_id.as_deref().unwrap(), 50).is_err());
        let snap = meter.balance("u1").unwrap().unwrap();
        assert_eq!(snap.held, 0);
        assert_eq!(snap.used_today, 0);
    }

    #[test]
    fn reserve_sweeps_own_expired_holds_first() {
        let (meter, clock, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        assert!(meter.reserve("u1", ActionKind::SearchInvestors).unwrap().allowed);
        assert!(!meter.reserve("u1", ActionKind::SearchInvestors).unwrap().allowed);
        clock.advance_ms(301_000);
        assert!(meter.reserve("u1", ActionKind::SearchInvestors).unwrap().allowed);
    }

    #[test]
    fn set_plan_changes_costs_not_logic() {
        let (meter, _, _) = meter();
        meter.open_account("u1", Plan::Free).unwrap();
        let account = meter.set_plan("u1", Plan::Pro).unwrap();
        assert_eq!(account.balance, None);
        let r = meter.reserve("u1", ActionKind::SearchInvestors).unwrap();
        assert_eq!(r.cost, 20);
        let account = meter.set_plan("u1", Plan::Free).unwrap();
        assert_eq!(account.balance, Some(200));
    }

    #[test]
    fn concurrent_reservations_never_exceed_allowance() {
        let (meter, _, store) = meter();
        let meter = Arc::new(meter);
        meter.open_account("u1", Plan::Free).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let meter = meter.clone();
                std::thread::spawn(move || {
                    let r = meter.reserve("u1", ActionKind::SearchCompanies).unwrap();
                    if let Some(id) = r.reservation_id {
                        meter.commit(&id, 25).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let committed: u64 = store.entries_since("u1", 0).unwrap().iter().map(|e| e.committed).sum();
        assert_eq!(committed, 50);
    }
}
