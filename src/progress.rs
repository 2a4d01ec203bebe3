//! XP/coin update protocol.
//!
//! `apply_xp_delta` adds earned XP and coins to a profile row and rewrites
//! its level from the resulting XP. The level is never derived from the
//! delta, so a row whose XP was changed out-of-band is corrected on its next
//! update.
//!
//! In `ReadModifyWrite` mode concurrent updates of the same user are not
//! serialized: two callers that read the same row both write `read + delta`,
//! and one increment is lost. `CompareAndSwap` detects that case and re-reads;
//! `AtomicIncrement` leaves the addition to the store.
//!
//! Remote failures are returned as-is; this module never retries a failed
//! remote call.

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::level::level_for_xp;
use crate::model::{ProgressDelta, UserAccount};
use crate::remote::{RecordStore, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Default profile table
pub const USERS_TABLE: &str = "users";

/// How the new totals reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Fetch, add, write back; last writer wins
    #[default]
    ReadModifyWrite,
    /// Write guarded by the values read; re-read on mismatch
    CompareAndSwap,
    /// Server-side addition
    AtomicIncrement,
}

impl WriteMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read-modify-write" | "read_modify_write" | "rmw" => Some(Self::ReadModifyWrite),
            "compare-and-swap" | "compare_and_swap" | "cas" => Some(Self::CompareAndSwap),
            "atomic-increment" | "atomic_increment" | "atomic" => Some(Self::AtomicIncrement),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadModifyWrite => "read-modify-write",
            Self::CompareAndSwap => "compare-and-swap",
            Self::AtomicIncrement => "atomic-increment",
        }
    }
}

pub struct ProgressUpdater<S> {
    store: S,
    table: String,
    mode: WriteMode,
    cas_max_attempts: u32,
    journal: Arc<Journal>,
}

impl<S: RecordStore> ProgressUpdater<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            table: USERS_TABLE.to_string(),
            mode: WriteMode::default(),
            cas_max_attempts: 5,
            journal: Arc::new(Journal::disabled()),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Guard failures tolerated in `CompareAndSwap` mode (at least one attempt)
    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.cas_max_attempts = attempts.max(1);
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Add `delta` to the user's XP and coins and recompute the level.
    ///
    /// Returns the row as the store reports it after the write.
    /// Fails with `NotFound` (and writes nothing) when the row is absent and
    /// with `StoreUnavailable` when a remote call fails.
    pub fn apply_xp_delta(&self, user_id: &str, delta: ProgressDelta) -> Result<UserAccount> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user id must not be empty".to_string()));
        }

        let result = match self.mode {
            WriteMode::ReadModifyWrite => self.read_modify_write(user_id, delta),
            WriteMode::CompareAndSwap => self.compare_and_swap(user_id, delta),
            WriteMode::AtomicIncrement => self.atomic_increment(user_id, delta),
        };

        let summary = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        self.journal.outcome("apply_xp_delta", user_id, &summary);
        result
    }

    fn read_modify_write(&self, user_id: &str, delta: ProgressDelta) -> Result<UserAccount> {
        let current = self.fetch(user_id)?;
        let fields = next_totals(&current, delta)?;
        let written = self
            .store
            .update(&self.table, user_id, &fields)
            .map_err(Error::StoreUnavailable)?
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        self.written(user_id, written)
    }

    fn compare_and_swap(&self, user_id: &str, delta: ProgressDelta) -> Result<UserAccount> {
        for attempt in 1..=self.cas_max_attempts {
            let row = self.fetch_row(user_id)?;
            let expected = guard_fields(&row, &["xp", "coins"]);
            let current = decode(row)?;
            let fields = next_totals(&current, delta)?;

            match self
                .store
                .update_if(&self.table, user_id, &expected, &fields)
                .map_err(Error::StoreUnavailable)?
            {
                Some(written) => return self.written(user_id, written),
                None => self.journal.write_conflict(user_id, attempt),
            }
        }

        Err(Error::Contention {
            attempts: self.cas_max_attempts,
        })
    }

    fn atomic_increment(&self, user_id: &str, delta: ProgressDelta) -> Result<UserAccount> {
        let mut deltas = Map::new();
        deltas.insert("xp".to_string(), Value::from(delta.xp));
        deltas.insert("coins".to_string(), Value::from(delta.coins));

        let row = self
            .store
            .increment(&self.table, user_id, &deltas)
            .map_err(Error::StoreUnavailable)?
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        let account = self.written(user_id, row)?;

        let level = level_for_xp(account.xp);
        if account.level == level {
            return Ok(account);
        }

        // Guarded on xp so a fix-up computed from an older total cannot
        // overwrite the level written for a newer one.
        let mut expected = Map::new();
        expected.insert("xp".to_string(), Value::from(account.xp));
        let mut fields = Map::new();
        fields.insert("level".to_string(), Value::from(level));

        match self
            .store
            .update_if(&self.table, user_id, &expected, &fields)
            .map_err(Error::StoreUnavailable)?
        {
            Some(fixed) => {
                self.journal.level_fixup(user_id, account.xp, level, true);
                decode(fixed)
            }
            None => {
                self.journal.level_fixup(user_id, account.xp, level, false);
                self.fetch(user_id)
            }
        }
    }

    fn fetch(&self, user_id: &str) -> Result<UserAccount> {
        decode(self.fetch_row(user_id)?)
    }

    fn fetch_row(&self, user_id: &str) -> Result<Value> {
        let row = self
            .store
            .get(&self.table, user_id)
            .map_err(Error::StoreUnavailable)?;
        self.journal.fetched(user_id, row.is_some());
        row.ok_or_else(|| Error::NotFound(user_id.to_string()))
    }

    fn written(&self, user_id: &str, row: Value) -> Result<UserAccount> {
        let account = decode(row)?;
        self.journal.progress_written(
            user_id,
            self.mode.as_str(),
            account.xp,
            account.coins,
            account.level,
        );
        Ok(account)
    }
}

fn decode(row: Value) -> Result<UserAccount> {
    UserAccount::from_record(row)
        .map_err(|e| Error::StoreUnavailable(RemoteError::Decode(e.to_string())))
}

/// Guard values as stored; absent columns are expected to stay null
fn guard_fields(row: &Value, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .map(|field| {
            let value = row.get(*field).cloned().unwrap_or(Value::Null);
            (field.to_string(), value)
        })
        .collect()
}

/// Fields to write after adding `delta` to `current`
pub fn next_totals(current: &UserAccount, delta: ProgressDelta) -> Result<Map<String, Value>> {
    let xp = current
        .xp
        .checked_add(delta.xp)
        .ok_or_else(|| Error::InvalidInput("xp total out of range".to_string()))?;
    let coins = current
        .coins
        .checked_add(delta.coins)
        .ok_or_else(|| Error::InvalidInput("coin total out of range".to_string()))?;

    let mut fields = Map::new();
    fields.insert("xp".to_string(), Value::from(xp));
    fields.insert("coins".to_string(), Value::from(coins));
    fields.insert("level".to_string(), Value::from(level_for_xp(xp)));
    Ok(fields)
}
