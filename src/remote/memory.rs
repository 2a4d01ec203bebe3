//! In-process record store and identity service.
//!
//! Both are thread-safe and count their calls. The store can inject the
//! failures seen against the hosted backend: rejected inserts, inserts that
//! commit but report an error, rows that stay invisible for a few reads, and
//! a full outage. `stage_concurrent_reads` holds the next N readers until all
//! of them have read, which reproduces the lost-update interleaving on demand.

use super::{IdentityService, RecordStore, RemoteError, RemoteResult};
use crate::model::{Session, SignIn, SignUp};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted outcome for one upcoming insert
#[derive(Debug, Clone)]
pub enum InsertFault {
    /// Fail without storing anything
    Reject(RemoteError),
    /// Store the row, then report the error anyway
    CommitThenFail(RemoteError),
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: usize,
    pub inserts: usize,
    pub updates: usize,
    pub increments: usize,
}

impl StoreStats {
    /// Calls that could have mutated a row
    pub fn writes(&self) -> usize {
        self.inserts + self.updates + self.increments
    }
}

#[derive(Default)]
struct Faults {
    inserts: VecDeque<InsertFault>,
    hidden: HashMap<String, u32>,
    hide_new_rows: Option<u32>,
    unavailable: bool,
}

struct Rendezvous {
    barrier: Arc<Barrier>,
    remaining: usize,
}

pub struct MemoryStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    faults: Mutex<Faults>,
    stats: Mutex<StoreStats>,
    rendezvous: Mutex<Option<Rendezvous>>,
    supports_increment: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            stats: Mutex::new(StoreStats::default()),
            rendezvous: Mutex::new(None),
            supports_increment: true,
        }
    }

    /// A store without server-side increment
    pub fn without_increment() -> Self {
        Self {
            supports_increment: false,
            ..Self::new()
        }
    }

    /// Put a row directly, bypassing faults and counters
    pub fn seed(&self, table: &str, record: Value) {
        if let Some(id) = record["id"].as_str() {
            lock(&self.tables)
                .entry(table.to_string())
                .or_default()
                .insert(id.to_string(), record.clone());
        }
    }

    /// Read a row directly, bypassing faults and counters
    pub fn peek(&self, table: &str, id: &str) -> Option<Value> {
        lock(&self.tables).get(table)?.get(id).cloned()
    }

    pub fn stats(&self) -> StoreStats {
        *lock(&self.stats)
    }

    /// Script the outcome of the next insert; faults queue in order
    pub fn push_insert_fault(&self, fault: InsertFault) {
        lock(&self.faults).inserts.push_back(fault);
    }

    /// Make `id` invisible to the next `reads` gets
    pub fn hide_from_reads(&self, id: &str, reads: u32) {
        lock(&self.faults).hidden.insert(id.to_string(), reads);
    }

    /// Rows inserted from now on stay invisible to their next `reads` gets
    pub fn hide_new_rows_from_reads(&self, reads: u32) {
        lock(&self.faults).hide_new_rows = Some(reads);
    }

    /// Fail every call with `Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.faults).unavailable = unavailable;
    }

    /// Hold the next `parties` gets until all of them have read
    pub fn stage_concurrent_reads(&self, parties: usize) {
        *lock(&self.rendezvous) = Some(Rendezvous {
            barrier: Arc::new(Barrier::new(parties)),
            remaining: parties,
        });
    }

    fn check_available(&self) -> RemoteResult<()> {
        if lock(&self.faults).unavailable {
            return Err(RemoteError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn wait_for_rendezvous(&self) {
        let barrier = {
            let mut slot = lock(&self.rendezvous);
            match slot.as_mut() {
                Some(r) => {
                    r.remaining -= 1;
                    let barrier = Arc::clone(&r.barrier);
                    if r.remaining == 0 {
                        *slot = None;
                    }
                    Some(barrier)
                }
                None => None,
            }
        };
        if let Some(barrier) = barrier {
            barrier.wait();
        }
    }

    fn row_matches(row: &Value, expected: &Map<String, Value>) -> bool {
        expected
            .iter()
            .all(|(field, value)| row.get(field).unwrap_or(&Value::Null) == value)
    }

    fn apply(row: &mut Value, fields: &Map<String, Value>) {
        if let Some(obj) = row.as_object_mut() {
            for (field, value) in fields {
                obj.insert(field.clone(), value.clone());
            }
        }
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, table: &str, id: &str) -> RemoteResult<Option<Value>> {
        lock(&self.stats).gets += 1;
        self.check_available()?;

        let hidden = {
            let mut faults = lock(&self.faults);
            match faults.hidden.get_mut(id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        let row = if hidden {
            None
        } else {
            self.peek(table, id)
        };
        self.wait_for_rendezvous();
        Ok(row)
    }

    fn insert(&self, table: &str, record: &Value) -> RemoteResult<Value> {
        lock(&self.stats).inserts += 1;
        self.check_available()?;

        let id = record["id"]
            .as_str()
            .ok_or_else(|| RemoteError::Rejected {
                status: 400,
                body: "record has no id".to_string(),
            })?
            .to_string();

        let fault = lock(&self.faults).inserts.pop_front();
        let fail_after_commit = match fault {
            Some(InsertFault::Reject(err)) => return Err(err),
            Some(InsertFault::CommitThenFail(err)) => Some(err),
            None => None,
        };

        {
            let mut tables = lock(&self.tables);
            let rows = tables.entry(table.to_string()).or_default();
            if rows.contains_key(&id) {
                return Err(RemoteError::Conflict(format!(
                    "duplicate key value violates unique constraint on {}.id",
                    table
                )));
            }
            rows.insert(id.clone(), record.clone());
        }

        {
            let mut faults = lock(&self.faults);
            if let Some(reads) = faults.hide_new_rows {
                faults.hidden.insert(id, reads);
            }
        }

        match fail_after_commit {
            Some(err) => Err(err),
            None => Ok(record.clone()),
        }
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        self.update_if(table, id, &Map::new(), fields)
    }

    fn update_if(
        &self,
        table: &str,
        id: &str,
        expected: &Map<String, Value>,
        fields: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        lock(&self.stats).updates += 1;
        self.check_available()?;

        let mut tables = lock(&self.tables);
        let row = match tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) => row,
            None => return Ok(None),
        };
        if !Self::row_matches(row, expected) {
            return Ok(None);
        }
        Self::apply(row, fields);
        Ok(Some(row.clone()))
    }

    fn increment(
        &self,
        table: &str,
        id: &str,
        deltas: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        lock(&self.stats).increments += 1;
        if !self.supports_increment {
            return Err(RemoteError::Unsupported("increment".to_string()));
        }
        self.check_available()?;

        let mut tables = lock(&self.tables);
        let row = match tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut sums = Map::new();
        for (field, delta) in deltas {
            let current = row.get(field).and_then(Value::as_u64).unwrap_or(0);
            let delta = delta.as_u64().ok_or_else(|| RemoteError::Rejected {
                status: 400,
                body: format!("{} delta is not a non-negative integer", field),
            })?;
            let sum = current.checked_add(delta).ok_or_else(|| RemoteError::Rejected {
                status: 400,
                body: format!("{} out of range", field),
            })?;
            sums.insert(field.clone(), Value::from(sum));
        }
        Self::apply(row, &sums);
        Ok(Some(row.clone()))
    }

    fn count(&self, table: &str) -> RemoteResult<u64> {
        self.check_available()?;
        Ok(lock(&self.tables)
            .get(table)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

struct IdentityRecord {
    id: String,
    password: String,
}

/// In-process identity service keyed by email
#[derive(Default)]
pub struct MemoryIdentity {
    accounts: Mutex<HashMap<String, IdentityRecord>>,
    unavailable: Mutex<bool>,
    sign_ups: Mutex<usize>,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity directly and return its id
    pub fn seed(&self, email: &str, password: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        lock(&self.accounts).insert(
            email.to_lowercase(),
            IdentityRecord {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        id
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    /// Sign-up calls received, successful or not
    pub fn sign_up_calls(&self) -> usize {
        *lock(&self.sign_ups)
    }

    fn check_available(&self) -> RemoteResult<()> {
        if *lock(&self.unavailable) {
            return Err(RemoteError::Unavailable("identity service offline".to_string()));
        }
        Ok(())
    }
}

impl IdentityService for MemoryIdentity {
    fn sign_up(&self, email: &str, password: &str) -> RemoteResult<SignUp> {
        *lock(&self.sign_ups) += 1;
        self.check_available()?;

        let key = email.to_lowercase();
        let mut accounts = lock(&self.accounts);
        if accounts.contains_key(&key) {
            return Err(RemoteError::Conflict("User already registered".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        accounts.insert(
            key,
            IdentityRecord {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        Ok(SignUp { id })
    }

    fn sign_in(&self, email: &str, password: &str) -> RemoteResult<SignIn> {
        self.check_available()?;

        let accounts = lock(&self.accounts);
        match accounts.get(&email.to_lowercase()) {
            Some(record) if record.password == password => Ok(SignIn {
                id: record.id.clone(),
                session: Session {
                    access_token: uuid::Uuid::new_v4().to_string(),
                    refresh_token: Some(uuid::Uuid::new_v4().to_string()),
                    token_type: "bearer".to_string(),
                    expires_in: Some(3600),
                },
            }),
            _ => Err(RemoteError::InvalidCredentials),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_then_get() {
        let store = MemoryStore::new();
        store.insert("users", &json!({"id": "u1", "xp": 0})).unwrap();
        assert_eq!(
            store.get("users", "u1").unwrap(),
            Some(json!({"id": "u1", "xp": 0}))
        );
        assert_eq!(store.get("users", "u2").unwrap(), None);
        assert_eq!(store.count("users").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        store.insert("users", &json!({"id": "u1"})).unwrap();
        let err = store.insert("users", &json!({"id": "u1"})).unwrap_err();
        assert!(matches!(err, RemoteError::Conflict(_)));
    }

    #[test]
    fn test_commit_then_fail_stores_row() {
        let store = MemoryStore::new();
        store.push_insert_fault(InsertFault::CommitThenFail(RemoteError::Unavailable(
            "timeout".to_string(),
        )));
        assert!(store.insert("users", &json!({"id": "u1"})).is_err());
        assert!(store.peek("users", "u1").is_some());
    }

    #[test]
    fn test_hidden_rows_reappear() {
        let store = MemoryStore::new();
        store.seed("users", json!({"id": "u1"}));
        store.hide_from_reads("u1", 2);
        assert_eq!(store.get("users", "u1").unwrap(), None);
        assert_eq!(store.get("users", "u1").unwrap(), None);
        assert!(store.get("users", "u1").unwrap().is_some());
    }

    #[test]
    fn test_new_rows_hidden_after_insert() {
        let store = MemoryStore::new();
        store.hide_new_rows_from_reads(1);
        store.insert("users", &json!({"id": "u1"})).unwrap();
        assert!(store.peek("users", "u1").is_some());
        assert_eq!(store.get("users", "u1").unwrap(), None);
        assert!(store.get("users", "u1").unwrap().is_some());
    }

    #[test]
    fn test_update_if_guard() {
        let store = MemoryStore::new();
        store.seed("users", json!({"id": "u1", "xp": 10}));
        let stale = store
            .update_if("users", "u1", &fields(json!({"xp": 5})), &fields(json!({"xp": 20})))
            .unwrap();
        assert_eq!(stale, None);
        let fresh = store
            .update_if("users", "u1", &fields(json!({"xp": 10})), &fields(json!({"xp": 20})))
            .unwrap();
        assert_eq!(fresh.unwrap()["xp"], 20);
        assert_eq!(store.stats().updates, 2);
    }

    #[test]
    fn test_update_if_null_guard_matches_absent_field() {
        let store = MemoryStore::new();
        store.seed("users", json!({"id": "u1", "xp": 0, "bonus": null}));
        let guard = fields(json!({"coins": null, "bonus": null}));
        let written = store
            .update_if("users", "u1", &guard, &fields(json!({"coins": 10})))
            .unwrap();
        assert_eq!(written.unwrap()["coins"], 10);

        let stale = store
            .update_if("users", "u1", &guard, &fields(json!({"coins": 20})))
            .unwrap();
        assert_eq!(stale, None);
    }

    #[test]
    fn test_increment() {
        let store = MemoryStore::new();
        store.seed("users", json!({"id": "u1", "xp": 10, "coins": 1}));
        let row = store
            .increment("users", "u1", &fields(json!({"xp": 5, "coins": 2})))
            .unwrap()
            .unwrap();
        assert_eq!(row["xp"], 15);
        assert_eq!(row["coins"], 3);

        let plain = MemoryStore::without_increment();
        assert!(matches!(
            plain.increment("users", "u1", &Map::new()),
            Err(RemoteError::Unsupported(_))
        ));
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("users", "u1"),
            Err(RemoteError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("users", "u1").is_ok());
    }

    #[test]
    fn test_identity_sign_up_and_sign_in() {
        let identity = MemoryIdentity::new();
        let created = identity.sign_up("Ana@Example.com", "secret").unwrap();
        assert!(matches!(
            identity.sign_up("ana@example.com", "other"),
            Err(RemoteError::Conflict(_))
        ));
        let signed_in = identity.sign_in("ana@example.com", "secret").unwrap();
        assert_eq!(signed_in.id, created.id);
        assert_eq!(
            identity.sign_in("ana@example.com", "wrong").unwrap_err(),
            RemoteError::InvalidCredentials
        );
        assert_eq!(identity.sign_up_calls(), 2);
    }
}
