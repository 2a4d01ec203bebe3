//! Account creation and lookup.
//!
//! Registration is two remote steps that are not transactionally linked:
//! sign-up creates the identity, then a default profile row is inserted
//! under the identity's id. The insert can race with the identity's
//! propagation, so it is retried with backoff; a last existence check
//! recovers rows that landed despite a failed insert. Sign-up itself is
//! never retried.

use crate::backoff::{jitter_rng, Backoff, CancelToken, Clock, Interrupt, Pacer, SystemClock};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::model::{LoginOutcome, NewProfile, Registration, UserAccount};
use crate::progress::USERS_TABLE;
use crate::remote::{IdentityService, RecordStore, RemoteError, RemoteResult};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern"));

/// Check a registration request before any remote call
pub fn validate_registration(request: &Registration) -> Result<()> {
    if request.username.trim().is_empty() {
        return Err(Error::InvalidInput("username must not be empty".to_string()));
    }
    if !EMAIL_RE.is_match(request.email.trim()) {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a valid email address",
            request.email
        )));
    }
    if request.password.is_empty() {
        return Err(Error::InvalidInput("password must not be empty".to_string()));
    }
    Ok(())
}

pub struct AccountService<I, S> {
    identity: I,
    store: S,
    table: String,
    backoff: Backoff,
    final_check_delay: Duration,
    deadline: Option<Duration>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    journal: Arc<Journal>,
}

impl<I: IdentityService, S: RecordStore> AccountService<I, S> {
    pub fn new(identity: I, store: S) -> Self {
        Self {
            identity,
            store,
            table: USERS_TABLE.to_string(),
            backoff: Backoff::default(),
            final_check_delay: Duration::from_millis(2000),
            deadline: Some(Duration::from_secs(15)),
            clock: Arc::new(SystemClock::new()),
            rng: Mutex::new(jitter_rng(None)),
            journal: Arc::new(Journal::disabled()),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_final_check_delay(mut self, delay: Duration) -> Self {
        self.final_check_delay = delay;
        self
    }

    /// Bound on the profile phase of registration; `None` waits out every attempt
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = Mutex::new(jitter_rng(seed));
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register an identity and create its default profile.
    ///
    /// Duplicate emails fail with `DuplicateAccount` before any insert.
    /// Profile inserts are retried per the backoff; if none succeeds but the
    /// row exists at the final check, that row is returned.
    pub fn create_account(
        &self,
        request: &Registration,
        cancel: &CancelToken,
    ) -> Result<UserAccount> {
        validate_registration(request)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let email = request.email.trim();
        let sign_up = match self.identity.sign_up(email, &request.password) {
            Ok(sign_up) => {
                self.journal.sign_up(email, "created");
                sign_up
            }
            Err(RemoteError::Conflict(_)) => {
                self.journal.sign_up(email, "duplicate");
                return Err(Error::DuplicateAccount);
            }
            Err(RemoteError::Rejected { body, .. }) => {
                self.journal.sign_up(email, "rejected");
                return Err(Error::InvalidInput(format!("registration rejected: {}", body)));
            }
            Err(e) => {
                self.journal.sign_up(email, "unavailable");
                return Err(Error::IdentityUnavailable(e));
            }
        };

        let profile = NewProfile::new(&sign_up.id, request.username.trim(), email);
        let result = self.create_profile(&profile, cancel);

        let summary = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        self.journal.outcome("create_account", &profile.id, &summary);
        result
    }

    fn create_profile(&self, profile: &NewProfile, cancel: &CancelToken) -> Result<UserAccount> {
        let pacer = Pacer::start(self.clock.as_ref(), cancel, self.deadline);
        let mut attempts = 0;
        let mut last_error = "no insert attempted".to_string();
        let mut timed_out = false;

        for attempt in 1..=self.backoff.max_attempts {
            let delay = self.next_delay(attempt);
            match pacer.wait(delay) {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Err(Error::Cancelled),
                Err(Interrupt::DeadlineExceeded) => {
                    timed_out = true;
                    break;
                }
            }
            self.journal
                .backoff_wait(&profile.id, attempt, delay.as_millis() as u64);

            attempts = attempt;
            match self.try_insert(profile) {
                Ok(account) => {
                    self.journal.insert_attempt(&profile.id, attempt, None);
                    return Ok(account);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.journal
                        .insert_attempt(&profile.id, attempt, Some(&message));
                    last_error = message;
                }
            }
        }

        // A deadline hit skips the pause and checks right away.
        if !timed_out {
            match pacer.wait(self.final_check_delay) {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Err(Error::Cancelled),
                Err(Interrupt::DeadlineExceeded) => timed_out = true,
            }
        }
        if pacer.check().is_err() {
            return Err(Error::Cancelled);
        }

        match self.store.get(&self.table, &profile.id) {
            Ok(Some(row)) => {
                self.journal.final_check(&profile.id, true);
                return decode(row).map_err(Error::StoreUnavailable);
            }
            Ok(None) => self.journal.final_check(&profile.id, false),
            Err(e) => {
                self.journal.final_check(&profile.id, false);
                last_error = e.to_string();
            }
        }

        if timed_out {
            Err(Error::TimedOut { attempts })
        } else {
            Err(Error::CreationFailed {
                attempts,
                last_error,
            })
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        self.backoff.delay(attempt, &mut *rng)
    }

    /// Insert a default profile; an existing row with the same id counts as success
    fn try_insert(&self, profile: &NewProfile) -> RemoteResult<UserAccount> {
        match self.store.insert(&self.table, &profile.to_record()) {
            Ok(row) => decode(row),
            Err(RemoteError::Conflict(detail)) => match self.store.get(&self.table, &profile.id)? {
                Some(row) => decode(row),
                None => Err(RemoteError::Conflict(detail)),
            },
            Err(e) => Err(e),
        }
    }

    /// Create a default profile for a known id without signing up
    pub fn ensure_profile(&self, profile: &NewProfile) -> Result<UserAccount> {
        if profile.id.trim().is_empty() {
            return Err(Error::InvalidInput("user id must not be empty".to_string()));
        }
        validate_registration(&Registration::new(&profile.username, &profile.email, "-"))?;
        let result = self.try_insert(profile).map_err(Error::StoreUnavailable);
        self.journal.insert_attempt(
            &profile.id,
            1,
            result.as_ref().err().map(|e| e.to_string()).as_deref(),
        );
        result
    }

    /// Sign in and load the profile.
    ///
    /// Bad credentials and an unreachable identity service are reported
    /// separately.
    pub fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(Error::InvalidInput(
                "email and password are required".to_string(),
            ));
        }

        let sign_in = self
            .identity
            .sign_in(email.trim(), password)
            .map_err(|e| match e {
                RemoteError::InvalidCredentials => Error::InvalidCredentials,
                other => Error::IdentityUnavailable(other),
            })?;
        let user = self.get_user(&sign_in.id)?;
        self.journal.outcome("login", &sign_in.id, "ok");
        Ok(LoginOutcome {
            user,
            session: sign_in.session,
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserAccount> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user id must not be empty".to_string()));
        }
        let row = self
            .store
            .get(&self.table, user_id)
            .map_err(Error::StoreUnavailable)?;
        self.journal.fetched(user_id, row.is_some());
        match row {
            Some(row) => decode(row).map_err(Error::StoreUnavailable),
            None => Err(Error::NotFound(user_id.to_string())),
        }
    }

    /// Rows in the profile table; doubles as a connectivity check
    pub fn count_users(&self) -> Result<u64> {
        self.store.count(&self.table).map_err(Error::StoreUnavailable)
    }
}

fn decode(row: Value) -> RemoteResult<UserAccount> {
    UserAccount::from_record(row).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ManualClock;
    use crate::remote::memory::{InsertFault, MemoryIdentity, MemoryStore};

    fn service(
        identity: Arc<MemoryIdentity>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    ) -> AccountService<Arc<MemoryIdentity>, Arc<MemoryStore>> {
        AccountService::new(identity, store)
            .with_backoff(Backoff {
                jitter: 0.0,
                ..Backoff::default()
            })
            .with_clock(clock)
    }

    #[test]
    fn test_validate_registration() {
        assert!(validate_registration(&Registration::new("ana", "ana@example.com", "pw")).is_ok());
        assert!(validate_registration(&Registration::new(" ", "ana@example.com", "pw")).is_err());
        assert!(validate_registration(&Registration::new("ana", "ana.example.com", "pw")).is_err());
        assert!(validate_registration(&Registration::new("ana", "ana@example", "pw")).is_err());
        assert!(validate_registration(&Registration::new("ana", "ana@example.com", "")).is_err());
    }

    #[test]
    fn test_create_account_first_try() {
        let identity = Arc::new(MemoryIdentity::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let accounts = service(identity, Arc::clone(&store), Arc::clone(&clock));

        let user = accounts
            .create_account(
                &Registration::new("ana", "ana@example.com", "secret"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(user.username, "ana");
        assert_eq!((user.xp, user.coins, user.level), (0, 0, 1));
        assert_eq!(store.stats().inserts, 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1000)]);
    }

    #[test]
    fn test_invalid_input_makes_no_remote_call() {
        let identity = Arc::new(MemoryIdentity::new());
        let store = Arc::new(MemoryStore::new());
        let accounts = service(
            Arc::clone(&identity),
            Arc::clone(&store),
            Arc::new(ManualClock::new()),
        );
        let err = accounts
            .create_account(&Registration::new("ana", "nope", "pw"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(identity.sign_up_calls(), 0);
        assert_eq!(store.stats().inserts, 0);
    }

    #[test]
    fn test_identity_outage_is_not_retried() {
        let identity = Arc::new(MemoryIdentity::new());
        identity.set_unavailable(true);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let accounts = service(Arc::clone(&identity), Arc::clone(&store), Arc::clone(&clock));

        let err = accounts
            .create_account(
                &Registration::new("ana", "ana@example.com", "pw"),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::IdentityUnavailable(_)));
        assert_eq!(identity.sign_up_calls(), 1);
        assert_eq!(store.stats().inserts, 0);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_conflicting_insert_returns_existing_row() {
        let identity = Arc::new(MemoryIdentity::new());
        let store = Arc::new(MemoryStore::new());
        let accounts = service(identity, Arc::clone(&store), Arc::new(ManualClock::new()));

        let profile = NewProfile::new("fixed-id", "ana", "ana@example.com");
        store.seed(
            USERS_TABLE,
            serde_json::json!({
                "id": "fixed-id", "username": "ana", "email": "ana@example.com", "xp": 300
            }),
        );
        let user = accounts.ensure_profile(&profile).unwrap();
        assert_eq!(user.xp, 300);
    }

    #[test]
    fn test_ensure_profile_requires_id() {
        let accounts = service(
            Arc::new(MemoryIdentity::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new()),
        );
        let err = accounts
            .ensure_profile(&NewProfile::new("", "ana", "ana@example.com"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_reject_then_insert() {
        let identity = Arc::new(MemoryIdentity::new());
        let store = Arc::new(MemoryStore::new());
        store.push_insert_fault(InsertFault::Reject(RemoteError::Rejected {
            status: 409,
            body: "insert or update violates foreign key constraint".to_string(),
        }));
        let clock = Arc::new(ManualClock::new());
        let accounts = service(identity, Arc::clone(&store), Arc::clone(&clock));

        let user = accounts
            .create_account(
                &Registration::new("ana", "ana@example.com", "pw"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(user.email, "ana@example.com");
        assert_eq!(store.stats().inserts, 2);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn test_count_users() {
        let store = Arc::new(MemoryStore::new());
        let accounts = service(
            Arc::new(MemoryIdentity::new()),
            Arc::clone(&store),
            Arc::new(ManualClock::new()),
        );
        assert_eq!(accounts.count_users().unwrap(), 0);
        store.seed(USERS_TABLE, serde_json::json!({"id": "u1"}));
        assert_eq!(accounts.count_users().unwrap(), 1);
        store.set_unavailable(true);
        assert!(matches!(
            accounts.count_users(),
            Err(Error::StoreUnavailable(_))
        ));
    }
}
