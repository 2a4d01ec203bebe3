//! Collaborator interfaces: the remote record store and identity service.
//!
//! Records are JSON objects. Implementations:
//! - `http`: Supabase-compatible REST (PostgREST + GoTrue) over ureq
//! - `memory`: in-process, with fault injection for tests and dry runs

pub mod http;
pub mod memory;

use crate::model::{SignIn, SignUp};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a remote collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure, timeout or 5xx
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Duplicate key or already-registered identity
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    /// Any other 4xx
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Remote table store keyed by `id`
pub trait RecordStore {
    fn get(&self, table: &str, id: &str) -> RemoteResult<Option<Value>>;

    /// Insert a row; a duplicate `id` reports `Conflict`
    fn insert(&self, table: &str, record: &Value) -> RemoteResult<Value>;

    /// Update fields of one row; `None` when no row has this id
    fn update(&self, table: &str, id: &str, fields: &Map<String, Value>)
        -> RemoteResult<Option<Value>>;

    /// Update only if every `expected` field still holds its value
    fn update_if(
        &self,
        table: &str,
        id: &str,
        expected: &Map<String, Value>,
        fields: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>>;

    /// Server-side atomic add of numeric deltas
    fn increment(
        &self,
        _table: &str,
        _id: &str,
        _deltas: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        Err(RemoteError::Unsupported("increment".to_string()))
    }

    fn count(&self, table: &str) -> RemoteResult<u64>;
}

/// Remote identity (auth) service
pub trait IdentityService {
    /// Create an identity; an already-registered email reports `Conflict`
    fn sign_up(&self, email: &str, password: &str) -> RemoteResult<SignUp>;

    /// Exchange credentials for a session; bad credentials report `InvalidCredentials`
    fn sign_in(&self, email: &str, password: &str) -> RemoteResult<SignIn>;
}

impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    fn get(&self, table: &str, id: &str) -> RemoteResult<Option<Value>> {
        (**self).get(table, id)
    }

    fn insert(&self, table: &str, record: &Value) -> RemoteResult<Value> {
        (**self).insert(table, record)
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        (**self).update(table, id, fields)
    }

    fn update_if(
        &self,
        table: &str,
        id: &str,
        expected: &Map<String, Value>,
        fields: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        (**self).update_if(table, id, expected, fields)
    }

    fn increment(
        &self,
        table: &str,
        id: &str,
        deltas: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        (**self).increment(table, id, deltas)
    }

    fn count(&self, table: &str) -> RemoteResult<u64> {
        (**self).count(table)
    }
}

impl<T: IdentityService + ?Sized> IdentityService for Arc<T> {
    fn sign_up(&self, email: &str, password: &str) -> RemoteResult<SignUp> {
        (**self).sign_up(email, password)
    }

    fn sign_in(&self, email: &str, password: &str) -> RemoteResult<SignIn> {
        (**self).sign_in(email, password)
    }
}
