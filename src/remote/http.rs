//! Supabase-compatible REST bindings.
//!
//! The record store speaks PostgREST (`{url}/rest/v1/{table}`), the identity
//! service speaks GoTrue (`{url}/auth/v1`). Both authenticate with the
//! `apikey` header plus a bearer token carrying the same key.

use super::{IdentityService, RecordStore, RemoteError, RemoteResult};
use crate::model::{Session, SignIn, SignUp};
use serde_json::{Map, Value};
use std::time::Duration;

/// Thin ureq wrapper shared by the store and identity clients
struct RestClient {
    base_url: String,
    api_key: String,
    agent: ureq::Agent,
    timeout: Duration,
}

impl RestClient {
    fn new(base_url: &str, api_key: &str, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            agent: ureq::Agent::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        self.agent
            .request(method, &url)
            .timeout(self.timeout)
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {}", self.api_key))
    }

    /// Send and split the outcome into a response or a (status, body) failure
    fn send(
        req: ureq::Request,
        body: Option<&Value>,
    ) -> Result<ureq::Response, Failure> {
        let resp = match body {
            Some(body) => req
                .set("Content-Type", "application/json")
                .send_json(body.clone()),
            None => req.call(),
        };

        match resp {
            Ok(r) => Ok(r),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(Failure::Status(code, body))
            }
            Err(e) => Err(Failure::Transport(e.to_string())),
        }
    }
}

enum Failure {
    Status(u16, String),
    Transport(String),
}

fn read_json(resp: ureq::Response) -> RemoteResult<Value> {
    let text = resp
        .into_string()
        .map_err(|e| RemoteError::Unavailable(format!("reading response: {}", e)))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Whether a PostgREST error body reports a unique-key violation (SQLSTATE 23505)
fn is_unique_violation(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => parsed["code"].as_str() == Some("23505"),
        Err(_) => body.contains("duplicate key"),
    }
}

/// Map a PostgREST error status to a remote error
///
/// Only unique-key violations count as `Conflict`; other 409s (such as a
/// foreign-key violation while the identity row propagates) are rejections.
pub fn classify_store_status(status: u16, body: &str) -> RemoteError {
    match status {
        409 if is_unique_violation(body) => RemoteError::Conflict(body.to_string()),
        s if s >= 500 => RemoteError::Unavailable(format!("HTTP {}: {}", s, body)),
        _ => RemoteError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}

/// Map a GoTrue sign-up error status to a remote error
pub fn classify_sign_up_status(status: u16, body: &str) -> RemoteError {
    let lower = body.to_lowercase();
    let duplicate = lower.contains("already registered")
        || lower.contains("already exists")
        || lower.contains("user_already_exists");
    match status {
        400 | 422 if duplicate => RemoteError::Conflict(body.to_string()),
        429 => RemoteError::Unavailable(format!("rate limited: {}", body)),
        s if s >= 500 => RemoteError::Unavailable(format!("HTTP {}: {}", s, body)),
        _ => RemoteError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}

/// Map a GoTrue sign-in error status to a remote error
pub fn classify_sign_in_status(status: u16, body: &str) -> RemoteError {
    match status {
        400 | 401 => RemoteError::InvalidCredentials,
        429 => RemoteError::Unavailable(format!("rate limited: {}", body)),
        s if s >= 500 => RemoteError::Unavailable(format!("HTTP {}: {}", s, body)),
        _ => RemoteError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}

/// First row of a PostgREST representation (array, object or empty)
pub fn first_row(body: Value) -> RemoteResult<Option<Value>> {
    match body {
        Value::Null => Ok(None),
        Value::Array(rows) => Ok(rows.into_iter().next()),
        Value::Object(_) => Ok(Some(body)),
        other => Err(RemoteError::Decode(format!(
            "expected rows, got {}",
            other
        ))),
    }
}

/// Total from a `Content-Range` header such as `0-24/573` or `*/0`
pub fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

/// PostgREST filter operand matching a JSON value; null matches `is.null`
pub fn eq_filter(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::String(s) => format!("eq.{}", s),
        other => format!("eq.{}", other),
    }
}

pub fn parse_sign_up(body: &Value) -> RemoteResult<SignUp> {
    let id = body["user"]["id"]
        .as_str()
        .or_else(|| body["id"].as_str())
        .ok_or_else(|| RemoteError::Decode("sign-up response has no user id".to_string()))?;
    Ok(SignUp { id: id.to_string() })
}

pub fn parse_sign_in(body: Value) -> RemoteResult<SignIn> {
    let id = body["user"]["id"]
        .as_str()
        .ok_or_else(|| RemoteError::Decode("sign-in response has no user id".to_string()))?
        .to_string();
    let session: Session =
        serde_json::from_value(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(SignIn { id, session })
}

/// PostgREST record store
pub struct HttpStore {
    client: RestClient,
    increment_fn: String,
}

impl HttpStore {
    pub fn new(base_url: &str, api_key: &str, timeout_ms: u64, increment_fn: &str) -> Self {
        Self {
            client: RestClient::new(base_url, api_key, timeout_ms),
            increment_fn: increment_fn.to_string(),
        }
    }

    fn table_path(table: &str) -> String {
        format!("/rest/v1/{}", table)
    }

    fn rows(&self, req: ureq::Request, body: Option<&Value>) -> RemoteResult<Value> {
        match RestClient::send(req, body) {
            Ok(resp) => read_json(resp),
            Err(Failure::Status(code, body)) => Err(classify_store_status(code, &body)),
            Err(Failure::Transport(msg)) => Err(RemoteError::Unavailable(msg)),
        }
    }
}

impl RecordStore for HttpStore {
    fn get(&self, table: &str, id: &str) -> RemoteResult<Option<Value>> {
        let req = self
            .client
            .request("GET", &Self::table_path(table))
            .query("id", &format!("eq.{}", id))
            .query("select", "*");
        first_row(self.rows(req, None)?)
    }

    fn insert(&self, table: &str, record: &Value) -> RemoteResult<Value> {
        let req = self
            .client
            .request("POST", &Self::table_path(table))
            .set("Prefer", "return=representation");
        first_row(self.rows(req, Some(record))?)?
            .ok_or_else(|| RemoteError::Decode("insert returned no rows".to_string()))
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
        let mut req = self
            .client
            .request("PATCH", &Self::table_path(table))
            .set("Prefer", "return=representation")
            .query("id", &format!("eq.{}", id));
        for (field, value) in expected {
            req = req.query(field, &eq_filter(value));
        }
        let body = Value::Object(fields.clone());
        first_row(self.rows(req, Some(&body))?)
    }

    fn increment(
        &self,
        _table: &str,
        id: &str,
        deltas: &Map<String, Value>,
    ) -> RemoteResult<Option<Value>> {
        let mut args = Map::new();
        args.insert("row_id".to_string(), Value::String(id.to_string()));
        for (field, delta) in deltas {
            args.insert(format!("{}_delta", field), delta.clone());
        }

        let path = format!("/rest/v1/rpc/{}", self.increment_fn);
        let req = self.client.request("POST", &path);
        match RestClient::send(req, Some(&Value::Object(args))) {
            Ok(resp) => first_row(read_json(resp)?),
            Err(Failure::Status(404, _)) => Err(RemoteError::Unsupported(format!(
                "rpc function {} not found",
                self.increment_fn
            ))),
            Err(Failure::Status(code, body)) => Err(classify_store_status(code, &body)),
            Err(Failure::Transport(msg)) => Err(RemoteError::Unavailable(msg)),
        }
    }

    fn count(&self, table: &str) -> RemoteResult<u64> {
        let req = self
            .client
            .request("HEAD", &Self::table_path(table))
            .query("select", "id")
            .set("Prefer", "count=exact");
        match RestClient::send(req, None) {
            Ok(resp) => resp
                .header("Content-Range")
                .and_then(parse_content_range)
                .ok_or_else(|| RemoteError::Decode("missing Content-Range".to_string())),
            Err(Failure::Status(code, body)) => Err(classify_store_status(code, &body)),
            Err(Failure::Transport(msg)) => Err(RemoteError::Unavailable(msg)),
        }
    }
}

/// GoTrue identity service
pub struct HttpIdentity {
    client: RestClient,
}

impl HttpIdentity {
    pub fn new(base_url: &str, api_key: &str, timeout_ms: u64) -> Self {
        Self {
            client: RestClient::new(base_url, api_key, timeout_ms),
        }
    }

    fn credentials(email: &str, password: &str) -> Value {
        serde_json::json!({ "email": email, "password": password })
    }
}

impl IdentityService for HttpIdentity {
    fn sign_up(&self, email: &str, password: &str) -> RemoteResult<SignUp> {
        let req = self.client.request("POST", "/auth/v1/signup");
        match RestClient::send(req, Some(&Self::credentials(email, password))) {
            Ok(resp) => parse_sign_up(&read_json(resp)?),
            Err(Failure::Status(code, body)) => Err(classify_sign_up_status(code, &body)),
            Err(Failure::Transport(msg)) => Err(RemoteError::Unavailable(msg)),
        }
    }

    fn sign_in(&self, email: &str, password: &str) -> RemoteResult<SignIn> {
        let req = self
            .client
            .request("POST", "/auth/v1/token")
            .query("grant_type", "password");
        match RestClient::send(req, Some(&Self::credentials(email, password))) {
            Ok(resp) => parse_sign_in(read_json(resp)?),
            Err(Failure::Status(code, body)) => Err(classify_sign_in_status(code, &body)),
            Err(Failure::Transport(msg)) => Err(RemoteError::Unavailable(msg)),
        }
    }
}
