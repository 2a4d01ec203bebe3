//! Records exchanged with the remote store and identity service.

use crate::level::level_for_xp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Application-level user row, owned by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserAccount {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub xp: u64,
    #[serde(default)]
    pub coins: u64,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub streak_days: u32,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_level() -> u32 {
    1
}

impl UserAccount {
    /// Decode a raw store record
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }

    /// Whether the stored level agrees with the level rule
    pub fn level_is_consistent(&self) -> bool {
        self.level == level_for_xp(self.xp)
    }
}

/// Default profile row written right after sign-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl NewProfile {
    pub fn new(id: &str, username: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            email: email.to_string(),
        }
    }

    pub fn to_record(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "xp": 0,
            "coins": 0,
            "level": 1,
            "streak_days": 0,
            "is_premium": false,
        })
    }
}

/// XP and coins earned by one activity; both only ever increase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressDelta {
    pub xp: u64,
    pub coins: u64,
}

impl ProgressDelta {
    pub fn new(xp: u64, coins: u64) -> Self {
        Self { xp, coins }
    }

    pub fn xp(xp: u64) -> Self {
        Self { xp, coins: 0 }
    }
}

/// Registration request
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl Registration {
    pub fn new(username: &str, email: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }
}

/// Identity created by sign-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUp {
    pub id: String,
}

/// Auth session returned by sign-in
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Identity plus session returned by sign-in
#[derive(Debug, Clone)]
pub struct SignIn {
    pub id: String,
    pub session: Session,
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub user: UserAccount,
    pub session: Session,
}
