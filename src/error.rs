//! Error taxonomy for the progress and account flows.
//!
//! Remote adapters report `RemoteError`; the services translate it into
//! `Error` by cause. Callers map `Error` to user-facing text only at the
//! boundary, via `user_message`.

use crate::remote::RemoteError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Profile record absent
    #[error("user not found: {0}")]
    NotFound(String),

    /// Identity already registered for this email
    #[error("an account with this email already exists")]
    DuplicateAccount,

    /// Every profile insert failed and the final existence check found nothing
    #[error("profile creation failed after {attempts} attempts: {last_error}")]
    CreationFailed { attempts: u32, last_error: String },

    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[source] RemoteError),

    #[error("identity service unavailable: {0}")]
    IdentityUnavailable(#[source] RemoteError),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Compare-and-swap guard kept failing
    #[error("update lost to concurrent writers {attempts} times")]
    Contention { attempts: u32 },

    /// Registration deadline passed before the profile became visible
    #[error("timed out after {attempts} attempts")]
    TimedOut { attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Message suitable for end users; hides remote diagnostics
    pub fn user_message(&self) -> String {
        match self {
            Error::NotFound(_) => "User not found.".to_string(),
            Error::DuplicateAccount => {
                "Could not create the account. Try a different email.".to_string()
            }
            Error::CreationFailed { .. } | Error::TimedOut { .. } => {
                "Could not finish creating the account. Try again in a moment.".to_string()
            }
            Error::StoreUnavailable(_) | Error::IdentityUnavailable(_) => {
                "Service unavailable, try again later.".to_string()
            }
            Error::InvalidCredentials => "Invalid credentials.".to_string(),
            Error::InvalidInput(msg) => format!("Invalid request: {}.", msg),
            Error::Contention { .. } => {
                "Progress was being updated elsewhere. Try again.".to_string()
            }
            Error::Cancelled => "Request cancelled.".to_string(),
        }
    }

    /// Equivalent HTTP status for embedding in a web layer
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::InvalidCredentials => 401,
            Error::NotFound(_) => 404,
            Error::DuplicateAccount | Error::Contention { .. } => 409,
            Error::CreationFailed { .. } | Error::Cancelled => 500,
            Error::StoreUnavailable(_) | Error::IdentityUnavailable(_) => 503,
            Error::TimedOut { .. } => 504,
        }
    }

    /// Process exit code used by the command-line front end
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidInput(_) => 2,
            Error::NotFound(_) => 3,
            Error::DuplicateAccount => 4,
            Error::InvalidCredentials => 5,
            Error::CreationFailed { .. } => 6,
            Error::StoreUnavailable(_) | Error::IdentityUnavailable(_) => 7,
            Error::Contention { .. } => 8,
            Error::TimedOut { .. } => 9,
            Error::Cancelled => 10,
        }
    }

    /// Whether a caller may reasonably retry the same request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::IdentityUnavailable(_)
                | Error::Contention { .. }
                | Error::TimedOut { .. }
        )
    }
}
