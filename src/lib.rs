//! Player progress and account lifecycle for the DAX learning game backend.
//!
//! `progress` applies XP/coin deltas to a stored profile and keeps its level
//! derived from XP. `accounts` registers identities and creates the matching
//! profile row, retrying the insert on a backoff ladder. Both talk to the
//! hosted backend through the traits in `remote`.

pub mod accounts;
pub mod backoff;
pub mod config;
pub mod error;
pub mod journal;
pub mod level;
pub mod model;
pub mod progress;
pub mod remote;

pub use error::{Error, Result};
