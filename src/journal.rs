//! JSON-lines journal of protocol steps.
//!
//! One line per event: `{"ts", "run_id", "type", ...fields}`, flushed as it
//! is written. A failing sink never fails the operation being journaled; the
//! first write error is reported on stderr and later ones are dropped.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    run_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: Value,
}

/// In-memory sink whose contents tests can read back
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Parsed events written so far
    pub fn events(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Event types in order
    pub fn types(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["type"].as_str().map(str::to_string))
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Journal {
    run_id: String,
    path: Option<PathBuf>,
    sink: Option<Mutex<Box<dyn Write + Send>>>,
    echo: bool,
    failed: AtomicBool,
}

impl Journal {
    /// Journal that records nothing
    pub fn disabled() -> Self {
        Self {
            run_id: String::new(),
            path: None,
            sink: None,
            echo: false,
            failed: AtomicBool::new(false),
        }
    }

    /// Append to `{dir}/{run_id}.jsonl`
    pub fn open(dir: &Path, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", run_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            run_id: run_id.to_string(),
            path: Some(path),
            sink: Some(Mutex::new(Box::new(file))),
            echo: false,
            failed: AtomicBool::new(false),
        })
    }

    /// Journal into memory; the buffer reads the events back
    pub fn in_memory(run_id: &str) -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let journal = Self {
            run_id: run_id.to_string(),
            path: None,
            sink: Some(Mutex::new(Box::new(buffer.clone()))),
            echo: false,
            failed: AtomicBool::new(false),
        };
        (journal, buffer)
    }

    /// Also print each event to stderr
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&self, event_type: &str, data: Value) {
        if self.echo {
            eprintln!("[trace] {} {}", event_type, data);
        }
        if let Err(e) = self.write(event_type, data) {
            if !self.failed.swap(true, Ordering::SeqCst) {
                eprintln!("Warning: journal write failed: {}", e);
            }
        }
    }

    fn write(&self, event_type: &str, data: Value) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let event = Event {
            ts: Utc::now(),
            run_id: &self.run_id,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(sink, "{}", line)?;
        sink.flush()?;
        Ok(())
    }

    pub fn fetched(&self, user_id: &str, found: bool) {
        self.log("fetch", json!({ "user_id": user_id, "found": found }));
    }

    pub fn progress_written(&self, user_id: &str, mode: &str, xp: u64, coins: u64, level: u32) {
        self.log(
            "progress_written",
            json!({
                "user_id": user_id,
                "mode": mode,
                "xp": xp,
                "coins": coins,
                "level": level,
            }),
        )
    }

    pub fn write_conflict(&self, user_id: &str, attempt: u32) {
        self.log(
            "write_conflict",
            json!({ "user_id": user_id, "attempt": attempt }),
        )
    }

    pub fn level_fixup(&self, user_id: &str, xp: u64, level: u32, applied: bool) {
        self.log(
            "level_fixup",
            json!({
                "user_id": user_id,
                "xp": xp,
                "level": level,
                "applied": applied,
            }),
        )
    }

    pub fn sign_up(&self, email: &str, outcome: &str) {
        self.log("sign_up", json!({ "email": email, "outcome": outcome }))
    }

    pub fn backoff_wait(&self, user_id: &str, attempt: u32, delay_ms: u64) {
        self.log(
            "backoff_wait",
            json!({
                "user_id": user_id,
                "attempt": attempt,
                "delay_ms": delay_ms,
            }),
        )
    }

    pub fn insert_attempt(&self, user_id: &str, attempt: u32, error: Option<&str>) {
        self.log(
            "insert_attempt",
            json!({
                "user_id": user_id,
                "attempt": attempt,
                "ok": error.is_none(),
                "error": error,
            }),
        )
    }

    pub fn final_check(&self, user_id: &str, found: bool) {
        self.log(
            "final_check",
            json!({ "user_id": user_id, "found": found }),
        )
    }

    pub fn outcome(&self, operation: &str, user_id: &str, result: &str) {
        self.log(
            "outcome",
            json!({
                "operation": operation,
                "user_id": user_id,
                "result": result,
            }),
        )
    }
}
