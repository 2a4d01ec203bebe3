use crate::backoff::Backoff;
use crate::progress::{WriteMode, USERS_TABLE};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Resolve a secret from a direct value or a named environment variable
fn resolve_secret(direct: &Option<String>, env_var: &str) -> Option<String> {
    if let Some(value) = direct {
        return Some(value.clone());
    }
    std::env::var(env_var).ok().filter(|v| !v.is_empty())
}

/// Connection to the hosted backend (record store + identity service)
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_env: Option<String>,
    #[serde(default)]
    pub anon_key: Option<String>,
    #[serde(default)]
    pub anon_key_env: Option<String>,
    /// Key used for table writes; bypasses row-level security
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default)]
    pub service_key_env: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub users_table: Option<String>,
    #[serde(default)]
    pub increment_fn: Option<String>,
}

impl RemoteConfig {
    pub fn resolve_url(&self) -> Result<String> {
        let env_var = self.url_env.as_deref().unwrap_or("SUPABASE_URL");
        resolve_secret(&self.url, env_var)
            .ok_or_else(|| anyhow!("No backend URL configured (set remote.url or {})", env_var))
    }

    pub fn resolve_anon_key(&self) -> Result<String> {
        let env_var = self.anon_key_env.as_deref().unwrap_or("SUPABASE_ANON_KEY");
        resolve_secret(&self.anon_key, env_var)
            .ok_or_else(|| anyhow!("No API key configured (set remote.anon_key or {})", env_var))
    }

    /// Service key when available, otherwise the anon key
    pub fn resolve_store_key(&self) -> Result<String> {
        let env_var = self
            .service_key_env
            .as_deref()
            .unwrap_or("SUPABASE_SERVICE_ROLE_KEY");
        match resolve_secret(&self.service_key, env_var) {
            Some(key) => Ok(key),
            None => self.resolve_anon_key(),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(10_000)
    }

    pub fn users_table(&self) -> &str {
        self.users_table.as_deref().unwrap_or(USERS_TABLE)
    }

    pub fn increment_fn(&self) -> &str {
        self.increment_fn.as_deref().unwrap_or("increment_progress")
    }
}

/// Settings for XP updates
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProgressConfig {
    #[serde(default)]
    pub write_mode: Option<WriteMode>,
    #[serde(default)]
    pub cas_max_attempts: Option<u32>,
}

impl ProgressConfig {
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode.unwrap_or_default()
    }

    pub fn cas_max_attempts(&self) -> u32 {
        self.cas_max_attempts.unwrap_or(5)
    }
}

/// Retry ladder for the profile insert that follows sign-up
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub final_check_delay_ms: Option<u64>,
    /// 0 disables the deadline
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

impl RegistrationConfig {
    pub fn backoff(&self) -> Backoff {
        let defaults = Backoff::default();
        Backoff {
            initial_delay: self
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
        }
    }

    pub fn final_check_delay(&self) -> Duration {
        Duration::from_millis(self.final_check_delay_ms.unwrap_or(2000))
    }

    pub fn deadline(&self) -> Option<Duration> {
        match self.deadline_ms.unwrap_or(15_000) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Where protocol events are journaled
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl JournalConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| Path::new(".daxp").join("journal"))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

/// Override `base` with `other` when `other` is set
fn take<T>(base: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *base = other;
    }
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.daxp/config.local.toml) > project (.daxp/config.toml) > user (~/.daxp/config.toml)
    pub fn load() -> Result<Self> {
        Self::load_layers(Path::new("."), dirs::home_dir().as_deref())
    }

    /// Layered load rooted at `project_root`, with an optional home directory
    pub fn load_layers(project_root: &Path, home: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = home {
            let user_config = home.join(".daxp").join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = project_root.join(".daxp").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Should be gitignored; holds keys
        let local_config = project_root.join(".daxp").join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority for every set field)
    pub fn merge(&mut self, other: Config) {
        let r = other.remote;
        take(&mut self.remote.url, r.url);
        take(&mut self.remote.url_env, r.url_env);
        take(&mut self.remote.anon_key, r.anon_key);
        take(&mut self.remote.anon_key_env, r.anon_key_env);
        take(&mut self.remote.service_key, r.service_key);
        take(&mut self.remote.service_key_env, r.service_key_env);
        take(&mut self.remote.timeout_ms, r.timeout_ms);
        take(&mut self.remote.users_table, r.users_table);
        take(&mut self.remote.increment_fn, r.increment_fn);

        take(&mut self.progress.write_mode, other.progress.write_mode);
        take(
            &mut self.progress.cas_max_attempts,
            other.progress.cas_max_attempts,
        );

        let g = other.registration;
        take(&mut self.registration.max_attempts, g.max_attempts);
        take(&mut self.registration.initial_delay_ms, g.initial_delay_ms);
        take(&mut self.registration.max_delay_ms, g.max_delay_ms);
        take(&mut self.registration.multiplier, g.multiplier);
        take(&mut self.registration.jitter, g.jitter);
        take(
            &mut self.registration.final_check_delay_ms,
            g.final_check_delay_ms,
        );
        take(&mut self.registration.deadline_ms, g.deadline_ms);
        take(&mut self.registration.jitter_seed, g.jitter_seed);

        take(&mut self.journal.enabled, other.journal.enabled);
        take(&mut self.journal.dir, other.journal.dir);
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let identifier = regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok();
        let is_identifier =
            |s: &str| identifier.as_ref().map(|re| re.is_match(s)).unwrap_or(false);

        if let Some(url) = &self.remote.url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                errors.push(ValidationError {
                    field: "remote.url".to_string(),
                    message: format!("Expected an http(s) URL, got '{}'", url),
                });
            }
        }

        if self.remote.timeout_ms() == 0 {
            errors.push(ValidationError {
                field: "remote.timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !is_identifier(self.remote.users_table()) {
            errors.push(ValidationError {
                field: "remote.users_table".to_string(),
                message: format!("Invalid table name '{}'", self.remote.users_table()),
            });
        }

        if !is_identifier(self.remote.increment_fn()) {
            errors.push(ValidationError {
                field: "remote.increment_fn".to_string(),
                message: format!("Invalid function name '{}'", self.remote.increment_fn()),
            });
        }

        if self.progress.cas_max_attempts() == 0 {
            errors.push(ValidationError {
                field: "progress.cas_max_attempts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        let backoff = self.registration.backoff();
        if backoff.max_attempts == 0 {
            errors.push(ValidationError {
                field: "registration.max_attempts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if !(backoff.multiplier >= 1.0) {
            errors.push(ValidationError {
                field: "registration.multiplier".to_string(),
                message: format!("Must be at least 1.0, got {}", backoff.multiplier),
            });
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            errors.push(ValidationError {
                field: "registration.jitter".to_string(),
                message: format!("Must be in [0.0, 1.0), got {}", backoff.jitter),
            });
        }
        if backoff.initial_delay > backoff.max_delay {
            errors.push(ValidationError {
                field: "registration.initial_delay_ms".to_string(),
                message: "Must not exceed registration.max_delay_ms".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
