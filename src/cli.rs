use crate::Command;
use anyhow::Result;
use daxprogress::accounts::AccountService;
use daxprogress::backoff::CancelToken;
use daxprogress::config::Config;
use daxprogress::journal::Journal;
use daxprogress::model::{NewProfile, ProgressDelta, Registration};
use daxprogress::progress::ProgressUpdater;
use daxprogress::remote::http::{HttpIdentity, HttpStore};
use serde::Serialize;
use std::sync::Arc;

pub struct Context {
    pub config: Config,
    pub progress: ProgressUpdater<Arc<HttpStore>>,
    pub accounts: AccountService<HttpIdentity, Arc<HttpStore>>,
    pub cancel: CancelToken,
}

impl Context {
    /// Build the HTTP collaborators from resolved configuration
    pub fn connect(config: Config, journal: Arc<Journal>) -> Result<Self> {
        let remote = &config.remote;
        let url = remote.resolve_url()?;
        let store = Arc::new(HttpStore::new(
            &url,
            &remote.resolve_store_key()?,
            remote.timeout_ms(),
            remote.increment_fn(),
        ));
        let identity = HttpIdentity::new(&url, &remote.resolve_anon_key()?, remote.timeout_ms());

        let progress = ProgressUpdater::new(store.clone())
            .with_table(remote.users_table())
            .with_mode(config.progress.write_mode())
            .with_cas_attempts(config.progress.cas_max_attempts())
            .with_journal(journal.clone());

        let registration = &config.registration;
        let accounts = AccountService::new(identity, store)
            .with_table(remote.users_table())
            .with_backoff(registration.backoff())
            .with_final_check_delay(registration.final_check_delay())
            .with_deadline(registration.deadline())
            .with_jitter_seed(registration.jitter_seed)
            .with_journal(journal);

        Ok(Self {
            config,
            progress,
            accounts,
            cancel: CancelToken::new(),
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run(ctx: &Context, command: &Command) -> Result<()> {
    match command {
        Command::Register {
            username,
            email,
            password,
        } => {
            let request = Registration::new(username, email, password);
            let user = ctx.accounts.create_account(&request, &ctx.cancel)?;
            print_json(&user)
        }
        Command::Login { email, password } => {
            let outcome = ctx.accounts.login(email, password)?;
            print_json(&outcome)
        }
        Command::Show { id } => {
            let user = ctx.accounts.get_user(id)?;
            print_json(&user)
        }
        Command::AddXp { id, xp, coins } => {
            let user = ctx
                .progress
                .apply_xp_delta(id, ProgressDelta::new(*xp, *coins))?;
            println!("+{} XP and +{} coins!", xp, coins);
            print_json(&user)
        }
        Command::Check => {
            let users = ctx.accounts.count_users()?;
            println!(
                "Connected to {} (table '{}')",
                ctx.config.remote.url.as_deref().unwrap_or("backend"),
                ctx.config.remote.users_table()
            );
            println!("Users: {}", users);
            Ok(())
        }
        Command::ManualCreate {
            username,
            email,
            id,
        } => {
            let id = id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let user = ctx
                .accounts
                .ensure_profile(&NewProfile::new(&id, username, email))?;
            print_json(&user)
        }
    }
}
