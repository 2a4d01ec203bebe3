mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use daxprogress::config::Config;
use daxprogress::journal::Journal;
use daxprogress::progress::WriteMode;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "daxp", about = "Player accounts and XP progress for the DAX backend")]
pub struct Args {
    #[arg(long, help = "Config file path (replaces the layered lookup)")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "MODE",
        help = "XP write mode: read-modify-write, compare-and-swap, atomic-increment"
    )]
    pub write_mode: Option<String>,

    #[arg(
        long,
        value_name = "MS",
        help = "Registration deadline in milliseconds (0 disables)"
    )]
    pub deadline_ms: Option<u64>,

    #[arg(long, env = "DAXP_JOURNAL_DIR", help = "Journal directory")]
    pub journal_dir: Option<PathBuf>,

    #[arg(long, help = "Verbose output (echo journal events)")]
    pub verbose: bool,

    #[arg(long, help = "Debug output (print resolved settings)")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register an identity and create its profile
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "DAXP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign in and show the profile
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "DAXP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Show a profile by id
    Show { id: String },
    /// Award XP and coins to a profile
    AddXp {
        id: String,
        #[arg(long, default_value_t = 100)]
        xp: u64,
        #[arg(long, default_value_t = 10)]
        coins: u64,
    },
    /// Check the backend connection and count profiles
    Check,
    /// Insert a default profile without registering an identity
    ManualCreate {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, help = "Profile id (random UUID when omitted)")]
        id: Option<String>,
    },
}

fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut cfg = if let Some(config_path) = &args.config {
        Config::load_from(config_path)?
    } else {
        Config::load()?
    };

    if let Some(mode_str) = &args.write_mode {
        if let Some(mode) = WriteMode::from_str(mode_str) {
            cfg.progress.write_mode = Some(mode);
        } else {
            return Err(anyhow::anyhow!(
                "Invalid write mode: {}. Use: read-modify-write, compare-and-swap, atomic-increment",
                mode_str
            ));
        }
    }
    if let Some(ms) = args.deadline_ms {
        cfg.registration.deadline_ms = Some(ms);
    }
    if let Some(dir) = &args.journal_dir {
        cfg.journal.dir = Some(dir.clone());
    }

    if let Err(errors) = cfg.validate() {
        for e in &errors {
            eprintln!("Config error {}", e);
        }
        return Err(anyhow::anyhow!(
            "Invalid configuration ({} errors)",
            errors.len()
        ));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let journal = if cfg.journal.enabled() {
        Journal::open(&cfg.journal.dir(), &run_id)?
    } else {
        Journal::disabled()
    };
    let journal = Arc::new(journal.with_echo(args.verbose));

    if args.debug {
        eprintln!("[DEBUG] Run: {}", run_id);
        eprintln!("[DEBUG] Backend: {}", cfg.remote.url.as_deref().unwrap_or("<env>"));
        eprintln!("[DEBUG] Users table: {}", cfg.remote.users_table());
        eprintln!("[DEBUG] Write mode: {}", cfg.progress.write_mode().as_str());
        eprintln!("[DEBUG] Backoff: {:?}", cfg.registration.backoff());
        eprintln!("[DEBUG] Deadline: {:?}", cfg.registration.deadline());
        if let Some(path) = journal.path() {
            eprintln!("[DEBUG] Journal: {}", path.display());
        }
    }

    let ctx = cli::Context::connect(cfg, journal)?;
    cli::run(&ctx, &args.command)
}

fn main() {
    if let Err(e) = run() {
        match e.downcast_ref::<daxprogress::Error>() {
            Some(err) => {
                eprintln!("Error: {}", err.user_message());
                std::process::exit(err.exit_code());
            }
            None => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}
