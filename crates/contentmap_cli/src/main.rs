//! Administration entry point for content map databases.
//!
//! # Responsibility
//! - Verify `contentmap_core` linkage (`ping`, `version`).
//! - Inspect and release pessimistic locks, apply bookkeeping migrations.
//!
//! # Invariants
//! - Output is line oriented and deterministic for scripting.
//! - Failures exit with status 1 and a single `error:` line on stderr.

use clap::{Parser, Subcommand};
use contentmap_core::db::{migrations::current_user_version, open_db};
use contentmap_core::{
    init_logging_from_config, CoreConfig, LockManager, LockOwner, PersistenceError,
};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "contentmap", version, about = "Content map persistence administration")]
struct Cli {
    /// Absolute directory for rolling log files.
    #[arg(long, global = true)]
    log_dir: Option<String>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Checks that the core library is linked.
    Ping,
    /// Prints the core library version.
    Version,
    /// Lists pessimistic locks held in a database.
    Locks {
        #[arg(long)]
        db: PathBuf,
    },
    /// Releases the locks of a login, or of one of its sessions.
    Unlock {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        login: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Applies pending bookkeeping migrations and prints the schema version.
    Migrate {
        #[arg(long)]
        db: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let defaults = CoreConfig::default();
    let config = CoreConfig {
        log_dir: cli.log_dir.clone(),
        log_level: cli.log_level.clone().unwrap_or(defaults.log_level.clone()),
        ..defaults
    };
    if let Err(err) = init_logging_from_config(&config) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), PersistenceError> {
    match command {
        Command::Ping => println!("contentmap_core ping={}", contentmap_core::ping()),
        Command::Version => println!("contentmap_core version={}", contentmap_core::core_version()),
        Command::Locks { db } => {
            let conn = open_db(&db)?;
            let locks = LockManager::new(&conn).list_locks()?;
            for lock in &locks {
                println!(
                    "{}\t{}\t{}\t{}",
                    lock.oid, lock.owner.login, lock.owner.session_id, lock.acquired_at
                );
            }
            println!("locks={}", locks.len());
        }
        Command::Unlock { db, login, session } => {
            let conn = open_db(&db)?;
            let manager = LockManager::new(&conn);
            let released = match session {
                Some(session) => manager.release_all(&LockOwner::new(&login, &session))?,
                None => manager.release_by_login(&login)?,
            };
            info!("event=cli_unlock module=cli status=ok login={login} count={released}");
            println!("released={released}");
        }
        Command::Migrate { db } => {
            let conn = open_db(&db)?;
            println!("user_version={}", current_user_version(&conn)?);
        }
    }
    Ok(())
}
