use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gemforge::config::Config;
use gemforge::server::{AppState, gemini, http, ssh, tasks};
use gemforge::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "gemforge")]
#[command(about = "A code forge served over Gemini", long_about = None)]
struct Cli {
    /// Configuration file; searched in the usual directories when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the Gemini, HTTP and SSH listeners
    Serve,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database and the repository root
    Init,

    /// List registered users
    ListUsers,

    /// Delete a user with their repositories
    DeleteUser {
        /// Name of the user to delete
        name: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Fail instead of prompting
        #[arg(long)]
        non_interactive: bool,
    },
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let (config, path) = Config::load(path)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn run_init(config: &Config) -> anyhow::Result<()> {
    fs::create_dir_all(&config.git.root).with_context(|| {
        format!("cannot create repository root {}", config.git.root.display())
    })?;
    let store = SqliteStore::new(&config.database.url)?;
    store.initialize()?;

    println!("Database ready at {}", config.database.url);
    println!("Repositories stored under {}", config.git.root.display());
    Ok(())
}

fn run_list_users(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::new(&config.database.url)?;
    store.initialize()?;
    let users = store.list_users()?;
    if users.is_empty() {
        println!("No users.");
    }
    for user in users {
        let otp = if user.has_otp() { " otp" } else { "" };
        println!(
            "{}\t{}{otp}",
            user.name,
            user.created_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

/// Request confirmation for a destructive operation
fn confirm_action(message: &str, yes: bool, non_interactive: bool) -> anyhow::Result<bool> {
    if yes {
        Ok(true)
    } else if non_interactive {
        anyhow::bail!("--yes is required for destructive operations in non-interactive mode");
    } else {
        Ok(inquire::Confirm::new(message)
            .with_default(false)
            .prompt()?)
    }
}

fn run_delete_user(config: Config, name: &str, yes: bool, non_interactive: bool) -> anyhow::Result<()> {
    let message = format!("Delete user '{name}' and all their repositories?");
    if !confirm_action(&message, yes, non_interactive)? {
        println!("Aborted");
        return Ok(());
    }

    let state = AppState::open(config)?;
    state.identity.delete_user(name)?;
    println!("Deleted user '{name}'");
    Ok(())
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::open(config)?);
    let config = &state.config;

    let _supervisor = tasks::spawn_reset_supervisor(
        state.guard.clone(),
        state.sessions.clone(),
        config.protection.reset_interval(),
    );

    let mut servers = JoinSet::new();
    servers.spawn(gemini::serve(state.clone()));
    if config.git.http.enabled {
        servers.spawn(http::serve(state.clone()));
    }
    if config.git.remote.enabled {
        servers.spawn(ssh::serve(state.clone()));
    }

    while let Some(result) = servers.join_next().await {
        result??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gemforge=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init => run_init(&config)?,
            AdminCommands::ListUsers => run_list_users(&config)?,
            AdminCommands::DeleteUser {
                name,
                yes,
                non_interactive,
            } => run_delete_user(config, &name, yes, non_interactive)?,
        },
        Commands::Serve => run_serve(config).await?,
    }

    Ok(())
}
