use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod commands;
mod config;
mod local;

#[derive(Parser)]
#[command(name = "crawlctl", about = "crawlctl - Manage your Crawl Agent account, identity and tasks")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session token for the agent
    Login {
        /// API base URL (default: http://localhost:8090)
        #[arg(long)]
        api_url: Option<String>,

        #[arg(short, long)]
        username: Option<String>,
    },

    /// Create an account
    Register {
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Sign out and forget the session token
    Logout,

    /// Show or reset the client identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },

    /// Manage scheduled tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Show the client id
    Show,
    /// Discard the client id and derive a new one
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List scheduled tasks for this client
    List,
    /// Replace scheduled tasks with the contents of a JSON file
    Sync {
        /// JSON array of tasks
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Login { api_url, username } => {
            commands::login::run(api_url, username).await
        }
        Commands::Register { username } => {
            commands::register::run(username).await
        }
        Commands::Logout => {
            commands::logout::run().await
        }
        Commands::Identity { command } => match command {
            IdentityCommands::Show => commands::identity::show(),
            IdentityCommands::Reset { yes } => commands::identity::reset(yes),
        },
        Commands::Tasks { command } => match command {
            TaskCommands::List => commands::tasks::list().await,
            TaskCommands::Sync { file } => commands::tasks::sync(&file).await,
        },
    }
}
