use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use numberhub::config::HubConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "numberhub")]
#[command(version, about = "SMS number inventory and OTP inbox")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a TOML config file (defaults to ./numberhub.toml when present)
    #[arg(long, global = true, env = "NUMBERHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides config and environment.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database and bootstrap the admin user
    InitDb,
    /// Create a hub user
    CreateUser {
        username: String,

        #[arg(long)]
        password: String,

        /// admin or user
        #[arg(long, default_value = "user")]
        role: String,

        #[arg(long)]
        email: Option<String>,
    },
    /// Export the inventory as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import rows into an inventory table from a JSON array
    Import {
        /// people, numbers, store_accounts or assignments
        table: String,
        file: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets masked
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = HubConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.db_path {
        config.server.db_path = db_path.clone();
    }
    numberhub::logging::init(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host.clone(), *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::CreateUser {
            username,
            password,
            role,
            email,
        } => cmd::cmd_create_user(&config, username, password, role, email.as_deref())?,
        Commands::Export { output } => cmd::cmd_export(&config, output.as_deref())?,
        Commands::Import { table, file } => cmd::cmd_import(&config, table, file)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
