use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agent_fleet::config::FleetConfig;
use agent_fleet::fleet::server::{self, ServeOptions};
use agent_fleet::telemetry::{self, LogFormat};

#[derive(Parser)]
#[command(name = "agent-fleet")]
#[command(version, about = "Instruction queues and live event channels for sandboxed agent containers")]
pub struct Cli {
    /// Directory holding fleet.toml
    #[arg(long, global = true, default_value = ".fleet", env = "FLEET_CONFIG_DIR")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to serve on (overrides fleet.toml)
        #[arg(short, long, env = "FLEET_PORT")]
        port: Option<u16>,

        /// Interface to bind (overrides fleet.toml)
        #[arg(long)]
        host: Option<String>,

        /// SQLite database path (overrides fleet.toml)
        #[arg(long, env = "FLEET_DB_PATH")]
        db_path: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
        log_format: LogFormat,

        /// Also write daily-rolling JSON logs to this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Run without Docker; instructions fail until a sandbox is available
        #[arg(long)]
        no_docker: bool,

        /// Allow cross-origin requests (development)
        #[arg(long)]
        cors: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check that fleet.toml parses
    Validate,
    /// Write a fleet.toml with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            log_format,
            log_dir,
            no_docker,
            cors,
        } => {
            let _guard = telemetry::init(log_format, log_dir.as_deref())?;
            let mut config = FleetConfig::load(&cli.config_dir)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            let options = ServeOptions {
                no_docker,
                permissive_cors: cors,
            };
            server::start_server(config, options).await?;
        }
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => {
                let config = FleetConfig::load(&cli.config_dir)?;
                println!("{:#?}", config);
            }
            ConfigCommands::Validate => {
                FleetConfig::load(&cli.config_dir)?;
                println!(
                    "{} is valid",
                    FleetConfig::file_path(&cli.config_dir).display()
                );
            }
            ConfigCommands::Init { force } => {
                let path = FleetConfig::file_path(&cli.config_dir);
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                std::fs::create_dir_all(&cli.config_dir).with_context(|| {
                    format!("Failed to create {}", cli.config_dir.display())
                })?;
                std::fs::write(&path, FleetConfig::template())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {}", path.display());
            }
        },
    }

    Ok(())
}
