mod dates;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use beerbot_config::{AppConfig, DEFAULT_CONFIG_PATH};
use beerbot_runtime::{DaemonClient, open_ledger, run_daemon};
use beerbot_slack::SlackTransport;

use crate::dates::RangeArgs;

/// Window used by `top` when no range flag is given.
const DEFAULT_TOP_DAYS: u64 = 7;

#[derive(Debug, Parser)]
#[command(name = "beerbot", version, about = "Slack beer gift ledger bot")]
struct Cli {
    /// Config file to load.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the bot in the foreground until interrupted.
    Run,
    /// Bring the ledger schema up to date and exit.
    Migrate,
    /// Units a user has given in a window.
    Given {
        #[arg(long)]
        user: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Units a user has received in a window.
    Received {
        #[arg(long)]
        user: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Everyone who ever gave.
    Givers,
    /// Everyone who ever received.
    Recipients,
    /// Leaderboard for a window (last 7 days by default).
    Top {
        #[arg(value_enum)]
        board: Board,
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Real name and profile picture of a workspace member.
    User {
        #[arg(long)]
        user: String,
    },
    /// Connection health and counters of the running bot.
    Status,
    /// Ask the running bot to shut down gracefully.
    Stop,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Board {
    Givers,
    Receivers,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = DaemonClient::new(&config.daemon.socket_path);
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Run => {
            config.validate()?;
            let slack = Arc::new(SlackTransport::from_config(&config)?);
            run_daemon(config, slack).await?;
        }
        Commands::Migrate => {
            config.ensure_ledger_dir()?;
            let ledger = open_ledger(&config);
            let report = ledger
                .migrate()
                .with_context(|| format!("migrating {}", ledger.path().display()))?;
            info!(path = %ledger.path().display(), "migration finished");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Given { user, range } => {
            let (start, end) = range.resolve(today, None)?;
            println!("{}", client.given_in_range(&user, start, end).await?);
        }
        Commands::Received { user, range } => {
            let (start, end) = range.resolve(today, None)?;
            println!("{}", client.received_in_range(&user, start, end).await?);
        }
        Commands::Givers => {
            for user in client.list_givers().await? {
                println!("{user}");
            }
        }
        Commands::Recipients => {
            for user in client.list_recipients().await? {
                println!("{user}");
            }
        }
        Commands::Top { board, range, limit } => {
            let (start, end) = range.resolve(today, Some(DEFAULT_TOP_DAYS))?;
            let ranking = match board {
                Board::Givers => client.top_givers(start, end, limit).await?,
                Board::Receivers => client.top_receivers(start, end, limit).await?,
            };
            println!("{start} .. {end}");
            if ranking.is_empty() {
                println!("(none)");
            }
            for (rank, row) in ranking.iter().enumerate() {
                println!("{:>3}. {:<12} {}", rank + 1, row.user, row.total);
            }
        }
        Commands::User { user } => {
            let profile = client.user_info(&user).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Status => {
            let status = client
                .get_status()
                .await
                .context("daemon is not reachable; is `beerbot run` active?")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Stop => {
            client
                .graceful_shutdown()
                .await
                .context("daemon is not reachable")?;
            println!("daemon stop requested");
        }
    }

    Ok(())
}
