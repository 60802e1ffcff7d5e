use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use windowguard::bootstrap::{build_limiter, build_relational, purge_relational};
use windowguard::config::WindowguardConfig;
use windowguard::ratelimit::{Clock, SystemClock};

/// Tiered fixed-window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "windowguard", version, about)]
struct Cli {
    /// YAML configuration file; `WINDOWGUARD__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a key and print one JSON decision per attempt
    Check {
        /// Key to limit, e.g. `user:42`
        #[arg(short, long)]
        key: String,

        /// Maximum requests per window (defaults to the configured value)
        #[arg(short, long)]
        max: Option<u64>,

        /// Window length in milliseconds (defaults to the configured value)
        #[arg(short, long)]
        window_ms: Option<u64>,

        /// Number of consecutive checks
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },
    /// Create the relational counter table
    Migrate,
    /// Delete relational counters whose window has ended
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = WindowguardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Check {
            key,
            max,
            window_ms,
            repeat,
        } => {
            let limiter = build_limiter(&config).await?;
            let max = max.unwrap_or(config.limiter.default_max);
            let window_ms = window_ms.unwrap_or(config.limiter.default_window_ms);

            for _ in 0..repeat {
                let decision = limiter.check_limit(&key, max, window_ms).await?;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Migrate => match build_relational(&config).await? {
            Some(backend) => {
                backend.migrate().await?;
                info!("Migration complete");
            }
            None => anyhow::bail!("relational.url is not configured"),
        },
        Command::Purge => match purge_relational(&config, SystemClock.now_ms()).await? {
            Some(purged) => println!("{}", serde_json::json!({ "purged": purged })),
            None => anyhow::bail!("relational.url is not configured"),
        },
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
