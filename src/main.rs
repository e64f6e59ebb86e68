use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{RateLimiter, Rule};

/// Token bucket rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume tokens and print one JSON decision per attempt
    Check {
        /// Rule to apply
        #[arg(short, long, default_value = "default")]
        rule: String,

        /// Identity the bucket belongs to
        #[arg(short, long)]
        identity: String,

        /// Tokens to take per attempt
        #[arg(short, long, default_value_t = 1)]
        tokens: u64,

        /// Number of attempts
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Print the normalized rules as JSON
    Rules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    let limiter = RateLimiter::from_config(&config.rate_limiting).await;

    match cli.command {
        Command::Check {
            rule,
            identity,
            tokens,
            repeat,
        } => {
            for _ in 0..repeat {
                let decision = limiter.consume_tokens(&rule, &identity, tokens).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Rules => {
            let mut rules: Vec<&Rule> = limiter.rules().iter().collect();
            rules.sort_by(|a, b| a.name.cmp(&b.name));
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
    }

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}
