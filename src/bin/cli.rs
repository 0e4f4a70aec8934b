//! CLI for locks and rate limits on a shared Redis

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kvguard::common::parse_duration;
use kvguard::{Config, DistributedLock, RateLimit, RedisStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvguard")]
#[command(about = "Distributed locks and rate limits on a shared Redis")]
#[command(version)]
struct Cli {
    /// Redis URL (defaults to the configured store url)
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command while holding a lock
    Lock {
        /// Lock key
        key: String,

        /// Claims older than this are considered abandoned
        #[arg(long)]
        expires: Option<String>,

        /// Give up waiting after this long
        #[arg(long)]
        timeout: Option<String>,

        /// Pause between attempts
        #[arg(long)]
        check_interval: Option<String>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Claim one unit of quota
    Hit {
        resource: String,
        client: String,

        /// Claims allowed per window
        #[arg(long)]
        max_requests: Option<u64>,

        /// Window length
        #[arg(long)]
        expire: Option<String>,

        /// Wait for the next window instead of failing
        #[arg(long)]
        blocking: bool,
    },

    /// Show current usage of a quota
    Usage {
        resource: String,
        client: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear a quota window
    Reset { resource: String, client: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!(version = kvguard::VERSION, "kvguard starting");
    let url = cli.redis_url.unwrap_or_else(|| config.store.url.clone());
    let store = Arc::new(RedisStore::connect(&url).await?);

    match cli.command {
        Commands::Lock {
            key,
            expires,
            timeout,
            check_interval,
            command,
        } => {
            let mut lock_config = config.lock.to_lock_config()?;
            if let Some(expires) = expires {
                lock_config.expires = parse_duration(&expires)?;
            }
            if let Some(timeout) = timeout {
                lock_config.timeout = parse_duration(&timeout)?;
            }
            if let Some(interval) = check_interval {
                lock_config.check_interval = parse_duration(&interval)?;
            }

            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("missing command"))?;
            let lock = DistributedLock::new(store, key, lock_config)?;

            let status = lock
                .with_lock(async {
                    tokio::process::Command::new(program)
                        .args(args)
                        .status()
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await?;

            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
        }

        Commands::Hit {
            resource,
            client,
            max_requests,
            expire,
            blocking,
        } => {
            let mut rl_config = config.rate_limit.to_rate_limit_config()?;
            if let Some(max) = max_requests {
                rl_config.max_requests = max;
            }
            if let Some(expire) = expire {
                rl_config.expire = parse_duration(&expire)?;
            }
            rl_config.blocking = blocking;

            let limit = RateLimit::new(store, resource, client, rl_config)?;
            let scope = limit.enter().await?;
            println!(
                "claimed: usage {}/{}",
                scope.limit().usage().await?,
                limit.config().max_requests
            );
        }

        Commands::Usage {
            resource,
            client,
            json,
        } => {
            let rl_config = config.rate_limit.to_rate_limit_config()?;
            let limit = RateLimit::new(store, resource, client, rl_config)?;
            let usage = limit.usage().await?;
            let ttl = limit.window_ttl().await?;
            let waiting = limit.waiting_for_quota().await?;

            if json {
                let out = serde_json::json!({
                    "key": limit.rate_limit_key(),
                    "usage": usage,
                    "ttl_ms": ttl.map(|t| t.as_millis() as u64),
                    "waiting": waiting,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Quota {}:", limit.rate_limit_key());
                println!("  Usage: {}", usage);
                match ttl {
                    Some(ttl) => println!("  Window resets in: {:?}", ttl),
                    None => println!("  Window: not open"),
                }
                println!("  Waiting: {}", waiting);
            }
        }

        Commands::Reset { resource, client } => {
            let rl_config = config.rate_limit.to_rate_limit_config()?;
            let limit = RateLimit::new(store, resource, client, rl_config)?;
            limit.reset().await?;
            println!("Reset {}", limit.rate_limit_key());
        }
    }

    Ok(())
}
