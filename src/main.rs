use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardgate::config::ShardgateConfig;
use shardgate::ratelimit::{FixedWindowLimiter, Route, RouteRateLimiter};
use shardgate::sim::{self, GlobalPause, SimulatedServer};

#[derive(Parser, Debug)]
#[command(name = "shardgate", version, about = "Client-side rate limiting for sharded services")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive concurrent requests through the limiter against a simulated server
    Simulate {
        /// Route to exercise, as `METHOD path[:major]`; may be repeated
        #[arg(short, long = "route", required = true)]
        routes: Vec<String>,

        /// Requests to send on each route
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: usize,

        /// Server-side limit per route per window
        #[arg(long, default_value_t = 5)]
        limit: u64,

        /// Server-side window length in milliseconds
        #[arg(long, default_value_t = 1000)]
        window_ms: u64,

        /// Announce a global limit on every n-th request
        #[arg(long)]
        global_every: Option<u64>,

        /// Length of each announced global limit in milliseconds
        #[arg(long, default_value_t = 500)]
        global_ms: u64,
    },

    /// Check a named guard rule from the configuration a number of times
    Guard {
        /// Rule name
        rule: String,

        /// Id the rule is applied to
        #[arg(long, default_value = "default")]
        id: String,

        /// Number of checks to perform
        #[arg(short = 'n', long, default_value_t = 1)]
        attempts: usize,
    },
}

// Single-threaded so each task's grant, execution and report happen without
// interleaving, which keeps simulated reports in server order.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ShardgateConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ShardgateConfig::default(),
    };
    info!(
        default_limit = config.limiter.default_limit,
        default_remaining = config.limiter.default_remaining,
        guards = config.guards.len(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Simulate {
            routes,
            requests,
            limit,
            window_ms,
            global_every,
            global_ms,
        } => {
            let routes = routes
                .iter()
                .map(|r| Route::parse(r).with_context(|| format!("invalid route '{}'", r)))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut server = SimulatedServer::new(limit, Duration::from_millis(window_ms));
            if let Some(every) = global_every {
                server = server.with_global_pause(GlobalPause {
                    every,
                    duration: Duration::from_millis(global_ms),
                });
            }

            let limiter = Arc::new(RouteRateLimiter::with_config(&config.limiter));
            let summary = sim::run(limiter, Arc::new(server), &routes, requests).await;

            println!(
                "executed={} rejected={} elapsed_ms={}",
                summary.executed,
                summary.rejected,
                summary.elapsed.as_millis()
            );
            if summary.rejected > 0 {
                anyhow::bail!("server rejected {} requests", summary.rejected);
            }
        }
        Command::Guard { rule, id, attempts } => {
            let guard = config
                .guards
                .get(&rule)
                .with_context(|| format!("no guard rule named '{}'", rule))?;
            let limiter = FixedWindowLimiter::new();

            for attempt in 1..=attempts {
                let check = limiter.check_rule(&id, guard);
                println!(
                    "attempt={} limited={} remaining={}",
                    attempt, check.limited, check.remaining
                );
            }
        }
    }

    Ok(())
}
