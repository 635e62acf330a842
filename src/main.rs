use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::info;

use loginguard::config::{BackendConfig, BackendKind, LoginGuardConfig};
use loginguard::ratelimit::{
    CounterStore, MemoryCounterStore, RateLimitKey, RateLimiter, RedisCounterStore,
};

/// Per-key rate limiting for login attempts.
#[derive(Debug, Parser)]
#[command(name = "loginguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "LOGINGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests against a key and print each decision as JSON
    Check {
        #[command(flatten)]
        key: KeyArgs,

        /// Number of requests to count
        #[arg(short = 'n', long, default_value_t = 1)]
        attempts: u32,
    },
    /// Print the live counter for a key as JSON, or null
    Inspect {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Remove the counter for a key so its next request opens a new window
    Reset {
        #[command(flatten)]
        key: KeyArgs,
    },
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Full rate limit key, e.g. `login:a@example.com`
    #[arg(long, conflicts_with_all = ["action", "identity"], required_unless_present = "identity")]
    key: Option<String>,

    /// Action part of the key
    #[arg(long, default_value = "login")]
    action: String,

    /// Identity part of the key, e.g. an email address
    #[arg(long)]
    identity: Option<String>,
}

impl KeyArgs {
    fn resolve(&self) -> anyhow::Result<String> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        let identity = self
            .identity
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("either --key or --identity is required"))?;
        let key = if self.action.eq_ignore_ascii_case(loginguard::ratelimit::LOGIN_ACTION) {
            RateLimitKey::login(identity)?
        } else {
            RateLimitKey::new(&self.action, identity)?
        };
        Ok(key.to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = LoginGuardConfig::load(cli.config.as_deref())?;
    loginguard::telemetry::init(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting loginguard");
    info!(
        limit = config.limiter.limit,
        window_secs = config.limiter.window_secs,
        backend = ?config.backend.kind,
        "Configuration loaded"
    );

    let (store, sweeper) = build_store(&config.backend).await?;
    let limiter = RateLimiter::with_policy(store, config.limiter.policy()?);

    tokio::select! {
        result = run(cli.command, &limiter) => result?,
        _ = shutdown_signal() => {}
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}

async fn build_store(
    backend: &BackendConfig,
) -> anyhow::Result<(Arc<dyn CounterStore>, Option<tokio::task::JoinHandle<()>>)> {
    match backend.kind {
        BackendKind::Memory => {
            let store = MemoryCounterStore::new();
            let sweeper = (backend.sweep_interval_secs > 0).then(|| {
                store.spawn_sweeper(std::time::Duration::from_secs(backend.sweep_interval_secs))
            });
            info!("Using in-memory counter store");
            Ok((Arc::new(store), sweeper))
        }
        BackendKind::Redis => {
            let store = RedisCounterStore::connect_with(
                &backend.redis_url,
                &backend.key_prefix,
                backend.connect_options(),
            )
            .await?;
            Ok((Arc::new(store), None))
        }
    }
}

async fn run(
    command: Command,
    limiter: &RateLimiter<Arc<dyn CounterStore>>,
) -> anyhow::Result<()> {
    match command {
        Command::Check { key, attempts } => {
            let key = key.resolve()?;
            for _ in 0..attempts {
                let status = limiter.check(&key).await?;
                println!("{}", serde_json::to_string(&status)?);
            }
        }
        Command::Inspect { key } => {
            let key = key.resolve()?;
            let record = limiter.inspect(&key).await?;
            println!("{}", serde_json::to_string(&record)?);
        }
        Command::Reset { key } => {
            let key = key.resolve()?;
            let removed = limiter.reset(&key).await?;
            println!("{}", serde_json::json!({ "key": key, "removed": removed }));
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
