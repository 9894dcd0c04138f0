use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use notify_core::{
    format_duration, AdmissionController, EventStore, InMemoryEventStore, RuleCatalog,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod routes;
mod state;

use state::{AppState, LogNotifier};

const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);

#[derive(Parser, Debug)]
#[command(name = "notifyd", version, about = "Notification admission daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, env = "NOTIFYD_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    #[arg(long, env = "NOTIFYD_RULES", default_value = "./rules.json")]
    rules: PathBuf,

    #[arg(long, env = "NOTIFYD_BACKEND", value_enum, default_value_t = Backend::Memory)]
    backend: Backend,

    #[arg(long, env = "NOTIFYD_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, default_value = "notify:events:")]
    redis_prefix: String,

    #[arg(long, default_value_t = 500)]
    redis_timeout_ms: u64,

    /// Seconds between event log compactions; 0 disables.
    #[arg(long, default_value_t = 60)]
    compact_interval: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Redis,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommands {
    Check,
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(command) = &cli.command {
        return handle_admin(command, &cli);
    }

    let catalog = RuleCatalog::load(&cli.rules)
        .with_context(|| format!("load rules from {}", cli.rules.display()))?;
    let retention = catalog.max_window().unwrap_or(DEFAULT_RETENTION);
    let store = build_store(&cli, retention).await?;
    info!(backend = store.name(), rules = catalog.len(), "event store ready");

    let admission = Arc::new(AdmissionController::new(Arc::new(catalog), store));
    spawn_compaction(admission.clone(), cli.compact_interval);

    let app = routes::router(AppState::new(admission, Arc::new(LogNotifier)));
    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("bind {}", cli.bind))?;
    info!(bind = %cli.bind, "notifyd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")?;
    info!("notifyd stopped");
    Ok(())
}

fn handle_admin(command: &Commands, cli: &Cli) -> Result<()> {
    let catalog = RuleCatalog::load(&cli.rules)
        .with_context(|| format!("load rules from {}", cli.rules.display()))?;
    match command {
        Commands::Rules { command } => match command {
            RulesCommands::Check => {
                println!("{} rules ok", catalog.len());
            }
            RulesCommands::List => {
                for rule in catalog.rules() {
                    println!(
                        "{} max={} window={}",
                        rule.event_type,
                        rule.max_count,
                        format_duration(rule.window)
                    );
                }
            }
        },
    }
    Ok(())
}

async fn build_store(cli: &Cli, retention: Duration) -> Result<Arc<dyn EventStore>> {
    match cli.backend {
        Backend::Memory => Ok(Arc::new(InMemoryEventStore::new(retention))),
        Backend::Redis => connect_redis(cli, retention).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(cli: &Cli, retention: Duration) -> Result<Arc<dyn EventStore>> {
    use notify_core::{RedisEventStore, RedisStoreConfig};

    let url = cli
        .redis_url
        .as_deref()
        .context("--redis-url is required for the redis backend")?;
    let config = RedisStoreConfig {
        key_prefix: cli.redis_prefix.clone(),
        timeout: Duration::from_millis(cli.redis_timeout_ms),
        retention,
    };
    let store = RedisEventStore::connect(url, config)
        .await
        .context("connect to redis")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_cli: &Cli, _retention: Duration) -> Result<Arc<dyn EventStore>> {
    anyhow::bail!("redis backend selected but notifyd was built without the redis feature")
}

fn spawn_compaction(admission: Arc<AdmissionController>, every_secs: u64) {
    if every_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // failures are logged by the controller
            let _ = admission.compact().await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
