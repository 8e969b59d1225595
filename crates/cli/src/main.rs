mod repl;

use std::sync::Arc;
use std::time::Duration;

use ghost_core::config::GhostCfg;
use ghost_core::emotion::PgAffectStore;
use ghost_core::io as transport;
use ghost_core::memory::{Embedder, HashEmbedder, InMemoryStore, PgMemoryStore};
use ghost_core::monitor::HostMonitor;
use ghost_core::runtime::{Runtime, Services, ShutdownGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const OUTPUT_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The REPL owns the terminal, so logs go to a file.
    if std::env::var("RUST_LOG").is_ok() {
        let path = std::env::var("GHOST_LOG_FILE").unwrap_or_else(|_| "/tmp/ghost.log".into());
        let file = std::fs::File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let (pool, notice) = connect_db().await;

    let cfg = match &pool {
        Some(pool) => GhostCfg::load(pool).await?,
        None => GhostCfg::default(),
    }
    .with_env_overrides();
    if let Err(e) = cfg.validate() {
        anyhow::bail!("invalid configuration: {e}");
    }
    let cfg = Arc::new(cfg);

    let Some(ollama) = ghost_llm::ollama::from_env() else {
        anyhow::bail!("GHOST_OLLAMA_MODEL is not set; point it at a model served by Ollama");
    };
    let ollama = Arc::new(ollama);

    let embedder: Arc<dyn Embedder> = match std::env::var("GHOST_EMBEDDER").as_deref() {
        Ok("hash") => Arc::new(HashEmbedder),
        _ => ollama.clone(),
    };
    let services = match pool {
        Some(pool) => {
            let store = Arc::new(PgMemoryStore::new(pool.clone(), cfg.search_window));
            Services::new(ollama, store, embedder).with_affect_store(Arc::new(PgAffectStore::new(pool)))
        }
        None => Services::new(ollama, Arc::new(InMemoryStore::new()), embedder),
    };
    let services = services.with_monitor(Box::new(HostMonitor::new()));
    let shutdown = ShutdownGuard::new();
    let token = shutdown.token();
    let mut runtime = Runtime::with_shutdown(Arc::clone(&cfg), services, shutdown.clone());

    runtime.start();
    shutdown.spawn_signal_listener();
    let (output_rx, _sub) = transport::attach(runtime.bus(), OUTPUT_BUFFER);

    let speaker = std::env::var("USER").unwrap_or_else(|_| "user".into());
    let result = repl::run(&runtime, output_rx, &speaker, token, notice).await;

    runtime.stop().await;
    result
}

/// Connect and migrate if `DATABASE_URL` is set. Any failure falls back to
/// ephemeral mode with a notice for the user.
async fn connect_db() -> (Option<sqlx::PgPool>, Option<String>) {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return (None, None);
    };
    let ephemeral = |reason: &str| {
        Some(format!("note: {reason}; running in ephemeral mode, nothing will be remembered after exit."))
    };

    let connect = tokio::time::timeout(
        Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
        sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url),
    )
    .await;

    match connect {
        Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
            Ok(()) => {
                tracing::info!("database connected and migrations applied");
                (Some(pool), None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                (None, ephemeral("database migration failed"))
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to connect DATABASE_URL, falling back to ephemeral mode");
            (None, ephemeral("could not connect to DATABASE_URL"))
        }
        Err(_) => {
            tracing::warn!(timeout_secs = DB_CONNECT_TIMEOUT_SECS, "database connect timed out, falling back to ephemeral mode");
            (None, ephemeral(&format!("database connect timed out after {DB_CONNECT_TIMEOUT_SECS}s")))
        }
    }
}
