//! Standalone engine daemon: loads config, starts the supervisor, binds
//! the admin HTTP surface, and runs until `ctrl_c`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use dagrunner_engine::backend::{BackendContract, LocalShellBackend};
use dagrunner_engine::cache::{CacheIndex, InMemoryCacheIndex};
use dagrunner_engine::config::EngineConfig;
use dagrunner_engine::io::{IoCapability, LocalIo};
use dagrunner_engine::persistence::{InMemoryPersistence, PersistenceAdapter, PostgresPersistence};
use dagrunner_engine::supervisor::Supervisor;
use dagrunner_engine::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load()?;
    let _telemetry_guard = init_telemetry(config.telemetry_config());

    tracing::info!("dagrunner-engine starting...");

    let persistence: Arc<dyn PersistenceAdapter> = match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url).await?;
            tracing::info!("connected to Postgres persistence");
            Arc::new(PostgresPersistence::new(pool))
        }
        None => {
            tracing::info!("DAGRUNNER__DATABASE_URL unset, using in-memory persistence");
            Arc::new(InMemoryPersistence::new())
        }
    };
    let cache: Arc<dyn CacheIndex> = Arc::new(InMemoryCacheIndex::new());

    let work_dir = std::env::temp_dir().join("dagrunner-engine");
    let mut backends: HashMap<String, Arc<dyn BackendContract>> = HashMap::new();
    backends.insert("local".into(), Arc::new(LocalShellBackend::new(work_dir)));

    let io: Arc<dyn IoCapability> = Arc::new(LocalIo);
    let (supervisor, mut metadata_rx) = Supervisor::new(
        config.supervisor_config(),
        persistence.clone(),
        cache.clone(),
        backends,
        io,
    );
    let supervisor = Arc::new(supervisor);
    tokio::spawn(async move {
        while let Some(event) = metadata_rx.recv().await {
            tracing::debug!(?event, "metadata event");
        }
    });

    let app = dagrunner_engine::http::router(supervisor.clone(), persistence, cache);
    let listener = tokio::net::TcpListener::bind(config.http_bind_addr).await?;
    tracing::info!(addr = %config.http_bind_addr, "admin HTTP surface listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
