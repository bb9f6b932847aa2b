use std::sync::Arc;

use sea_orm_migration::MigratorTrait;
use skyport_control::{api, config::Config, images::ImageCatalog, state::AppState};
use skyport_db::{DbKv, KvStore, MemoryKv};

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using in-memory store, nothing will survive a restart");
        return Ok(Arc::new(MemoryKv::new()));
    };

    let db = skyport_db::connect(url).await?;
    // Apply migrations on boot (idempotent).
    skyport_migration::Migrator::up(&db, None).await?;
    Ok(Arc::new(DbKv::new(Arc::new(db))))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let kv = open_store(&config).await?;
    let images = ImageCatalog::load_dir(&config.images_dir).await?;

    let state = AppState::build(config, kv, images)?;

    state.reconciler.resume().await?;
    state.scheduler.start().await?;
    state
        .scheduler
        .spawn_liveness(state.config.workflow_liveness_interval);
    if let Some(every) = state.config.health_interval {
        state.health.clone().spawn(every);
    }

    let addr = state.config.listen_addr;
    let app = api::router(state);
    tracing::info!(%addr, "skyport-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
