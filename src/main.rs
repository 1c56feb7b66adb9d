use std::sync::Arc;

use classquiz_core::clock::SystemClock;
use classquiz_core::config::Config;
use classquiz_core::llm::http_client::{HttpLlmClient, LlmConfig};
use classquiz_core::llm::LlmClient;
use classquiz_core::logging;
use classquiz_core::random::OsRandom;
use classquiz_core::room_registry::RoomRegistry;
use classquiz_core::store::memory::MemoryStore;
use classquiz_core::store::postgres::PostgresStore;
use classquiz_core::store::Store;
use classquiz_core::{GradingPipeline, QuizEngine, Scheduler};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _file_log_guard = logging::init_tracing(&config.log_level);

    let store: Arc<dyn Store> = if config.database_url.is_empty() {
        tracing::warn!("DATABASE_URL not set, running against an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        match PostgresStore::connect(&config.database_url).await {
            Ok(store) => {
                if let Err(err) = store.migrate().await {
                    tracing::error!(error = %err, "database migration failed");
                    std::process::exit(1);
                }
                Arc::new(store)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to connect to database");
                std::process::exit(1);
            }
        }
    };

    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(LlmConfig::from_env()));
    let registry = RoomRegistry::new(
        Arc::new(SystemClock),
        config.heartbeat_interval,
        config.heartbeat_timeout,
    );
    let engine = Arc::new(QuizEngine::new(
        Arc::clone(&store),
        registry,
        Arc::new(SystemClock),
        Arc::new(OsRandom),
        config.clone(),
    ));
    let _grading_pipeline = Arc::new(GradingPipeline::new(Arc::clone(&store), llm, config.clone()));

    let scheduler = match Scheduler::new().await {
        Ok(scheduler) => scheduler,
        Err(err) => {
            tracing::error!(error = %err, "failed to construct scheduler");
            std::process::exit(1);
        }
    };
    if let Err(err) = scheduler.start(Arc::clone(&engine), Arc::clone(&store), &config).await {
        tracing::error!(error = %err, "failed to start scheduler");
        std::process::exit(1);
    }

    tracing::info!("classquiz-core started");
    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping scheduler");
    scheduler.stop().await;
    tracing::info!("graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
