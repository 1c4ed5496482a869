use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tracing::info;

use coedit::bus::{Bus, InMemoryBus, RedisBus};
use coedit::config::{AppConfig, Cli};
use coedit::document::{DocumentStore, InMemoryDocumentStore};
use coedit::oplog::{InMemoryOperationLog, OperationLog};
use coedit::queue::{InboundQueue, InMemoryQueue, ProcessingLease, RedisQueue};
use coedit::registry::ConnectionRegistry;
use coedit::session::{self, AppState};
use coedit::{auth, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse_args();
    logging::initialize(cli.debug);

    let config = AppConfig::from(&cli);
    let state = build_state(&config)?;

    let app = Router::new()
        .route("/ws/:document_id", get(session::upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}

fn build_state(config: &AppConfig) -> Result<AppState> {
    let (queue, lease, bus): (Arc<dyn InboundQueue>, Arc<dyn ProcessingLease>, Arc<dyn Bus>) =
        match &config.redis_url {
            Some(url) => {
                info!("using Redis-backed queue and bus");
                let client = redis::Client::open(url.as_str()).context("invalid Redis URL")?;
                let redis_queue = Arc::new(RedisQueue::new(client.clone()));
                (
                    redis_queue.clone(),
                    redis_queue,
                    Arc::new(RedisBus::new(client)),
                )
            }
            None => {
                info!("using in-memory queue and bus (single-process only)");
                let memory_queue = Arc::new(InMemoryQueue::new());
                (
                    memory_queue.clone(),
                    memory_queue,
                    Arc::new(InMemoryBus::new()),
                )
            }
        };

    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let oplog: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
    let identity_resolver = Arc::new(auth::StaticIdentityResolver::new());

    Ok(AppState {
        store,
        oplog,
        bus,
        queue,
        lease,
        registry: ConnectionRegistry::spawn(),
        identity_resolver,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutting down");
}
