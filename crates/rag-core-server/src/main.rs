use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use rag_core_server::config::Settings;
use rag_core_server::handlers;
use rag_core_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,rag_core_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting document analysis core...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    let state = AppState::build(settings).await?;
    info!("Subsystems wired");

    // opt-in cache warm-up with the most-accessed embeddings
    let warmed = state.embedding_cache.warm_startup().await;
    if warmed > 0 {
        info!("Cache warm-up loaded {} entries", warmed);
    }

    // hourly maintenance: expired cache entries and aged-out
    // intervention tasks
    {
        let cache = state.embedding_cache.clone();
        let interventions = state.interventions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.cleanup().await;
                if removed > 0 {
                    info!("Cache cleanup removed {} entries", removed);
                }
                match interventions.prune().await {
                    Ok(pruned) if pruned > 0 => {
                        info!("Pruned {} resolved intervention tasks", pruned)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Intervention pruning failed: {}", e),
                }
            }
        });
    }

    let addr = SocketAddr::from((
        state.settings.server.host.parse::<std::net::IpAddr>()?,
        state.settings.server.port,
    ));

    let app = build_router(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/analyze", post(handlers::analyze::analyze_document))
        .route("/api/batch", post(handlers::analyze::process_batch))
        .route("/api/chat", post(handlers::chat::chat_handler))
        .route("/api/cache/warm", post(handlers::cache::cache_warm))
        .route("/api/cache/stats", get(handlers::cache::cache_stats))
        .route(
            "/api/circuit-breakers",
            get(handlers::health::circuit_breakers),
        )
        .route(
            "/api/circuit-breakers/reset",
            post(handlers::health::reset_circuit_breakers),
        )
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
