use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use rag_embedding_worker::embedding::HttpEmbedderClient;
use rag_embedding_worker::vector_index::{DbPool, PgVectorIndex};

mod config;
mod handlers;
mod security;
mod services;
mod utils;

use config::Settings;
use security::{CustomHeaderValidator, IpWhitelist};
use services::{ConversationImageStore, ConversationStore, RetrievalEngine};

const MAX_IMAGES_PER_CONVERSATION: usize = 200;
const MAX_TRACKED_IMAGES_TOTAL: usize = 20_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,rag_api_server=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("starting rag-api-server");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let db_pool = DbPool::connect(&settings.vector_index).await?;
    let vector_index: Arc<PgVectorIndex> = Arc::new(PgVectorIndex::new(
        db_pool,
        settings.vector_index.collection.clone(),
    ));

    let embedder: Arc<HttpEmbedderClient> = Arc::new(HttpEmbedderClient::new(
        settings.embedding.base_url.clone(),
        settings.embedding.model.clone(),
        settings.embedding.api_key.clone(),
        Duration::from_secs(60),
    )?);

    let retrieval_engine = Arc::new(RetrievalEngine::new(
        embedder,
        vector_index,
        settings.embedding.api_key.is_some(),
    ));
    let image_store = Arc::new(ConversationImageStore::new(
        MAX_IMAGES_PER_CONVERSATION,
        MAX_TRACKED_IMAGES_TOTAL,
    ));
    let conversation_store = Arc::new(ConversationStore::new());

    let ip_whitelist = Arc::new(IpWhitelist::new(
        settings.config_path(),
        settings.security.allowed_ips.clone(),
    )?);
    (*ip_whitelist).clone().start_watcher()?;
    info!("IP whitelist watcher started");

    let header_validator = Arc::new(CustomHeaderValidator::new(
        settings.security.custom_headers.app_id.clone(),
        settings.security.custom_headers.api_key.clone(),
        settings.security.custom_headers.request_signature == "enabled",
        settings.security.custom_headers.timestamp_tolerance,
    ));

    let app = build_router(
        retrieval_engine,
        image_store,
        conversation_store,
        settings.retrieval.clone(),
        ip_whitelist,
        header_validator,
    );

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_router(
    retrieval_engine: Arc<RetrievalEngine>,
    image_store: Arc<ConversationImageStore>,
    conversation_store: Arc<ConversationStore>,
    retrieval_config: config::RetrievalConfig,
    ip_whitelist: Arc<IpWhitelist>,
    header_validator: Arc<CustomHeaderValidator>,
) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let protected_routes = Router::new()
        .route("/api/retrieve", post(handlers::search::search_handler))
        .route(
            "/api/conversations/:conversation_id/images",
            get(handlers::images::list_images_handler),
        )
        .route(
            "/api/conversations/:conversation_id",
            axum::routing::delete(handlers::conversations::delete_conversation_handler),
        )
        .layer(middleware::from_fn(security::middleware::security_middleware))
        .layer(Extension(retrieval_engine))
        .layer(Extension(image_store))
        .layer(Extension(conversation_store))
        .layer(Extension(retrieval_config))
        .layer(Extension(ip_whitelist))
        .layer(Extension(header_validator));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
}
