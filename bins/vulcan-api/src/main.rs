mod handlers;
mod requests;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use vulcan_common::bus::RequestClient;
use vulcan_common::config::{env_or, redis_url};

/// Archive uploads comfortably exceed the default body cap.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub struct AppState {
    pub redis: ConnectionManager,
    pub client: RequestClient,
    pub reply_timeout: Duration,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    dotenvy::dotenv().ok();

    info!("Vulcan API booting...");

    let url = redis_url();
    let client = redis::Client::open(url.as_str()).expect("Failed to create Redis client");
    let redis_conn = ConnectionManager::new(client)
        .await
        .expect("Failed to connect to Redis");
    info!("Connected to Redis: {}", url);

    // Each instance owns its own reply queue; the consumer task funnels
    // replies back into the handlers awaiting them.
    let instance = format!("api-{}", Uuid::new_v4().simple());
    let request_client = RequestClient::new(redis_conn.clone(), instance.clone());
    let _reply_consumer = request_client.spawn_reply_consumer();
    info!(instance = %instance, "reply consumer started");

    let state = Arc::new(AppState {
        redis: redis_conn,
        client: request_client,
        reply_timeout: handlers::reply_deadline(),
    });

    let app = routes::routes()
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", env_or("PORT", "3000"));
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind to address");

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept uploads");

    axum::serve(listener, app).await.expect("Server error");
}
