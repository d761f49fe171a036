pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod relay;
pub mod tunnel;
pub mod websocket;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, HttpResponse};
use sqlx::PgPool;
use tokio::sync::watch;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use feed::{ChangeEvent, ChangeFeed, ChannelChangeFeed, PgChangeFeed};
pub use relay::{Relay, RelayState, RetryConfig};
pub use websocket::{ConnectionId, RoomRegistry};

/// Health check endpoint handler
/// Returns server status, relay state and connection counts
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let relay = *state.relay_status.borrow();

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "relay": relay,
        "connections": state.registry.connection_count().await,
        "rooms": state.registry.room_count().await,
        "database": db::pool_status(&state.db_pool),
    }))
}

/// Readiness endpoint: 200 only while the relay holds a live subscription
pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let relay = *state.relay_status.borrow();
    let body = serde_json::json!({
        "ready": relay.is_watching(),
        "relay": relay,
    });

    if relay.is_watching() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Registers every route served on the shared listener.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/ready", web::get().to(readiness))
        .route("/ws", web::get().to(websocket::websocket_route));
}

pub fn build_cors(config: &config::CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["Authorization", "Content-Type"])
    };

    cors.max_age(config.max_age as usize)
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub db_pool: Arc<PgPool>,
    pub registry: RoomRegistry,
    pub relay_status: watch::Receiver<RelayState>,
}

impl AppState {
    pub fn new(
        config: Settings,
        db_pool: PgPool,
        registry: RoomRegistry,
        relay_status: watch::Receiver<RelayState>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db_pool: Arc::new(db_pool),
            registry,
            relay_status,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.db_pool.close().await;
        Ok(())
    }
}
