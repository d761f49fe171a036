use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use kittyparty_server::relay::{Relay, RetryConfig};
use kittyparty_server::tunnel;
use kittyparty_server::{db, AppError, AppState, PgChangeFeed, RoomRegistry, Settings};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> kittyparty_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!("Configuration loaded ({} environment)", config.environment);

    // The initial database connection is the only fatal startup dependency
    let pool = db::connect(&config.database).await?;
    if config.database.run_migrations {
        db::run_migrations(&pool).await?;
    }

    let registry = RoomRegistry::new();
    let feed = Arc::new(PgChangeFeed::new(pool.clone()));
    let relay = Arc::new(Relay::new(
        feed,
        registry.clone(),
        RetryConfig::from(&config.relay),
    ));

    let relay_task = {
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                error!("Change relay terminated: {}", e);
            }
        })
    };

    let state = web::Data::new(AppState::new(
        config.clone(),
        pool,
        registry,
        relay.status(),
    ));

    // Create and bind TCP listener
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    let local_addr = listener.local_addr()?;
    info!("Server running on http://{}", local_addr);
    info!("WebSocket endpoint ready at ws://{}/ws", local_addr);

    let cors_config = config.cors.clone();
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(kittyparty_server::build_cors(&cors_config))
            .app_data(server_state.clone())
            .configure(kittyparty_server::configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run();

    // The tunnel only starts once the server is listening
    let tunnel_task = if config.is_production() {
        None
    } else {
        let target = if local_addr.ip().is_unspecified() {
            SocketAddr::from((Ipv4Addr::LOCALHOST, local_addr.port()))
        } else {
            local_addr
        };
        Some(tunnel::spawn(config.tunnel.clone(), target))
    };

    server
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    if let Some(task) = tunnel_task {
        task.abort();
    }

    info!("Server stopped, shutting down relay");
    relay.stop();
    if let Err(e) = relay_task.await {
        warn!("Relay task did not finish cleanly: {}", e);
    }
    state.shutdown().await?;

    Ok(())
}
