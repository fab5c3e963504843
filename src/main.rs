use axum::Router;
use tokio::net::TcpListener;

use anyhow::anyhow;

use parla::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();

    // Create application state and bring up switch connections
    let app_state = AppState::new(config).await?;
    app_state.start().await;

    // Status surface: health + session/campaign queries
    let app = Router::new()
        .route("/", axum::routing::get(parla::handlers::api::health_check))
        .merge(routes::api::create_api_router())
        .with_state(app_state);

    let listener = TcpListener::bind(&address).await?;
    println!("Server listening on {address}");

    axum::serve(listener, app).await?;

    Ok(())
}
