use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use playroom::auth::ConfigAuth;
use playroom::config;
use playroom::gateway::{AppState, router};
use playroom::persist::TracingSink;
use playroom::room::Registry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playroom=info")),
        )
        .init();

    config::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT");

    let auth = Arc::new(ConfigAuth::new(config::load_sessions(), config::load_content()));

    let state = AppState {
        registry: Registry::new(),
        identity: auth.clone(),
        directory: auth,
        sink: Arc::new(TracingSink),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("Playroom game server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}
