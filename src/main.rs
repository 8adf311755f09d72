mod config;
mod registry;
mod relay;
mod routes;
mod state;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Optional; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let config = config::BridgeConfig::from_env().expect("invalid bridge configuration");
    let port = config.listen_port;
    tracing::info!(
        upstream = %config.upstream,
        max_relays = ?config.max_relays,
        "upstream endpoint configured"
    );

    let state = state::AppState::new(config);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "wsbridge listening");
    axum::serve(listener, app).await.expect("server failed");
}
