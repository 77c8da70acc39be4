use coinshop_api::{
    app, build_state,
    clients::{ChatClient, DeliveryClient, DiscordRestClient, GameApiClient, MercadoPagoGateway, PaymentGateway},
    config, db, events,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(config::load_config()?);
    config::init_tracing(config.log_level(), config.log_json);
    info!(environment = %config.environment, "starting coin shop service");

    let pool = db::establish_connection(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let db = Arc::new(pool);

    let gateway: Arc<dyn PaymentGateway> = Arc::new(MercadoPagoGateway::new(&config)?);
    let delivery: Arc<dyn DeliveryClient> = Arc::new(GameApiClient::new(&config)?);
    let chat: Arc<dyn ChatClient> = Arc::new(DiscordRestClient::new(&config)?);

    let (state, event_rx) = build_state(
        Arc::clone(&config),
        db,
        gateway,
        delivery,
        Arc::clone(&chat),
    );

    tokio::spawn(events::process_events(
        event_rx,
        chat,
        config.log_channel_id.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shut down cleanly");
    Ok(())
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
