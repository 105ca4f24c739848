mod api;
mod auth;
mod bootstrap;
mod config;
mod error;
mod escrow;
mod gateway;
mod ledger;
mod server;
mod settlement;
mod wallet;
mod withdrawal;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,escrow_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting Escrow & Wallet Ledger");

    dotenv::dotenv().ok();
    let config = config::Config::from_env().map_err(error::AppError::from)?;
    let bind_address = config.bind_address.clone();

    let state = bootstrap::initialize_app_state(config).await?;

    let app = server::create_app(state).await;
    server::run_server(app, &bind_address).await?;

    Ok(())
}
