use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    api::handlers::AppState,
    config::Config,
    error::AppResult,
    escrow::{EscrowEngine, MilestoneFlow},
    gateway::{HttpGateway, PaymentGateway, WebhookProcessor},
    ledger::LedgerRepository,
    settlement::{SettlementSweeps, SweepScheduler},
    wallet::WalletEngine,
    withdrawal::{WithdrawalPolicy, WithdrawalProcessor},
};

pub async fn initialize_app_state(config: Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;
    let ledger = Arc::new(LedgerRepository::new(pool));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_secret_key.clone(),
    ));
    info!("✅ Payment gateway client initialized ({})", config.gateway_base_url);

    let escrow = Arc::new(EscrowEngine::new(
        ledger.clone(),
        gateway.clone(),
        config.platform_fee_rate,
    ));
    let milestones = Arc::new(MilestoneFlow::new(
        ledger.clone(),
        gateway.clone(),
        config.platform_fee_rate,
    ));
    info!("✅ Escrow engine initialized (fee rate {})", config.platform_fee_rate);

    let wallet = Arc::new(WalletEngine::new(
        ledger.clone(),
        config.default_currency.clone(),
    ));

    let policy = WithdrawalPolicy {
        minimum: config.min_withdrawal,
        fixed_fee: config.withdrawal_fixed_fee,
        percent_rate: config.withdrawal_percent_fee,
        fee_cap: config.withdrawal_fee_cap,
    };
    let withdrawals = Arc::new(WithdrawalProcessor::new(
        ledger.clone(),
        wallet.clone(),
        gateway.clone(),
        policy,
    ));
    info!("✅ Withdrawal processor initialized (min {})", config.min_withdrawal);

    let sweeps = Arc::new(SettlementSweeps::new(
        ledger.clone(),
        escrow.clone(),
        gateway.clone(),
        config.auto_release_after_hours,
    ));

    let webhooks = Arc::new(WebhookProcessor::new(
        ledger.clone(),
        escrow.clone(),
        milestones.clone(),
    ));

    // Background settlement loop
    let scheduler = SweepScheduler::new(config.sweep_interval_secs, sweeps.clone());
    scheduler.start();
    info!(
        "✅ Settlement scheduler started (every {}s, auto-release after {}h)",
        config.sweep_interval_secs, config.auto_release_after_hours
    );

    Ok(AppState {
        ledger,
        escrow,
        milestones,
        wallet,
        withdrawals,
        sweeps,
        webhooks,
        config: Arc::new(config),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
