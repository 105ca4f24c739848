use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handlers::{
    cancel_task, complete_milestone, create_milestones, freeze_task, gateway_webhook,
    get_wallet_balance, health_check, initiate_payment, list_milestones, open_dispute,
    pay_milestone, refund_charge, release_charge, request_withdrawal, resolve_dispute,
    run_auto_release_sweep, run_expiry_sweep, verify_milestone, verify_payment, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Payment lifecycle
                .route("/payments/initiate", post(initiate_payment))
                .route("/payments/:reference/verify", get(verify_payment))
                // Escrow actions
                .route("/escrow/:charge_id/release", post(release_charge))
                .route("/escrow/:charge_id/refund", post(refund_charge))
                .route("/escrow/:charge_id/dispute", post(open_dispute))
                .route("/disputes/:dispute_id/resolve", post(resolve_dispute))
                // Admin task controls
                .route("/tasks/:task_id/freeze", post(freeze_task))
                .route("/tasks/:task_id/cancel", post(cancel_task))
                // Milestones
                .route(
                    "/tasks/:task_id/milestones",
                    post(create_milestones).get(list_milestones),
                )
                .route("/milestones/:milestone_id/pay", post(pay_milestone))
                .route("/milestones/:milestone_id/verify", get(verify_milestone))
                .route("/milestones/:milestone_id/complete", post(complete_milestone))
                // Wallet
                .route("/wallet/balance", get(get_wallet_balance))
                .route("/wallet/withdraw", post(request_withdrawal))
                // Gateway reconciliation
                .route("/webhook/gateway", post(gateway_webhook))
                // Admin sweeps (the scheduler runs these on an interval too)
                .route("/admin/sweeps/auto-release", post(run_auto_release_sweep))
                .route("/admin/sweeps/expiry", post(run_expiry_sweep)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
