use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    auth::{AuthenticatedUser, Role},
    config::Config,
    error::{AppError, AppResult, GatewayError},
    escrow::{ChargeHandle, EscrowEngine, MilestoneFlow, NewMilestone},
    gateway::{
        signature::{verify_signature, SIGNATURE_HEADER},
        webhook::parse_event,
        WebhookProcessor,
    },
    ledger::{
        models::{
            Actor, Dispute, PaymentMilestone, SecurityEventType, Task, Transaction,
        },
        LedgerRepository,
    },
    settlement::{SettlementSweeps, SweepReport},
    wallet::{WalletBalance, WalletEngine},
    withdrawal::WithdrawalProcessor,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerRepository>,
    pub escrow: Arc<EscrowEngine>,
    pub milestones: Arc<MilestoneFlow>,
    pub wallet: Arc<WalletEngine>,
    pub withdrawals: Arc<WithdrawalProcessor>,
    pub sweeps: Arc<SettlementSweeps>,
    pub webhooks: Arc<WebhookProcessor>,
    pub config: Arc<Config>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /payments/initiate
pub async fn initiate_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<InitiatePaymentRequest>,
) -> AppResult<Json<ChargeHandle>> {
    request.validate()?;
    let handle = state.escrow.initiate_charge(request.task_id, &user).await?;
    Ok(Json(handle))
}

/// GET /payments/:reference/verify
///
/// Poll-and-verify fallback for clients that never got the webhook. Safe to
/// call any number of times.
pub async fn verify_payment(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(reference): Path<String>,
) -> AppResult<Json<VerifyResponse>> {
    let disposition = state.webhooks.verify_charge(&reference).await?;
    Ok(Json(VerifyResponse::new(reference, disposition)))
}

/// POST /escrow/:charge_id/release
pub async fn release_charge(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(charge_id): Path<Uuid>,
) -> AppResult<Json<Transaction>> {
    let (actor, via_client_confirmation) = match user.role {
        Role::Client => (Actor::Client(user.id), true),
        Role::Admin => (Actor::Admin(user.id), false),
        Role::Steward => (Actor::Steward(user.id), false),
    };
    let payout = state
        .escrow
        .release(charge_id, actor, via_client_confirmation)
        .await?;
    Ok(Json(payout))
}

/// POST /escrow/:charge_id/refund
pub async fn refund_charge(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(charge_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> AppResult<Json<Transaction>> {
    request.validate()?;
    let actor = match user.role {
        Role::Client => Actor::Client(user.id),
        Role::Admin => Actor::Admin(user.id),
        Role::Steward => Actor::Steward(user.id),
    };
    let refund = state
        .escrow
        .refund(charge_id, actor, &request.reason)
        .await?;
    Ok(Json(refund))
}

/// POST /escrow/:charge_id/dispute
pub async fn open_dispute(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(charge_id): Path<Uuid>,
    Json(request): Json<DisputeRequest>,
) -> AppResult<Json<Dispute>> {
    request.validate()?;
    let dispute = state
        .escrow
        .dispute(charge_id, &user, &request.reason)
        .await?;
    Ok(Json(dispute))
}

/// POST /disputes/:dispute_id/resolve
pub async fn resolve_dispute(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(dispute_id): Path<Uuid>,
    Json(request): Json<ResolveDisputeRequest>,
) -> AppResult<Json<Dispute>> {
    request.validate()?;
    let dispute = state
        .escrow
        .resolve_dispute(dispute_id, &user, &request.resolution, request.disposition)
        .await?;
    Ok(Json(dispute))
}

/// POST /tasks/:task_id/freeze
pub async fn freeze_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
    Json(request): Json<FreezeRequest>,
) -> AppResult<Json<Task>> {
    request.validate()?;
    let task = state
        .escrow
        .admin_freeze(task_id, &user, &request.reason)
        .await?;
    Ok(Json(task))
}

/// POST /tasks/:task_id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<Task>> {
    let task = state.escrow.admin_cancel(task_id, &user).await?;
    Ok(Json(task))
}

/// POST /tasks/:task_id/milestones
pub async fn create_milestones(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
    Json(request): Json<CreateMilestonesRequest>,
) -> AppResult<Json<Vec<PaymentMilestone>>> {
    request.validate()?;
    let items = request
        .milestones
        .into_iter()
        .map(|m| NewMilestone {
            title: m.title,
            amount: m.amount,
        })
        .collect();
    let created = state.milestones.create_milestones(task_id, &user, items).await?;
    Ok(Json(created))
}

/// GET /tasks/:task_id/milestones
pub async fn list_milestones(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<Vec<PaymentMilestone>>> {
    Ok(Json(state.ledger.list_milestones(task_id).await?))
}

/// POST /milestones/:milestone_id/pay
pub async fn pay_milestone(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(milestone_id): Path<Uuid>,
) -> AppResult<Json<ChargeHandle>> {
    let handle = state.milestones.initiate_charge(milestone_id, &user).await?;
    Ok(Json(handle))
}

/// GET /milestones/:milestone_id/verify
pub async fn verify_milestone(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(milestone_id): Path<Uuid>,
) -> AppResult<Json<VerifyResponse>> {
    let charge = state
        .ledger
        .latest_charge_for_milestone(milestone_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("payment for milestone {}", milestone_id)))?;
    let disposition = state
        .webhooks
        .verify_charge(&charge.provider_reference)
        .await?;
    Ok(Json(VerifyResponse::new(charge.provider_reference, disposition)))
}

/// POST /milestones/:milestone_id/complete
pub async fn complete_milestone(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(milestone_id): Path<Uuid>,
) -> AppResult<Json<PaymentMilestone>> {
    let milestone = state
        .milestones
        .complete_milestone(milestone_id, &user)
        .await?;
    Ok(Json(milestone))
}

/// GET /wallet/balance
pub async fn get_wallet_balance(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<WalletBalance>> {
    if user.role != Role::Steward {
        return Err(AppError::Forbidden(
            "Only stewards have an earnings wallet".to_string(),
        ));
    }
    let balance = state.wallet.get_balance(user.id).await?;
    Ok(Json(balance))
}

/// POST /wallet/withdraw
pub async fn request_withdrawal(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<WithdrawRequest>,
) -> AppResult<Json<Transaction>> {
    request.validate()?;
    let payout = state
        .withdrawals
        .request_withdrawal(&user, request.amount, &request.recipient_code)
        .await?;
    Ok(Json(payout))
}

/// POST /webhook/gateway
///
/// Signature failures are rejected with 401 and audited. Once the signature
/// checks out the provider always gets a 200; our own settlement problems are
/// logged, not bounced back into the provider's retry loop.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if verify_signature(
        state.config.gateway_webhook_secret.as_bytes(),
        &body,
        signature,
    )
    .is_err()
    {
        let _ = state
            .ledger
            .record_security_event(
                SecurityEventType::WebhookRejected,
                "gateway",
                None,
                None,
                serde_json::json!({ "reason": "invalid signature" }),
            )
            .await;
        return Err(GatewayError::InvalidSignature.into());
    }

    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Unparseable gateway webhook acknowledged: {}", e);
            return Ok(Json(WebhookAck { received: true }));
        }
    };

    let event_name = event.event.clone();
    match state.webhooks.process_event(event).await {
        Ok(disposition) => {
            info!("Webhook {} -> {:?}", event_name, disposition);
        }
        Err(e) => {
            warn!("Webhook {} acknowledged but not settled: {}", event_name, e);
        }
    }
    Ok(Json(WebhookAck { received: true }))
}

/// POST /admin/sweeps/auto-release
pub async fn run_auto_release_sweep(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<SweepReport>> {
    if !user.is_admin() {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }
    Ok(Json(state.sweeps.run_auto_release().await?))
}

/// POST /admin/sweeps/expiry
pub async fn run_expiry_sweep(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<SweepReport>> {
    if !user.is_admin() {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }
    Ok(Json(state.sweeps.run_expiry().await?))
}
