use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{require_trust_level, AuthenticatedUser, Role, TrustLevel};
use crate::error::{AppError, AppResult, EscrowError};
use crate::escrow::transitions::{plan_dispute, plan_refund, plan_release};
use crate::gateway::client::{CreateChargeRequest, PaymentGateway};
use crate::ledger::models::*;
use crate::ledger::repository::NewTransaction;
use crate::ledger::LedgerRepository;

/// Gateway-redirect handle returned by charge initiation. The reference is
/// the transaction id, reused as the provider's idempotency reference.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeHandle {
    pub transaction_id: Uuid,
    pub reference: String,
    pub authorization_url: String,
    pub amount: Decimal,
    pub platform_fee: Decimal,
}

/// Outcome of a held-confirmation. Re-delivery of the same provider event is
/// a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Held,
    AlreadyHeld,
}

/// What to do with the money when an admin resolves a dispute. `None` leaves
/// the charge DISPUTED; a follow-up release/refund stays a deliberate action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeDisposition {
    ReleaseToSteward,
    RefundToClient,
    None,
}

/// The escrow state machine over the ledger.
///
/// Every multi-record effect (charge update + companion record + task update)
/// commits or aborts as one unit, and re-validates the escrow integrity
/// invariant inside that same transaction boundary.
pub struct EscrowEngine {
    ledger: Arc<LedgerRepository>,
    gateway: Arc<dyn PaymentGateway>,
    fee_rate: Decimal,
}

impl EscrowEngine {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        gateway: Arc<dyn PaymentGateway>,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            ledger,
            gateway,
            fee_rate,
        }
    }

    /// Create a PENDING charge for the task's agreed price and hand back the
    /// provider redirect. Rejects if the task is not owned by the requesting
    /// client.
    pub async fn initiate_charge(
        &self,
        task_id: Uuid,
        user: &AuthenticatedUser,
    ) -> AppResult<ChargeHandle> {
        let task = self
            .ledger
            .get_task(task_id)
            .await?
            .filter(|t| !t.is_system)
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        if !task.is_owned_by(user.id) {
            return Err(AppError::Forbidden(
                "Only the task's client can initiate payment".to_string(),
            ));
        }
        if !matches!(
            task.status,
            TaskStatus::Open | TaskStatus::Assigned | TaskStatus::InProgress
        ) {
            return Err(EscrowError::TaskNotEligible(format!(
                "task is {}",
                task.status
            ))
            .into());
        }

        let amount = task.agreed_price;
        let platform_fee = (amount * self.fee_rate).round_dp(2);

        let mut tx = self.ledger.begin_tx().await?;
        // SECURITY: one escrowed charge per task, checked before creating a
        // second payment path for the same money
        let escrowed = self.ledger.count_escrowed_charges(&mut tx, task_id).await?;
        if escrowed > 0 {
            return Err(
                EscrowError::TaskNotEligible("task already has funds in escrow".to_string()).into(),
            );
        }
        let charge = self
            .ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: Some(task_id),
                    milestone_id: None,
                    amount,
                    platform_fee,
                    tx_type: TransactionType::Charge,
                    status: TransactionStatus::Pending,
                    metadata: TransactionMetadata::ChargeInitiated {
                        initiated_by: Actor::Client(user.id),
                        at: Utc::now(),
                    },
                },
            )
            .await?;
        tx.commit().await?;

        let session = match self
            .gateway
            .create_charge(CreateChargeRequest {
                reference: charge.provider_reference.clone(),
                amount,
                currency: task.currency.clone(),
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                // Failure is recorded, not silently dropped
                self.fail_charge(charge.id, &format!("charge initiation failed: {}", e))
                    .await?;
                return Err(e.into());
            }
        };

        info!("💳 Charge {} initiated for task {}", charge.id, task_id);

        Ok(ChargeHandle {
            transaction_id: charge.id,
            reference: charge.provider_reference,
            authorization_url: session.authorization_url,
            amount,
            platform_fee,
        })
    }

    /// PENDING → HELD from a confirmed provider event. Idempotent: a charge
    /// already HELD is success, not an error, so webhook delivery and a
    /// concurrent poll-and-verify can both land safely.
    pub async fn confirm_held(
        &self,
        reference: &str,
        provider_transaction_id: &str,
    ) -> AppResult<ConfirmOutcome> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_by_reference_for_update(&mut tx, reference, TransactionType::Charge)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", reference)))?;

        match crate::escrow::transitions::plan_confirm_held(&charge)? {
            crate::escrow::transitions::ConfirmPlan::AlreadyConfirmed => {
                return Ok(ConfirmOutcome::AlreadyHeld);
            }
            crate::escrow::transitions::ConfirmPlan::Confirm => {}
        }

        let task_id = charge
            .task_id
            .ok_or_else(|| AppError::Internal("escrow charge without task".to_string()))?;

        // SECURITY: confirming this charge must not create a second HELD
        // charge for the task
        let held = self.ledger.count_held_charges(&mut tx, task_id).await?;
        if held != 0 {
            self.log_integrity_violation(task_id, Some(charge.id), Actor::System, held + 1)
                .await;
            return Err(EscrowError::IntegrityViolation {
                task_id,
                held_count: held + 1,
            }
            .into());
        }

        let confirmed = self
            .ledger
            .confirm_charge_held(
                &mut tx,
                charge.id,
                provider_transaction_id,
                &TransactionMetadata::ChargeConfirmed {
                    provider_transaction_id: provider_transaction_id.to_string(),
                    confirmed_at: Utc::now(),
                },
            )
            .await?;
        if !confirmed {
            return Err(EscrowError::InvalidStateTransition {
                current: charge.status.to_string(),
                requested: TransactionStatus::Pending.to_string(),
            }
            .into());
        }
        tx.commit().await?;

        info!("✓ Charge {} confirmed HELD", charge.id);
        Ok(ConfirmOutcome::Held)
    }

    /// Mark a PENDING charge FAILED (declined charge, failed initiation).
    pub async fn fail_charge(&self, charge_id: Uuid, reason: &str) -> AppResult<bool> {
        let mut tx = self.ledger.begin_tx().await?;
        let flipped = self
            .ledger
            .fail_pending_transaction(
                &mut tx,
                charge_id,
                &TransactionMetadata::ChargeFailed {
                    reason: reason.to_string(),
                    at: Utc::now(),
                },
            )
            .await?;
        tx.commit().await?;
        if flipped {
            warn!("Charge {} marked FAILED: {}", charge_id, reason);
        }
        Ok(flipped)
    }

    /// Disburse a held (or disputed) charge to the steward.
    ///
    /// One atomic unit: charge → RELEASED, companion PAYOUT of
    /// `amount - platform_fee` created COMPLETED, and - when the client
    /// confirmed completion - the task marked DONE.
    pub async fn release(
        &self,
        charge_id: Uuid,
        actor: Actor,
        via_client_confirmation: bool,
    ) -> AppResult<Transaction> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_transaction_for_update(&mut tx, charge_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", charge_id)))?;

        let plan = plan_release(&charge)?;
        let task_id = charge
            .task_id
            .ok_or_else(|| AppError::Internal("escrow charge without task".to_string()))?;
        let task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        match actor {
            Actor::Client(id) if task.client_id != id => {
                return Err(AppError::Forbidden(
                    "Only the task's client can release this charge".to_string(),
                ));
            }
            Actor::Steward(_) => {
                return Err(AppError::Forbidden(
                    "Stewards cannot release their own payment".to_string(),
                ));
            }
            _ => {}
        }

        self.integrity_guard(&mut tx, task_id, Some(charge_id), actor)
            .await?;

        self.ledger
            .update_transaction_status_guarded(
                &mut tx,
                charge.id,
                charge.status,
                TransactionStatus::Released,
            )
            .await?;

        let payout = self
            .ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: Some(task_id),
                    milestone_id: None,
                    amount: plan.payout_amount,
                    platform_fee: Decimal::ZERO,
                    tx_type: TransactionType::Payout,
                    status: TransactionStatus::Completed,
                    metadata: TransactionMetadata::Released {
                        released_by: actor,
                        source_charge: charge.id,
                        released_at: Utc::now(),
                    },
                },
            )
            .await?;

        if via_client_confirmation {
            self.ledger.mark_task_done(&mut tx, task_id).await?;
        }
        tx.commit().await?;

        if let Actor::Admin(_) = actor {
            let _ = self
                .ledger
                .record_security_event(
                    SecurityEventType::AdminRelease,
                    &actor.to_string(),
                    Some(task_id),
                    Some(charge.id),
                    serde_json::json!({ "payout_id": payout.id }),
                )
                .await;
        }

        info!(
            "💸 Charge {} released by {}: payout {} ({})",
            charge.id, actor, payout.id, payout.amount
        );
        Ok(payout)
    }

    /// Return the full original amount (fee included) to the client. No
    /// funds reach the steward's wallet.
    pub async fn refund(
        &self,
        charge_id: Uuid,
        actor: Actor,
        reason: &str,
    ) -> AppResult<Transaction> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_transaction_for_update(&mut tx, charge_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", charge_id)))?;

        let plan = plan_refund(&charge)?;
        let task_id = charge
            .task_id
            .ok_or_else(|| AppError::Internal("escrow charge without task".to_string()))?;
        let task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        match actor {
            Actor::Client(id) if task.client_id != id => {
                return Err(AppError::Forbidden(
                    "Only the task's client can be refunded this charge".to_string(),
                ));
            }
            Actor::Steward(_) => {
                return Err(AppError::Forbidden(
                    "Stewards cannot refund client money".to_string(),
                ));
            }
            _ => {}
        }

        self.integrity_guard(&mut tx, task_id, Some(charge_id), actor)
            .await?;

        let refund_meta = TransactionMetadata::Refunded {
            refunded_by: actor,
            source_charge: charge.id,
            reason: reason.to_string(),
            refunded_at: Utc::now(),
        };

        match self.gateway.refund_charge(&charge.provider_reference).await {
            Ok(_) => {}
            Err(e) => {
                // Record the failed attempt; the charge keeps its status so a
                // human can retry deliberately.
                let failed = self
                    .ledger
                    .insert_transaction(
                        &mut tx,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            task_id: Some(task_id),
                            milestone_id: None,
                            amount: plan.refund_amount,
                            platform_fee: Decimal::ZERO,
                            tx_type: TransactionType::Refund,
                            status: TransactionStatus::Failed,
                            metadata: refund_meta,
                        },
                    )
                    .await?;
                tx.commit().await?;
                error!(
                    "Gateway refund failed for charge {} (refund row {}): {}",
                    charge.id, failed.id, e
                );
                return Err(e.into());
            }
        }

        self.ledger
            .update_transaction_status_guarded(
                &mut tx,
                charge.id,
                charge.status,
                TransactionStatus::Refunded,
            )
            .await?;

        let refund = self
            .ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: Some(task_id),
                    milestone_id: None,
                    amount: plan.refund_amount,
                    platform_fee: Decimal::ZERO,
                    tx_type: TransactionType::Refund,
                    status: TransactionStatus::Completed,
                    metadata: refund_meta,
                },
            )
            .await?;
        tx.commit().await?;

        if let Actor::Admin(_) = actor {
            let _ = self
                .ledger
                .record_security_event(
                    SecurityEventType::AdminRefund,
                    &actor.to_string(),
                    Some(task_id),
                    Some(charge.id),
                    serde_json::json!({ "refund_id": refund.id, "reason": reason }),
                )
                .await;
        }

        info!(
            "↩️ Charge {} refunded by {}: refund {} ({})",
            charge.id, actor, refund.id, refund.amount
        );
        Ok(refund)
    }

    /// Dispute a HELD charge: charge → DISPUTED, task → DISPUTED, one open
    /// Dispute row created. The balance engine freezes the steward's
    /// earnings off the dispute row, not off this call.
    pub async fn dispute(
        &self,
        charge_id: Uuid,
        user: &AuthenticatedUser,
        reason: &str,
    ) -> AppResult<Dispute> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_transaction_for_update(&mut tx, charge_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", charge_id)))?;

        plan_dispute(&charge)?;
        let task_id = charge
            .task_id
            .ok_or_else(|| AppError::Internal("escrow charge without task".to_string()))?;
        let task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        let actor = match user.role {
            Role::Client if task.is_owned_by(user.id) => Actor::Client(user.id),
            Role::Admin => Actor::Admin(user.id),
            _ => {
                return Err(AppError::Forbidden(
                    "Only the task's client or an admin can open a dispute".to_string(),
                ));
            }
        };

        self.integrity_guard(&mut tx, task_id, Some(charge_id), actor)
            .await?;

        self.ledger
            .update_transaction_status_guarded(
                &mut tx,
                charge.id,
                TransactionStatus::Held,
                TransactionStatus::Disputed,
            )
            .await?;
        self.ledger
            .update_task_status(&mut tx, task_id, TaskStatus::Disputed)
            .await?;
        let dispute = self
            .ledger
            .insert_dispute(&mut tx, task_id, charge.id, user.id, reason)
            .await?;
        tx.commit().await?;

        let _ = self
            .ledger
            .record_security_event(
                SecurityEventType::DisputeOpened,
                &actor.to_string(),
                Some(task_id),
                Some(charge.id),
                serde_json::json!({ "dispute_id": dispute.id, "reason": reason }),
            )
            .await;

        warn!(
            "⚠️ Dispute {} opened on charge {} by {}",
            dispute.id, charge.id, actor
        );
        Ok(dispute)
    }

    /// Mark a dispute RESOLVED and, when a disposition is given, direct the
    /// money through release/refund in the same request. With
    /// `DisputeDisposition::None` the charge stays DISPUTED and only the
    /// balance freeze lifts on the next read.
    pub async fn resolve_dispute(
        &self,
        dispute_id: Uuid,
        admin: &AuthenticatedUser,
        resolution: &str,
        disposition: DisputeDisposition,
    ) -> AppResult<Dispute> {
        if !admin.is_admin() {
            return Err(AppError::Forbidden(
                "Only admins can resolve disputes".to_string(),
            ));
        }

        let dispute = self
            .ledger
            .get_dispute(dispute_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dispute {}", dispute_id)))?;

        let mut tx = self.ledger.begin_tx().await?;
        let resolved = self
            .ledger
            .resolve_dispute(&mut tx, dispute_id, resolution)
            .await?;
        if !resolved {
            return Err(EscrowError::InvalidStateTransition {
                current: "resolved".to_string(),
                requested: "open".to_string(),
            }
            .into());
        }
        tx.commit().await?;

        match disposition {
            DisputeDisposition::ReleaseToSteward => {
                self.release(dispute.transaction_id, Actor::Admin(admin.id), false)
                    .await?;
            }
            DisputeDisposition::RefundToClient => {
                self.refund(dispute.transaction_id, Actor::Admin(admin.id), resolution)
                    .await?;
            }
            DisputeDisposition::None => {}
        }

        info!("Dispute {} resolved ({:?})", dispute_id, disposition);
        self.ledger
            .get_dispute(dispute_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dispute {}", dispute_id)))
    }

    /// Administrative freeze. Changes task status only - escrowed money is
    /// untouched; any disposition after a freeze goes through release/refund
    /// as a separate, deliberate action. There is no automatic unfreeze.
    pub async fn admin_freeze(
        &self,
        task_id: Uuid,
        admin: &AuthenticatedUser,
        reason: &str,
    ) -> AppResult<Task> {
        if !admin.is_admin() {
            return Err(AppError::Forbidden("Admin role required".to_string()));
        }
        require_trust_level(admin, TrustLevel::High, "admin_freeze")?;

        let mut tx = self.ledger.begin_tx().await?;
        let task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        if task.status == TaskStatus::AdminFrozen {
            return Ok(task);
        }

        let metadata = TaskMetadata {
            pre_freeze_status: Some(task.status),
            frozen_reason: Some(reason.to_string()),
        };
        self.ledger.set_task_metadata(&mut tx, task_id, &metadata).await?;
        self.ledger
            .update_task_status(&mut tx, task_id, TaskStatus::AdminFrozen)
            .await?;
        tx.commit().await?;

        let _ = self
            .ledger
            .record_security_event(
                SecurityEventType::AdminFreeze,
                &Actor::Admin(admin.id).to_string(),
                Some(task_id),
                None,
                serde_json::json!({ "reason": reason, "pre_freeze_status": task.status }),
            )
            .await;

        warn!("🧊 Task {} frozen by admin {}", task_id, admin.id);
        self.ledger
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))
    }

    /// Administrative cancel. Task status only; money is untouched.
    pub async fn admin_cancel(&self, task_id: Uuid, admin: &AuthenticatedUser) -> AppResult<Task> {
        if !admin.is_admin() {
            return Err(AppError::Forbidden("Admin role required".to_string()));
        }

        let mut tx = self.ledger.begin_tx().await?;
        let _task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;
        self.ledger
            .update_task_status(&mut tx, task_id, TaskStatus::AdminCancelled)
            .await?;
        tx.commit().await?;

        let _ = self
            .ledger
            .record_security_event(
                SecurityEventType::AdminCancel,
                &Actor::Admin(admin.id).to_string(),
                Some(task_id),
                None,
                serde_json::json!({}),
            )
            .await;

        self.ledger
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))
    }

    /// Shared escrow-integrity guard: exactly one charge may hold this
    /// task's money. Violations abort the request, mutate nothing, and
    /// always leave a security event behind.
    async fn integrity_guard(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_id: Uuid,
        transaction_id: Option<Uuid>,
        actor: Actor,
    ) -> AppResult<()> {
        let held_count = self.ledger.count_escrowed_charges(tx, task_id).await?;
        if held_count != 1 {
            self.log_integrity_violation(task_id, transaction_id, actor, held_count)
                .await;
            return Err(EscrowError::IntegrityViolation {
                task_id,
                held_count,
            }
            .into());
        }
        Ok(())
    }

    async fn log_integrity_violation(
        &self,
        task_id: Uuid,
        transaction_id: Option<Uuid>,
        actor: Actor,
        held_count: i64,
    ) {
        error!(
            "🚨 Escrow integrity violation on task {}: {} held charges (actor {})",
            task_id, held_count, actor
        );
        // Written outside the aborting transaction so the audit row survives.
        if let Err(e) = self
            .ledger
            .record_security_event(
                SecurityEventType::EscrowIntegrityViolation,
                &actor.to_string(),
                Some(task_id),
                transaction_id,
                serde_json::json!({ "held_count": held_count }),
            )
            .await
        {
            error!("Failed to record security event: {:?}", e);
        }
    }

    pub fn gateway(&self) -> Arc<dyn PaymentGateway> {
        self.gateway.clone()
    }
}
