//! Milestone payments - the lighter-weight sibling of the escrow flow.
//!
//! Milestones bypass the HELD stage entirely: on confirmed payment the
//! CHARGE is recorded COMPLETED and a COMPLETED PAYOUT to the steward is
//! synthesized in the same step. No holding period, no dispute protection
//! for milestone money.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult, EscrowError};
use crate::escrow::engine::ChargeHandle;
use crate::gateway::client::{CreateChargeRequest, PaymentGateway};
use crate::ledger::models::*;
use crate::ledger::repository::NewTransaction;
use crate::ledger::LedgerRepository;

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub title: String,
    pub amount: Decimal,
}

/// Only a PENDING milestone charge settles; any later status means a payout
/// was already synthesized (or the charge failed) and the delivery is a
/// no-op.
fn charge_settles(status: TransactionStatus) -> bool {
    status == TransactionStatus::Pending
}

pub struct MilestoneFlow {
    ledger: Arc<LedgerRepository>,
    gateway: Arc<dyn PaymentGateway>,
    fee_rate: Decimal,
}

impl MilestoneFlow {
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

    /// Define the milestone plan for a task. Only once per task, only while
    /// the task is OPEN or ASSIGNED, and the total may not exceed the
    /// agreed price.
    pub async fn create_milestones(
        &self,
        task_id: Uuid,
        user: &AuthenticatedUser,
        items: Vec<NewMilestone>,
    ) -> AppResult<Vec<PaymentMilestone>> {
        if items.is_empty() {
            return Err(AppError::InvalidInput("no milestones given".to_string()));
        }

        let task = self
            .ledger
            .get_task(task_id)
            .await?
            .filter(|t| !t.is_system)
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        if !task.is_owned_by(user.id) {
            return Err(AppError::Forbidden(
                "Only the task's client can define milestones".to_string(),
            ));
        }
        if !task.accepts_milestones() {
            return Err(EscrowError::TaskNotEligible(format!(
                "task is {}",
                task.status
            ))
            .into());
        }
        if self.ledger.task_has_milestones(task_id).await? {
            return Err(EscrowError::MilestonesAlreadyDefined { task_id }.into());
        }

        let mut total = Decimal::ZERO;
        for item in &items {
            if item.amount <= Decimal::ZERO {
                return Err(AppError::InvalidInput(
                    "milestone amounts must be positive".to_string(),
                ));
            }
            total += item.amount;
        }
        if total > task.agreed_price {
            return Err(EscrowError::MilestoneTotalExceedsPrice {
                total: total.to_string(),
                agreed_price: task.agreed_price.to_string(),
            }
            .into());
        }

        let mut tx = self.ledger.begin_tx().await?;
        let mut created = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let milestone = self
                .ledger
                .insert_milestone(&mut tx, task_id, &item.title, item.amount, index as i32)
                .await?;
            created.push(milestone);
        }
        tx.commit().await?;

        info!("📋 {} milestones defined for task {}", created.len(), task_id);
        Ok(created)
    }

    /// Create a PENDING charge for one milestone and return the provider
    /// redirect.
    pub async fn initiate_charge(
        &self,
        milestone_id: Uuid,
        user: &AuthenticatedUser,
    ) -> AppResult<ChargeHandle> {
        let milestone = self
            .ledger
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("milestone {}", milestone_id)))?;
        let task = self
            .ledger
            .get_task(milestone.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", milestone.task_id)))?;

        if !task.is_owned_by(user.id) {
            return Err(AppError::Forbidden(
                "Only the task's client can pay a milestone".to_string(),
            ));
        }
        if milestone.status != MilestoneStatus::Pending {
            return Err(EscrowError::InvalidStateTransition {
                current: format!("{:?}", milestone.status).to_lowercase(),
                requested: "pending".to_string(),
            }
            .into());
        }

        let amount = milestone.amount;
        let platform_fee = (amount * self.fee_rate).round_dp(2);

        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: Some(task.id),
                    milestone_id: Some(milestone.id),
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
                let mut tx = self.ledger.begin_tx().await?;
                self.ledger
                    .fail_pending_transaction(
                        &mut tx,
                        charge.id,
                        &TransactionMetadata::ChargeFailed {
                            reason: format!("charge initiation failed: {}", e),
                            at: Utc::now(),
                        },
                    )
                    .await?;
                tx.commit().await?;
                return Err(e.into());
            }
        };

        Ok(ChargeHandle {
            transaction_id: charge.id,
            reference: charge.provider_reference,
            authorization_url: session.authorization_url,
            amount,
            platform_fee,
        })
    }

    /// Settle a confirmed milestone charge: CHARGE → COMPLETED and a
    /// COMPLETED PAYOUT to the steward, one atomic unit. Idempotent on
    /// re-delivery - a charge no longer PENDING is a no-op.
    pub async fn confirm_payment(
        &self,
        charge_id: Uuid,
        provider_transaction_id: &str,
    ) -> AppResult<bool> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_transaction_for_update(&mut tx, charge_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", charge_id)))?;

        let milestone_id = charge
            .milestone_id
            .ok_or_else(|| AppError::InvalidInput("charge is not a milestone charge".to_string()))?;

        if !charge_settles(charge.status) {
            // Duplicate webhook/verify delivery; exactly one payout exists.
            return Ok(false);
        }

        let task_id = charge
            .task_id
            .ok_or_else(|| AppError::Internal("milestone charge without task".to_string()))?;
        let task = self
            .ledger
            .get_task_for_update(&mut tx, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;
        if task.steward_id.is_none() {
            return Err(EscrowError::TaskNotEligible(
                "milestone payment requires an assigned steward".to_string(),
            )
            .into());
        }

        let meta = TransactionMetadata::MilestonePayment {
            milestone_id,
            provider_transaction_id: Some(provider_transaction_id.to_string()),
            at: Utc::now(),
        };
        let completed = self
            .ledger
            .complete_charge(&mut tx, charge.id, provider_transaction_id, &meta)
            .await?;
        if !completed {
            return Ok(false);
        }

        self.ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: charge.task_id,
                    milestone_id: Some(milestone_id),
                    amount: charge.amount - charge.platform_fee,
                    platform_fee: Decimal::ZERO,
                    tx_type: TransactionType::Payout,
                    status: TransactionStatus::Completed,
                    metadata: meta.clone(),
                },
            )
            .await?;

        let advanced = self
            .ledger
            .update_milestone_status_guarded(
                &mut tx,
                milestone_id,
                MilestoneStatus::Pending,
                MilestoneStatus::InProgress,
            )
            .await?;
        if !advanced {
            warn!("Milestone {} was not pending at payment time", milestone_id);
        }
        tx.commit().await?;

        info!("✓ Milestone {} paid and settled", milestone_id);
        Ok(true)
    }

    /// Steward marks a milestone done. Only legal when a COMPLETED payment
    /// transaction exists for it.
    pub async fn complete_milestone(
        &self,
        milestone_id: Uuid,
        user: &AuthenticatedUser,
    ) -> AppResult<PaymentMilestone> {
        let milestone = self
            .ledger
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("milestone {}", milestone_id)))?;
        let task = self
            .ledger
            .get_task(milestone.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", milestone.task_id)))?;

        if task.steward_id != Some(user.id) {
            return Err(AppError::Forbidden(
                "Only the task's steward can complete a milestone".to_string(),
            ));
        }
        if !self.ledger.milestone_has_completed_charge(milestone_id).await? {
            return Err(EscrowError::TaskNotEligible(
                "milestone has no completed payment".to_string(),
            )
            .into());
        }

        let mut tx = self.ledger.begin_tx().await?;
        let advanced = self
            .ledger
            .update_milestone_status_guarded(
                &mut tx,
                milestone_id,
                MilestoneStatus::InProgress,
                MilestoneStatus::Completed,
            )
            .await?;
        if !advanced {
            return Err(EscrowError::InvalidStateTransition {
                current: format!("{:?}", milestone.status).to_lowercase(),
                requested: "in_progress".to_string(),
            }
            .into());
        }
        tx.commit().await?;

        self.ledger
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("milestone {}", milestone_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pending_charges_settle() {
        use TransactionStatus::*;
        assert!(charge_settles(Pending));
        // a redelivered confirmation sees the settled charge and writes no
        // second payout
        for status in [Completed, Held, Released, Refunded, Disputed, Failed] {
            assert!(!charge_settles(status), "{:?} must not settle again", status);
        }
    }
}
