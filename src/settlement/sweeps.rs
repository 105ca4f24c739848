//! The two idempotent settlement sweeps.
//!
//! Both are safe to re-run or to run concurrently with user-initiated
//! actions: every mutation re-validates the escrow invariant inside its own
//! database transaction, and a charge already moved out of HELD simply falls
//! out of the selection on the next pass.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::escrow::EscrowEngine;
use crate::gateway::client::{PaymentGateway, ProviderStatus};
use crate::ledger::models::*;
use crate::ledger::repository::NewTransaction;
use crate::ledger::LedgerRepository;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub skipped: usize,
}

pub struct SettlementSweeps {
    ledger: Arc<LedgerRepository>,
    escrow: Arc<EscrowEngine>,
    gateway: Arc<dyn PaymentGateway>,
    auto_release_after_hours: i64,
    batch_limit: i64,
}

impl SettlementSweeps {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        escrow: Arc<EscrowEngine>,
        gateway: Arc<dyn PaymentGateway>,
        auto_release_after_hours: i64,
    ) -> Self {
        Self {
            ledger,
            escrow,
            gateway,
            auto_release_after_hours,
            batch_limit: 200,
        }
    }

    /// Release HELD charges on DONE tasks once they are older than the
    /// grace period. Violations are logged and skipped, not retried in the
    /// same pass.
    pub async fn run_auto_release(&self) -> AppResult<SweepReport> {
        let cutoff = Utc::now() - Duration::hours(self.auto_release_after_hours);
        let charges = self
            .ledger
            .list_stale_held_charges(cutoff, self.batch_limit)
            .await?;

        let mut report = SweepReport {
            examined: charges.len(),
            ..Default::default()
        };

        for charge in charges {
            match self.escrow.release(charge.id, Actor::System, false).await {
                Ok(payout) => {
                    info!(
                        "🕐 Auto-released charge {} -> payout {}",
                        charge.id, payout.id
                    );
                    report.settled += 1;
                }
                Err(e) => {
                    // Another actor may have moved the charge first; that is
                    // the sweep working as intended, not a fault.
                    warn!("Auto-release skipped charge {}: {}", charge.id, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "✓ Auto-release sweep: {} examined, {} released, {} skipped",
            report.examined, report.settled, report.skipped
        );
        Ok(report)
    }

    /// Expire OPEN tasks past their deadline, refunding any captured charge.
    /// The task is marked EXPIRED regardless of the refund outcome; a failed
    /// refund is recorded for manual follow-up, never retried here.
    pub async fn run_expiry(&self) -> AppResult<SweepReport> {
        let tasks = self
            .ledger
            .list_expired_open_tasks(Utc::now(), self.batch_limit)
            .await?;

        let mut report = SweepReport {
            examined: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            if let Err(e) = self.refund_expired_task(&task).await {
                error!("Expiry refund failed for task {}: {}", task.id, e);
                report.skipped += 1;
            } else {
                report.settled += 1;
            }

            // Expired either way.
            let mut tx = self.ledger.begin_tx().await?;
            self.ledger.mark_task_expired(&mut tx, task.id).await?;
            tx.commit().await?;
            info!("⌛ Task {} expired", task.id);
        }

        info!(
            "✓ Expiry sweep: {} examined, {} refunded, {} needing follow-up",
            report.examined, report.settled, report.skipped
        );
        Ok(report)
    }

    async fn refund_expired_task(&self, task: &Task) -> AppResult<()> {
        let charge = match self.ledger.find_refundable_charge(task.id).await? {
            Some(charge) => charge,
            None => return Ok(()),
        };

        if charge.is_escrowed() {
            // Escrowed money goes back through the state machine, same
            // integrity guard as a manual refund.
            self.escrow
                .refund(charge.id, Actor::System, "task expired unaccepted")
                .await?;
            return Ok(());
        }

        // COMPLETED charge (milestone-style prepayment): refund at the
        // provider and record the outcome directly.
        let (refunded, gateway_error, status) = match self
            .gateway
            .refund_charge(&charge.provider_reference)
            .await
        {
            Ok(refund) if refund.status != ProviderStatus::Failed => {
                (true, None, TransactionStatus::Completed)
            }
            Ok(refund) => (
                false,
                Some(format!("provider returned {:?}", refund.status)),
                TransactionStatus::Failed,
            ),
            Err(e) => (false, Some(e.to_string()), TransactionStatus::Failed),
        };

        let mut tx = self.ledger.begin_tx().await?;
        self.ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: Uuid::new_v4(),
                    task_id: Some(task.id),
                    milestone_id: charge.milestone_id,
                    amount: charge.amount,
                    platform_fee: Decimal::ZERO,
                    tx_type: TransactionType::Refund,
                    status,
                    metadata: TransactionMetadata::ExpiryRefund {
                        refunded,
                        gateway_error: gateway_error.clone(),
                        at: Utc::now(),
                    },
                },
            )
            .await?;
        tx.commit().await?;

        if let Some(err) = gateway_error {
            warn!(
                "Expiry refund for task {} left in FAILED state: {}",
                task.id, err
            );
        }
        Ok(())
    }
}
