pub mod fees;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{require_trust_level, AuthenticatedUser, Role, TrustLevel};
use crate::error::{AppError, AppResult};
use crate::gateway::client::{PaymentGateway, ProviderStatus, TransferRequest};
use crate::ledger::models::*;
use crate::ledger::repository::NewTransaction;
use crate::ledger::LedgerRepository;
use crate::wallet::WalletEngine;

pub use fees::{compute_fee, validate_withdrawal, FeeBreakdown, WithdrawalPolicy};

/// Cash leaving the platform: a negative-amount PAYOUT on the steward's
/// synthetic withdrawal task, disbursed through the external transfer API.
pub struct WithdrawalProcessor {
    ledger: Arc<LedgerRepository>,
    wallet: Arc<WalletEngine>,
    gateway: Arc<dyn PaymentGateway>,
    policy: WithdrawalPolicy,
}

impl WithdrawalProcessor {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        wallet: Arc<WalletEngine>,
        gateway: Arc<dyn PaymentGateway>,
        policy: WithdrawalPolicy,
    ) -> Self {
        Self {
            ledger,
            wallet,
            gateway,
            policy,
        }
    }

    /// Reserve, then transfer.
    ///
    /// The balance read, validation, and the PENDING payout insert all run
    /// inside one transaction holding a row lock on the steward's withdrawal
    /// task, so concurrent requests for the same steward serialize and the
    /// second one sees the first one's reservation in `spendable()`. Only
    /// after that commit does any money move at the provider; a failed
    /// transfer releases the reservation by marking the payout FAILED.
    pub async fn request_withdrawal(
        &self,
        user: &AuthenticatedUser,
        amount: Decimal,
        recipient_code: &str,
    ) -> AppResult<Transaction> {
        if user.role != Role::Steward {
            return Err(AppError::Forbidden(
                "Only stewards can withdraw earnings".to_string(),
            ));
        }
        require_trust_level(user, TrustLevel::High, "withdrawal")?;

        let currency = self.wallet.currency_for(user.id).await?;
        let withdrawal_task = self
            .ledger
            .ensure_withdrawal_task(user.id, &currency)
            .await?;

        let payout_id = Uuid::new_v4();
        let requested_at = Utc::now();

        let mut tx = self.ledger.begin_tx().await?;
        // Serialization point: one withdrawal per steward at a time.
        self.ledger
            .get_task_for_update(&mut tx, withdrawal_task.id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("withdrawal task {} missing", withdrawal_task.id))
            })?;

        let balance = self.wallet.get_balance_in_tx(&mut tx, user.id).await?;
        let breakdown =
            validate_withdrawal(amount, &balance, &self.policy).map_err(AppError::Withdrawal)?;

        let metadata = |transfer_result: Option<TransferResult>| TransactionMetadata::Withdrawal {
            requested_by: user.id,
            recipient_code: recipient_code.to_string(),
            fixed_fee: breakdown.fixed_fee,
            percent_fee: breakdown.percent_fee,
            total_fee: breakdown.total_fee,
            net_amount: breakdown.net_amount,
            requested_at,
            transfer_result,
        };

        let payout = self
            .ledger
            .insert_transaction(
                &mut tx,
                NewTransaction {
                    id: payout_id,
                    task_id: Some(withdrawal_task.id),
                    milestone_id: None,
                    amount: -amount,
                    platform_fee: breakdown.total_fee,
                    tx_type: TransactionType::Payout,
                    status: TransactionStatus::Pending,
                    metadata: metadata(None),
                },
            )
            .await?;
        tx.commit().await?;

        let _ = self
            .ledger
            .record_security_event(
                SecurityEventType::WithdrawalRequested,
                &Actor::Steward(user.id).to_string(),
                Some(withdrawal_task.id),
                Some(payout.id),
                serde_json::json!({
                    "amount": amount,
                    "fee": breakdown.total_fee,
                    "net": breakdown.net_amount,
                }),
            )
            .await;

        // The reservation is durable; money may move now.
        let transfer = self
            .gateway
            .initiate_transfer(TransferRequest {
                reference: payout_id.to_string(),
                amount: breakdown.net_amount,
                recipient_code: recipient_code.to_string(),
                reason: "wallet withdrawal".to_string(),
            })
            .await;

        match transfer {
            Ok(t) => {
                let status = match t.status {
                    ProviderStatus::Success => TransactionStatus::Completed,
                    // webhook reconciliation flips this later
                    _ => TransactionStatus::Pending,
                };
                let result = TransferResult {
                    event: "transfer.initiated".to_string(),
                    provider_transfer_id: t.provider_transfer_id.clone(),
                    at: Utc::now(),
                };
                let mut tx = self.ledger.begin_tx().await?;
                self.ledger
                    .update_payout_transfer(
                        &mut tx,
                        payout_id,
                        status,
                        &t.provider_transfer_id,
                        &metadata(Some(result)),
                    )
                    .await?;
                tx.commit().await?;

                info!(
                    "🏦 Withdrawal {} by {}: {} (fee {}, net {})",
                    payout_id, user.id, amount, breakdown.total_fee, breakdown.net_amount
                );
                self.ledger
                    .get_transaction(payout_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("payout {}", payout_id)))
            }
            Err(e) => {
                // Release the reservation; the FAILED row stays as the audit
                // record and drops out of the balance on the next read.
                let mut tx = self.ledger.begin_tx().await?;
                self.ledger
                    .fail_pending_transaction(&mut tx, payout_id, &metadata(None))
                    .await?;
                tx.commit().await?;

                error!(
                    "Transfer failed for withdrawal {} by {}: {}",
                    payout_id, user.id, e
                );
                Err(e.into())
            }
        }
    }
}
