//! Inbound half of the gateway boundary: webhook events and the
//! poll-and-verify fallback. Both paths feed the same idempotent
//! confirmation methods, so a webhook and a concurrent verify cannot
//! double-settle a charge.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, GatewayError};
use crate::escrow::{EscrowEngine, MilestoneFlow};
use crate::gateway::client::ProviderStatus;
use crate::ledger::models::*;
use crate::ledger::LedgerRepository;

/// Provider event envelope. Unknown event types parse fine and are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub reference: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub transfer_code: Option<String>,
    #[serde(default)]
    pub gateway_response: Option<String>,
}

/// What the processor did with an event. The webhook endpoint acknowledges
/// all of these with 200 so the provider stops redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Settled,
    Duplicate,
    Ignored,
}

pub fn parse_event(body: &[u8]) -> Result<GatewayEvent, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::MalformedEvent(e.to_string()))
}

fn transfer_status_for_event(event: &str) -> Option<TransactionStatus> {
    match event {
        "transfer.success" => Some(TransactionStatus::Completed),
        "transfer.failed" | "transfer.reversed" => Some(TransactionStatus::Failed),
        _ => None,
    }
}

pub struct WebhookProcessor {
    ledger: Arc<LedgerRepository>,
    escrow: Arc<EscrowEngine>,
    milestones: Arc<MilestoneFlow>,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        escrow: Arc<EscrowEngine>,
        milestones: Arc<MilestoneFlow>,
    ) -> Self {
        Self {
            ledger,
            escrow,
            milestones,
        }
    }

    /// Route one verified event. Errors here mean our side could not settle;
    /// the endpoint still acknowledges so the provider does not retry into
    /// the same failure, and the poll-verify path remains as recovery.
    pub async fn process_event(&self, event: GatewayEvent) -> AppResult<WebhookDisposition> {
        match event.event.as_str() {
            "charge.success" => {
                let provider_id = event
                    .data
                    .id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| event.data.reference.clone());
                self.settle_charge(&event.data.reference, &provider_id).await
            }
            "charge.failed" => {
                let reason = event
                    .data
                    .gateway_response
                    .unwrap_or_else(|| "charge declined".to_string());
                self.decline_charge(&event.data.reference, &reason).await
            }
            other => match transfer_status_for_event(other) {
                Some(status) => self.reconcile_transfer(other, &event.data, status).await,
                None => {
                    info!("Ignoring gateway event {}", other);
                    Ok(WebhookDisposition::Ignored)
                }
            },
        }
    }

    /// Poll-and-verify fallback for a charge: ask the provider for the
    /// current state and settle off the answer. Same settlement paths as the
    /// webhook, so calling both is safe.
    pub async fn verify_charge(&self, reference: &str) -> AppResult<WebhookDisposition> {
        let provider_charge = self.escrow.gateway().verify_charge(reference).await?;
        match provider_charge.status {
            ProviderStatus::Success => {
                self.settle_charge(reference, &provider_charge.provider_transaction_id)
                    .await
            }
            ProviderStatus::Failed => {
                self.decline_charge(reference, "provider reports charge failed")
                    .await
            }
            ProviderStatus::Pending => Ok(WebhookDisposition::Ignored),
        }
    }

    /// A confirmed charge settles differently depending on what it paid for:
    /// milestone charges complete immediately, escrow charges move to HELD.
    async fn settle_charge(
        &self,
        reference: &str,
        provider_transaction_id: &str,
    ) -> AppResult<WebhookDisposition> {
        let charge = self
            .find_charge(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", reference)))?;

        if charge.milestone_id.is_some() {
            let settled = self
                .milestones
                .confirm_payment(charge.id, provider_transaction_id)
                .await?;
            return Ok(if settled {
                WebhookDisposition::Settled
            } else {
                WebhookDisposition::Duplicate
            });
        }

        match self
            .escrow
            .confirm_held(reference, provider_transaction_id)
            .await?
        {
            crate::escrow::ConfirmOutcome::Held => Ok(WebhookDisposition::Settled),
            crate::escrow::ConfirmOutcome::AlreadyHeld => Ok(WebhookDisposition::Duplicate),
        }
    }

    async fn decline_charge(&self, reference: &str, reason: &str) -> AppResult<WebhookDisposition> {
        let charge = self
            .find_charge(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("charge {}", reference)))?;
        let flipped = self.escrow.fail_charge(charge.id, reason).await?;
        Ok(if flipped {
            WebhookDisposition::Settled
        } else {
            WebhookDisposition::Duplicate
        })
    }

    /// Transfer reconciliation: the event's reference is the payout row's id.
    /// The outcome is folded into the withdrawal's metadata so the full
    /// transfer history stays on the one row.
    async fn reconcile_transfer(
        &self,
        event_name: &str,
        data: &EventData,
        to: TransactionStatus,
    ) -> AppResult<WebhookDisposition> {
        let payout_id = Uuid::parse_str(&data.reference)
            .map_err(|_| GatewayError::MalformedEvent("transfer reference is not a payout id".to_string()))?;

        let mut tx = self.ledger.begin_tx().await?;
        let payout = self
            .ledger
            .get_transaction_for_update(&mut tx, payout_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payout {}", payout_id)))?;

        if payout.tx_type != TransactionType::Payout {
            return Err(GatewayError::MalformedEvent(
                "transfer reference does not name a payout".to_string(),
            )
            .into());
        }
        if payout.status == to {
            return Ok(WebhookDisposition::Duplicate);
        }

        let provider_transfer_id = data
            .transfer_code
            .clone()
            .unwrap_or_else(|| data.reference.clone());
        let result = TransferResult {
            event: event_name.to_string(),
            provider_transfer_id: provider_transfer_id.clone(),
            at: Utc::now(),
        };

        let metadata = match payout.metadata.0.clone() {
            TransactionMetadata::Withdrawal {
                requested_by,
                recipient_code,
                fixed_fee,
                percent_fee,
                total_fee,
                net_amount,
                requested_at,
                ..
            } => TransactionMetadata::Withdrawal {
                requested_by,
                recipient_code,
                fixed_fee,
                percent_fee,
                total_fee,
                net_amount,
                requested_at,
                transfer_result: Some(result),
            },
            other => {
                warn!("Transfer event for non-withdrawal payout {}", payout_id);
                other
            }
        };

        let updated = self
            .ledger
            .update_payout_transfer(&mut tx, payout_id, to, &provider_transfer_id, &metadata)
            .await?;
        tx.commit().await?;

        if !updated {
            // A reversed transfer already marked FAILED, or a terminal row.
            return Ok(WebhookDisposition::Duplicate);
        }

        if to == TransactionStatus::Failed {
            warn!(
                "💱 Transfer for payout {} ended {}: funds returned to balance",
                payout_id, event_name
            );
        } else {
            info!("💱 Transfer for payout {} completed", payout_id);
        }
        Ok(WebhookDisposition::Settled)
    }

    async fn find_charge(&self, reference: &str) -> AppResult<Option<Transaction>> {
        let mut tx = self.ledger.begin_tx().await?;
        let charge = self
            .ledger
            .get_by_reference_for_update(&mut tx, reference, TransactionType::Charge)
            .await?;
        tx.commit().await?;
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_charge_event() {
        let body = br#"{
            "event": "charge.success",
            "data": { "reference": "abc-123", "id": 99, "status": "success" }
        }"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.event, "charge.success");
        assert_eq!(event.data.reference, "abc-123");
        assert_eq!(event.data.id, Some(99));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_event(b"not json").is_err());
        assert!(parse_event(br#"{"event": "charge.success"}"#).is_err());
    }

    #[test]
    fn test_transfer_event_status_mapping() {
        assert_eq!(
            transfer_status_for_event("transfer.success"),
            Some(TransactionStatus::Completed)
        );
        assert_eq!(
            transfer_status_for_event("transfer.failed"),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(
            transfer_status_for_event("transfer.reversed"),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(transfer_status_for_event("charge.success"), None);
        assert_eq!(transfer_status_for_event("subscription.create"), None);
    }
}
