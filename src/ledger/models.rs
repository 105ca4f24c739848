use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json, Type};
use uuid::Uuid;

/// Task status - owned by the booking workflow; the ledger only reads it and
/// updates it as a side effect of money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Assigned,
    InProgress,
    Done,
    Disputed,
    Cancelled,
    AdminCancelled,
    AdminFrozen,
    Expired,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Disputed => "disputed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::AdminCancelled => "admin_cancelled",
            TaskStatus::AdminFrozen => "admin_frozen",
            TaskStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Charge,
    Payout,
    Refund,
    Tip,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionType::Charge => "charge",
            TransactionType::Payout => "payout",
            TransactionType::Refund => "refund",
            TransactionType::Tip => "tip",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Held,
    Disputed,
    Released,
    Completed,
    Failed,
    Refunded,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Held => "held",
            TransactionStatus::Disputed => "disputed",
            TransactionStatus::Released => "released",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "dispute_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "milestone_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "security_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    EscrowIntegrityViolation,
    DisputeOpened,
    AdminFreeze,
    AdminCancel,
    AdminRelease,
    AdminRefund,
    WebhookRejected,
    WithdrawalRequested,
}

/// Who performed a money-moving operation. Recorded in transaction metadata
/// and security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Client(Uuid),
    Steward(Uuid),
    Admin(Uuid),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Client(id) => write!(f, "client:{}", id),
            Actor::Steward(id) => write!(f, "steward:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::System => write!(f, "system"),
        }
    }
}

/// Free-form per-task metadata. `pre_freeze_status` is set by adminFreeze so
/// a human can restore the task later; there is no automatic unfreeze.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_freeze_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frozen_reason: Option<String>,
}

/// Task entity. Owned by the booking workflow (external); money movement only
/// reads it and mutates `status` / `actual_end` / `is_expired`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub client_id: Uuid,
    pub steward_id: Option<Uuid>,
    pub status: TaskStatus,
    pub agreed_price: Decimal,
    pub currency: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    /// Synthetic "system withdrawal" tasks stand in for cash-out records
    pub is_system: bool,
    pub actual_end: Option<DateTime<Utc>>,
    pub metadata: Json<TaskMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_owned_by(&self, client_id: Uuid) -> bool {
        self.client_id == client_id
    }

    pub fn accepts_milestones(&self) -> bool {
        matches!(self.status, TaskStatus::Open | TaskStatus::Assigned)
    }
}

/// Typed audit trail attached to every transaction. One variant per
/// operation kind so each transition records exactly what it must.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionMetadata {
    ChargeInitiated {
        initiated_by: Actor,
        at: DateTime<Utc>,
    },
    ChargeConfirmed {
        provider_transaction_id: String,
        confirmed_at: DateTime<Utc>,
    },
    ChargeFailed {
        reason: String,
        at: DateTime<Utc>,
    },
    Released {
        released_by: Actor,
        source_charge: Uuid,
        released_at: DateTime<Utc>,
    },
    Refunded {
        refunded_by: Actor,
        source_charge: Uuid,
        reason: String,
        refunded_at: DateTime<Utc>,
    },
    MilestonePayment {
        milestone_id: Uuid,
        provider_transaction_id: Option<String>,
        at: DateTime<Utc>,
    },
    Withdrawal {
        requested_by: Uuid,
        recipient_code: String,
        fixed_fee: Decimal,
        percent_fee: Decimal,
        total_fee: Decimal,
        net_amount: Decimal,
        requested_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transfer_result: Option<TransferResult>,
    },
    ExpiryRefund {
        refunded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        gateway_error: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Provider outcome for a withdrawal transfer, recorded when reconciliation
/// flips the payout's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub event: String,
    pub provider_transfer_id: String,
    pub at: DateTime<Utc>,
}

/// The ledger entry. Never deleted; status mutated in place.
///
/// `amount` is signed - negative for withdrawals. For a CHARGE, `amount` is
/// the gross amount paid by the client and `platform_fee` is the platform's
/// cut taken out of it on release.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub milestone_id: Option<Uuid>,
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    /// Our idempotency reference at the provider (the transaction id)
    pub provider_reference: String,
    pub provider_transaction_id: Option<String>,
    pub metadata: Json<TransactionMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Charges in these states still hold client money in escrow.
    pub fn is_escrowed(&self) -> bool {
        self.tx_type == TransactionType::Charge
            && matches!(
                self.status,
                TransactionStatus::Held | TransactionStatus::Disputed
            )
    }
}

/// One active dispute per disputed task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dispute {
    pub id: Uuid,
    pub task_id: Uuid,
    pub transaction_id: Uuid,
    pub raised_by: Uuid,
    pub reason: String,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A named partial-payment unit of a task's total price. Paid and settled
/// independently of the whole-task escrow flow - no holding period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMilestone {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    pub amount: Decimal,
    pub order_index: i32,
    pub status: MilestoneStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit log row. Append-only; read by operators, never by the
/// ledger itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub actor: String,
    pub task_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub details: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Row shape consumed by the wallet balance engine: one PAYOUT plus whether
/// the linked task currently has an open/under-review dispute.
#[derive(Debug, Clone, FromRow)]
pub struct PayoutRecord {
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub dispute_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metadata_round_trips_by_kind() {
        let meta = TransactionMetadata::Withdrawal {
            requested_by: Uuid::new_v4(),
            recipient_code: "RCP_123".to_string(),
            fixed_fee: dec!(500),
            percent_fee: dec!(250),
            total_fee: dec!(750),
            net_amount: dec!(49250),
            requested_at: Utc::now(),
            transfer_result: None,
        };

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "withdrawal");
        // transfer_result is omitted until reconciliation fills it in
        assert!(json.get("transfer_result").is_none());

        let back: TransactionMetadata = serde_json::from_value(json).unwrap();
        match back {
            TransactionMetadata::Withdrawal { total_fee, .. } => {
                assert_eq!(total_fee, dec!(750));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_actor_display() {
        let id = Uuid::nil();
        assert_eq!(Actor::System.to_string(), "system");
        assert_eq!(
            Actor::Admin(id).to_string(),
            format!("admin:{}", id)
        );
    }

    #[test]
    fn test_is_escrowed() {
        let mut tx = Transaction {
            id: Uuid::new_v4(),
            task_id: Some(Uuid::new_v4()),
            milestone_id: None,
            amount: dec!(100000),
            platform_fee: dec!(10000),
            tx_type: TransactionType::Charge,
            status: TransactionStatus::Held,
            provider_reference: "ref".to_string(),
            provider_transaction_id: None,
            metadata: Json(TransactionMetadata::ChargeInitiated {
                initiated_by: Actor::System,
                at: Utc::now(),
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(tx.is_escrowed());
        tx.status = TransactionStatus::Disputed;
        assert!(tx.is_escrowed());
        tx.status = TransactionStatus::Released;
        assert!(!tx.is_escrowed());
        tx.status = TransactionStatus::Held;
        tx.tx_type = TransactionType::Payout;
        assert!(!tx.is_escrowed());
    }
}
