//! Pure rules of the charge state machine.
//!
//! The legal lifecycle of a CHARGE is
//! `PENDING → HELD → {RELEASED | DISPUTED | REFUNDED}` with
//! `DISPUTED → {RELEASED | REFUNDED}` via admin resolution. Terminal states
//! never transition again. Keeping the table here, away from the database,
//! means every call site shares one source of truth for what is legal.

use rust_decimal::Decimal;

use crate::error::EscrowError;
use crate::ledger::models::{Transaction, TransactionStatus, TransactionType};

/// Validate a charge status transition.
/// Valid transitions:
/// - Pending → Held, Failed
/// - Held → Released, Disputed, Refunded
/// - Disputed → Released, Refunded
/// - Terminal states (Released, Refunded, Completed, Failed) → NONE
pub fn validate_charge_transition(
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<(), EscrowError> {
    let allowed = match from {
        TransactionStatus::Pending => {
            matches!(to, TransactionStatus::Held | TransactionStatus::Failed)
        }
        TransactionStatus::Held => matches!(
            to,
            TransactionStatus::Released | TransactionStatus::Disputed | TransactionStatus::Refunded
        ),
        TransactionStatus::Disputed => {
            matches!(to, TransactionStatus::Released | TransactionStatus::Refunded)
        }
        TransactionStatus::Released
        | TransactionStatus::Refunded
        | TransactionStatus::Completed
        | TransactionStatus::Failed => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::InvalidStateTransition {
            current: from.to_string(),
            requested: to.to_string(),
        })
    }
}

fn require_charge(charge: &Transaction) -> Result<(), EscrowError> {
    if charge.tx_type != TransactionType::Charge {
        return Err(EscrowError::NotACharge {
            id: charge.id,
            actual: charge.tx_type.to_string(),
        });
    }
    Ok(())
}

/// What confirming a provider "charge confirmed" event should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPlan {
    /// PENDING charge, first confirmation: move it to HELD.
    Confirm,
    /// Charge already HELD: a redelivered event or a concurrent verify.
    /// Success with no writes, so no duplicate transition can occur.
    AlreadyConfirmed,
}

pub fn plan_confirm_held(charge: &Transaction) -> Result<ConfirmPlan, EscrowError> {
    require_charge(charge)?;
    if charge.status == TransactionStatus::Held {
        return Ok(ConfirmPlan::AlreadyConfirmed);
    }
    validate_charge_transition(charge.status, TransactionStatus::Held)?;
    Ok(ConfirmPlan::Confirm)
}

/// Planned effects of releasing a charge: the companion PAYOUT carries the
/// charge amount minus the platform fee and no fee of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePlan {
    pub payout_amount: Decimal,
}

pub fn plan_release(charge: &Transaction) -> Result<ReleasePlan, EscrowError> {
    require_charge(charge)?;
    validate_charge_transition(charge.status, TransactionStatus::Released)?;
    Ok(ReleasePlan {
        payout_amount: charge.amount - charge.platform_fee,
    })
}

/// Planned effects of refunding a charge: the client gets the full original
/// amount back, platform fee included. No funds reach the steward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPlan {
    pub refund_amount: Decimal,
}

pub fn plan_refund(charge: &Transaction) -> Result<RefundPlan, EscrowError> {
    require_charge(charge)?;
    validate_charge_transition(charge.status, TransactionStatus::Refunded)?;
    Ok(RefundPlan {
        refund_amount: charge.amount,
    })
}

/// A charge may only be disputed while HELD - a charge already disputed,
/// released, or refunded cannot be disputed again.
pub fn plan_dispute(charge: &Transaction) -> Result<(), EscrowError> {
    require_charge(charge)?;
    if charge.status != TransactionStatus::Held {
        return Err(EscrowError::InvalidStateTransition {
            current: charge.status.to_string(),
            requested: TransactionStatus::Held.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{Actor, TransactionMetadata};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn charge(status: TransactionStatus) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            task_id: Some(Uuid::new_v4()),
            milestone_id: None,
            amount: dec!(100000),
            platform_fee: dec!(10000),
            tx_type: TransactionType::Charge,
            status,
            provider_reference: "ref".to_string(),
            provider_transaction_id: None,
            metadata: Json(TransactionMetadata::ChargeInitiated {
                initiated_by: Actor::System,
                at: Utc::now(),
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_legal_transitions() {
        use TransactionStatus::*;
        assert!(validate_charge_transition(Pending, Held).is_ok());
        assert!(validate_charge_transition(Pending, Failed).is_ok());
        assert!(validate_charge_transition(Held, Released).is_ok());
        assert!(validate_charge_transition(Held, Disputed).is_ok());
        assert!(validate_charge_transition(Held, Refunded).is_ok());
        assert!(validate_charge_transition(Disputed, Released).is_ok());
        assert!(validate_charge_transition(Disputed, Refunded).is_ok());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        use TransactionStatus::*;
        for from in [Released, Refunded, Completed, Failed] {
            for to in [Pending, Held, Disputed, Released, Completed, Failed, Refunded] {
                assert!(
                    validate_charge_transition(from, to).is_err(),
                    "{:?} -> {:?} must be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_refunded_never_released_and_vice_versa() {
        use TransactionStatus::*;
        assert!(validate_charge_transition(Refunded, Released).is_err());
        assert!(validate_charge_transition(Released, Refunded).is_err());
    }

    #[test]
    fn test_duplicate_confirmation_is_a_noop() {
        // first delivery of the confirmation event transitions the charge
        assert_eq!(
            plan_confirm_held(&charge(TransactionStatus::Pending)).unwrap(),
            ConfirmPlan::Confirm
        );
        // a redelivered event sees HELD and plans no second transition
        assert_eq!(
            plan_confirm_held(&charge(TransactionStatus::Held)).unwrap(),
            ConfirmPlan::AlreadyConfirmed
        );
    }

    #[test]
    fn test_confirmation_rejected_after_settlement() {
        use TransactionStatus::*;
        for status in [Released, Refunded, Failed] {
            assert!(matches!(
                plan_confirm_held(&charge(status)),
                Err(EscrowError::InvalidStateTransition { .. })
            ));
        }
        let mut payout = charge(Held);
        payout.tx_type = TransactionType::Payout;
        assert!(matches!(
            plan_confirm_held(&payout),
            Err(EscrowError::NotACharge { .. })
        ));
    }

    #[test]
    fn test_release_conservation() {
        // payout.amount == charge.amount - charge.platform_fee, always
        let plan = plan_release(&charge(TransactionStatus::Held)).unwrap();
        assert_eq!(plan.payout_amount, dec!(90000));

        let plan = plan_release(&charge(TransactionStatus::Disputed)).unwrap();
        assert_eq!(plan.payout_amount, dec!(90000));
    }

    #[test]
    fn test_release_requires_escrowed_charge() {
        assert!(plan_release(&charge(TransactionStatus::Pending)).is_err());
        assert!(plan_release(&charge(TransactionStatus::Refunded)).is_err());

        let mut payout = charge(TransactionStatus::Held);
        payout.tx_type = TransactionType::Payout;
        assert!(matches!(
            plan_release(&payout),
            Err(EscrowError::NotACharge { .. })
        ));
    }

    #[test]
    fn test_refund_returns_full_amount_including_fee() {
        let plan = plan_refund(&charge(TransactionStatus::Held)).unwrap();
        assert_eq!(plan.refund_amount, dec!(100000));
    }

    #[test]
    fn test_dispute_only_from_held() {
        assert!(plan_dispute(&charge(TransactionStatus::Held)).is_ok());
        // a second dispute attempt sees a DISPUTED charge and is rejected
        assert!(matches!(
            plan_dispute(&charge(TransactionStatus::Disputed)),
            Err(EscrowError::InvalidStateTransition { .. })
        ));
        assert!(plan_dispute(&charge(TransactionStatus::Released)).is_err());
        assert!(plan_dispute(&charge(TransactionStatus::Refunded)).is_err());
    }
}
