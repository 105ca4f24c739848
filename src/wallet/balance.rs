//! Pure balance derivation.
//!
//! No balance is ever persisted: the wallet is a projection over immutable
//! ledger rows plus active dispute state, recomputed on every read. An O(n)
//! scan per balance check is the price for never having a second source of
//! truth that could drift from the ledger.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::ledger::models::{PayoutRecord, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalance {
    pub available_balance: Decimal,
    pub pending_balance: Decimal,
    pub frozen_balance: Decimal,
    /// Withdrawals still in flight at the provider (PENDING, negative
    /// amount), as a positive sum. Spendable funds are
    /// `available_balance - reserved_balance`.
    pub reserved_balance: Decimal,
    /// Lifetime earnings: strictly positive PAYOUT amounts only -
    /// withdrawals are negative and never counted here
    pub total_earnings: Decimal,
    pub currency: String,
}

impl WalletBalance {
    /// What a withdrawal may draw on right now.
    pub fn spendable(&self) -> Decimal {
        self.available_balance - self.reserved_balance
    }
}

/// Partition every PAYOUT amount (sign preserved) into available, pending,
/// or frozen:
/// - an open/under-review dispute on the linked task freezes earnings
///   regardless of the transaction's own status (withdrawals, being
///   negative, are never frozen);
/// - otherwise COMPLETED counts as available and PENDING as pending.
pub fn derive_balance(records: &[PayoutRecord], currency: String) -> WalletBalance {
    let mut available = Decimal::ZERO;
    let mut pending = Decimal::ZERO;
    let mut frozen = Decimal::ZERO;
    let mut reserved = Decimal::ZERO;
    let mut total_earnings = Decimal::ZERO;

    for record in records {
        let is_earning = record.amount > Decimal::ZERO;

        if record.dispute_active && is_earning {
            frozen += record.amount;
        } else {
            match record.status {
                TransactionStatus::Completed => available += record.amount,
                TransactionStatus::Pending => pending += record.amount,
                // failed payouts never reach any bucket
                _ => {}
            }
        }

        // An in-flight withdrawal has not reduced available yet; it must
        // still be unavailable to the next withdrawal.
        if !is_earning && record.status == TransactionStatus::Pending {
            reserved += -record.amount;
        }

        if is_earning && record.status != TransactionStatus::Failed {
            total_earnings += record.amount;
        }
    }

    WalletBalance {
        available_balance: available,
        pending_balance: pending,
        frozen_balance: frozen,
        reserved_balance: reserved,
        total_earnings,
        currency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rec(amount: Decimal, status: TransactionStatus, dispute_active: bool) -> PayoutRecord {
        PayoutRecord {
            amount,
            status,
            dispute_active,
        }
    }

    #[test]
    fn test_completed_earnings_are_available() {
        let balance = derive_balance(
            &[rec(dec!(90000), TransactionStatus::Completed, false)],
            "NGN".to_string(),
        );
        assert_eq!(balance.available_balance, dec!(90000));
        assert_eq!(balance.pending_balance, dec!(0));
        assert_eq!(balance.frozen_balance, dec!(0));
        assert_eq!(balance.total_earnings, dec!(90000));
    }

    #[test]
    fn test_disputed_task_freezes_earnings_regardless_of_status() {
        let balance = derive_balance(
            &[
                rec(dec!(50000), TransactionStatus::Completed, true),
                rec(dec!(20000), TransactionStatus::Pending, true),
            ],
            "NGN".to_string(),
        );
        assert_eq!(balance.available_balance, dec!(0));
        assert_eq!(balance.pending_balance, dec!(0));
        assert_eq!(balance.frozen_balance, dec!(70000));
        // frozen money is still lifetime earnings
        assert_eq!(balance.total_earnings, dec!(70000));
    }

    #[test]
    fn test_withdrawals_are_never_frozen() {
        // negative payout on the system withdrawal task, with a dispute
        // elsewhere flagging the row
        let balance = derive_balance(
            &[
                rec(dec!(100000), TransactionStatus::Completed, false),
                rec(dec!(-30000), TransactionStatus::Completed, true),
            ],
            "NGN".to_string(),
        );
        assert_eq!(balance.available_balance, dec!(70000));
        assert_eq!(balance.frozen_balance, dec!(0));
        assert_eq!(balance.total_earnings, dec!(100000));
    }

    #[test]
    fn test_pending_withdrawal_reserves_funds() {
        let balance = derive_balance(
            &[
                rec(dec!(100000), TransactionStatus::Completed, false),
                rec(dec!(-30000), TransactionStatus::Pending, false),
            ],
            "NGN".to_string(),
        );
        assert_eq!(balance.available_balance, dec!(100000));
        assert_eq!(balance.pending_balance, dec!(-30000));
        // in-flight money is spoken for until the transfer settles
        assert_eq!(balance.reserved_balance, dec!(30000));
        assert_eq!(balance.spendable(), dec!(70000));
    }

    #[test]
    fn test_pending_earnings_are_not_reserved() {
        let balance = derive_balance(
            &[rec(dec!(50000), TransactionStatus::Pending, false)],
            "NGN".to_string(),
        );
        assert_eq!(balance.pending_balance, dec!(50000));
        assert_eq!(balance.reserved_balance, dec!(0));
    }

    #[test]
    fn test_failed_payouts_do_not_count() {
        let balance = derive_balance(
            &[
                rec(dec!(40000), TransactionStatus::Failed, false),
                rec(dec!(-20000), TransactionStatus::Failed, false),
            ],
            "NGN".to_string(),
        );
        assert_eq!(balance.available_balance, dec!(0));
        assert_eq!(balance.pending_balance, dec!(0));
        assert_eq!(balance.total_earnings, dec!(0));
    }

    #[test]
    fn test_empty_ledger_defaults() {
        let balance = derive_balance(&[], "NGN".to_string());
        assert_eq!(balance.available_balance, dec!(0));
        assert_eq!(balance.total_earnings, dec!(0));
        assert_eq!(balance.currency, "NGN");
    }
}
