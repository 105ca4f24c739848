//! Withdrawal fee computation and validation, kept pure so the money rules
//! test without a database or gateway.

use rust_decimal::Decimal;

use crate::error::WithdrawalError;
use crate::wallet::WalletBalance;

#[derive(Debug, Clone)]
pub struct WithdrawalPolicy {
    pub minimum: Decimal,
    pub fixed_fee: Decimal,
    pub percent_rate: Decimal,
    pub fee_cap: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub fixed_fee: Decimal,
    pub percent_fee: Decimal,
    /// `min(fixed + percent, cap)`
    pub total_fee: Decimal,
    pub net_amount: Decimal,
}

pub fn compute_fee(amount: Decimal, policy: &WithdrawalPolicy) -> FeeBreakdown {
    let percent_fee = (amount * policy.percent_rate).round_dp(2);
    let total_fee = (policy.fixed_fee + percent_fee).min(policy.fee_cap);
    FeeBreakdown {
        fixed_fee: policy.fixed_fee,
        percent_fee,
        total_fee,
        net_amount: amount - total_fee,
    }
}

/// Validation pipeline, in order: minimum, positive net after fee, amount
/// covered by spendable balance (available minus in-flight withdrawals), and
/// no frozen balance anywhere - any active dispute blocks all withdrawals,
/// not just the disputed amount.
pub fn validate_withdrawal(
    amount: Decimal,
    balance: &WalletBalance,
    policy: &WithdrawalPolicy,
) -> Result<FeeBreakdown, WithdrawalError> {
    if amount < policy.minimum {
        return Err(WithdrawalError::BelowMinimum {
            requested: amount.to_string(),
            minimum: policy.minimum.to_string(),
        });
    }

    let breakdown = compute_fee(amount, policy);
    if breakdown.net_amount <= Decimal::ZERO {
        return Err(WithdrawalError::FeeExceedsAmount {
            requested: amount.to_string(),
            fee: breakdown.total_fee.to_string(),
        });
    }

    if amount > balance.spendable() {
        return Err(WithdrawalError::InsufficientBalance {
            requested: amount.to_string(),
            available: balance.spendable().to_string(),
        });
    }

    if balance.frozen_balance != Decimal::ZERO {
        return Err(WithdrawalError::FrozenBalance {
            frozen: balance.frozen_balance.to_string(),
        });
    }

    Ok(breakdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn policy() -> WithdrawalPolicy {
        WithdrawalPolicy {
            minimum: dec!(10000),
            fixed_fee: dec!(500),
            percent_rate: dec!(0.005),
            fee_cap: dec!(5000),
        }
    }

    fn balance(available: Decimal, frozen: Decimal) -> WalletBalance {
        WalletBalance {
            available_balance: available,
            pending_balance: dec!(0),
            frozen_balance: frozen,
            reserved_balance: dec!(0),
            total_earnings: available,
            currency: "NGN".to_string(),
        }
    }

    #[test]
    fn test_fee_for_fifty_thousand() {
        // fee = min(500 + 0.5% x 50000, 5000) = min(750, 5000) = 750
        let breakdown = compute_fee(dec!(50000), &policy());
        assert_eq!(breakdown.percent_fee, dec!(250));
        assert_eq!(breakdown.total_fee, dec!(750));
        assert_eq!(breakdown.net_amount, dec!(49250));
    }

    #[test]
    fn test_fee_cap_applies_to_large_amounts() {
        // 500 + 0.5% x 1_000_000 = 5500, capped at 5000
        let breakdown = compute_fee(dec!(1000000), &policy());
        assert_eq!(breakdown.total_fee, dec!(5000));
        assert_eq!(breakdown.net_amount, dec!(995000));
    }

    #[test]
    fn test_below_minimum_rejected() {
        let err = validate_withdrawal(dec!(9999), &balance(dec!(100000), dec!(0)), &policy())
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::BelowMinimum { .. }));
    }

    #[test]
    fn test_insufficient_balance_rejected() {
        // requested 20,000 with availableBalance=15,000
        let err = validate_withdrawal(dec!(20000), &balance(dec!(15000), dec!(0)), &policy())
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_any_frozen_balance_blocks_all_withdrawals() {
        // available funds fully cover the request, but a dispute elsewhere
        // freezes the account
        let err = validate_withdrawal(dec!(20000), &balance(dec!(100000), dec!(500)), &policy())
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::FrozenBalance { .. }));
    }

    #[test]
    fn test_in_flight_withdrawal_reserves_funds() {
        // a second withdrawal arriving while the first (100,000, still
        // PENDING at the provider) is in flight must see the money as gone
        let mut b = balance(dec!(100000), dec!(0));
        b.pending_balance = dec!(-100000);
        b.reserved_balance = dec!(100000);
        let err = validate_withdrawal(dec!(100000), &b, &policy()).unwrap_err();
        match err {
            WithdrawalError::InsufficientBalance { available, .. } => {
                assert_eq!(available, "0");
            }
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_withdrawal_passes() {
        let breakdown =
            validate_withdrawal(dec!(50000), &balance(dec!(60000), dec!(0)), &policy()).unwrap();
        assert_eq!(breakdown.net_amount, dec!(49250));
    }
}
