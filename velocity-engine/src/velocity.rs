//! Remaining velocity headroom for an account

use crate::{ActivitySnapshot, VelocityLimits};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What is left of each velocity limit today / this month
///
/// A field is `None` when the program has no such limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityHeadroom {
    /// Daily limit minus daily spend, floored at zero
    pub remaining_daily_amount: Option<Decimal>,

    /// Monthly limit minus monthly spend, floored at zero
    pub remaining_monthly_amount: Option<Decimal>,

    /// Daily transaction count limit minus today's count
    pub remaining_transactions: Option<u32>,

    /// Largest single transaction allowed, capped by what is left today
    pub max_next_transaction: Option<Decimal>,
}

impl VelocityHeadroom {
    /// Compute headroom from activity and limits
    pub fn compute(snapshot: &ActivitySnapshot, limits: &VelocityLimits) -> Self {
        let remaining_daily_amount = limits
            .daily_limit
            .map(|limit| (limit - snapshot.daily_spent).max(Decimal::ZERO));
        let remaining_monthly_amount = limits
            .monthly_limit
            .map(|limit| (limit - snapshot.monthly_spent).max(Decimal::ZERO));
        let remaining_transactions = limits
            .daily_transaction_count
            .map(|limit| limit.saturating_sub(snapshot.daily_transaction_count));

        let caps = [
            limits.transaction_limit,
            remaining_daily_amount,
            remaining_monthly_amount,
        ];
        let max_next_transaction = caps.into_iter().flatten().min();

        Self {
            remaining_daily_amount,
            remaining_monthly_amount,
            remaining_transactions,
            max_next_transaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProgramType;

    #[test]
    fn test_headroom_snap() {
        let limits = VelocityLimits::default_for(ProgramType::Snap);
        let snapshot = ActivitySnapshot {
            daily_spent: Decimal::from(170),
            daily_transaction_count: 4,
            ..Default::default()
        };
        let headroom = VelocityHeadroom::compute(&snapshot, &limits);
        assert_eq!(headroom.remaining_daily_amount, Some(Decimal::from(30)));
        assert_eq!(headroom.remaining_monthly_amount, None);
        assert_eq!(headroom.remaining_transactions, Some(6));
        // Per-transaction cap of 50 is above the 30 left today
        assert_eq!(headroom.max_next_transaction, Some(Decimal::from(30)));
    }

    #[test]
    fn test_headroom_floors_at_zero() {
        let limits = VelocityLimits {
            daily_limit: Some(Decimal::from(100)),
            monthly_limit: Some(Decimal::from(300)),
            transaction_limit: None,
            daily_transaction_count: Some(5),
        };
        let snapshot = ActivitySnapshot {
            daily_spent: Decimal::from(120),
            monthly_spent: Decimal::from(400),
            daily_transaction_count: 7,
            ..Default::default()
        };
        let headroom = VelocityHeadroom::compute(&snapshot, &limits);
        assert_eq!(headroom.remaining_daily_amount, Some(Decimal::ZERO));
        assert_eq!(headroom.remaining_monthly_amount, Some(Decimal::ZERO));
        assert_eq!(headroom.remaining_transactions, Some(0));
        assert_eq!(headroom.max_next_transaction, Some(Decimal::ZERO));
    }

    #[test]
    fn test_unlimited_program() {
        let limits = VelocityLimits::default_for(ProgramType::Ui);
        let headroom = VelocityHeadroom::compute(&ActivitySnapshot::default(), &limits);
        assert_eq!(headroom, VelocityHeadroom::default());
    }
}
