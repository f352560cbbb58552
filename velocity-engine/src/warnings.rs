//! Balance warning evaluation
//!
//! Every rule is evaluated independently; the output keeps rule order
//! (low balance, daily limit, velocity, pending).

use crate::{ActivitySnapshot, Severity, VelocityLimits, Warning, WarningKind};
use rust_decimal::Decimal;

/// Durable balance below this raises `LOW_BALANCE`
pub const LOW_BALANCE_THRESHOLD: Decimal = Decimal::from_parts(50, 0, 0, false, 0);

/// Fraction of a limit above which a limit warning fires (0.8)
pub const NEAR_LIMIT_RATIO: Decimal = Decimal::from_parts(8, 0, 0, false, 1);

/// Fraction of the available balance pending debits may reach (0.5)
pub const HIGH_PENDING_RATIO: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Evaluate all warning rules for a snapshot
pub fn evaluate_warnings(snapshot: &ActivitySnapshot, limits: &VelocityLimits) -> Vec<Warning> {
    let mut warnings = Vec::new();

    if snapshot.current_balance < LOW_BALANCE_THRESHOLD {
        warnings.push(Warning {
            kind: WarningKind::LowBalance,
            message: "Balance is running low".to_string(),
            severity: Severity::Medium,
        });
    }

    if let Some(daily_limit) = limits.daily_limit {
        if snapshot.daily_spent > daily_limit * NEAR_LIMIT_RATIO {
            warnings.push(Warning {
                kind: WarningKind::NearDailyLimit,
                message: format!(
                    "Approaching daily spending limit (${}/${})",
                    snapshot.daily_spent.normalize(),
                    daily_limit.normalize()
                ),
                severity: Severity::High,
            });
        }
    }

    if let Some(max_count) = limits.daily_transaction_count {
        if Decimal::from(snapshot.daily_transaction_count) > Decimal::from(max_count) * NEAR_LIMIT_RATIO {
            warnings.push(Warning {
                kind: WarningKind::HighVelocity,
                message: format!(
                    "Unusually high transaction activity ({}/{} today)",
                    snapshot.daily_transaction_count, max_count
                ),
                severity: Severity::Medium,
            });
        }
    }

    if snapshot.pending_debits > snapshot.available_balance * HIGH_PENDING_RATIO {
        warnings.push(Warning {
            kind: WarningKind::HighPending,
            message: "Large amount in pending transactions".to_string(),
            severity: Severity::Low,
        });
    }

    warnings
}
