//! Core types for velocity engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Benefit program an account belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgramType {
    /// Supplemental Nutrition Assistance Program
    #[serde(rename = "SNAP")]
    Snap,
    /// Temporary Assistance for Needy Families
    #[serde(rename = "TANF")]
    Tanf,
    /// Women, Infants, and Children
    #[serde(rename = "WIC")]
    Wic,
    /// Unemployment Insurance
    #[serde(rename = "UI")]
    Ui,
    /// Any other program (generic limits)
    #[serde(rename = "GENERAL")]
    General,
}

impl ProgramType {
    /// Program code as stored and transmitted
    pub fn code(&self) -> &'static str {
        match self {
            ProgramType::Snap => "SNAP",
            ProgramType::Tanf => "TANF",
            ProgramType::Wic => "WIC",
            ProgramType::Ui => "UI",
            ProgramType::General => "GENERAL",
        }
    }

    /// Parse from program code (case-insensitive)
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "SNAP" => Some(ProgramType::Snap),
            "TANF" => Some(ProgramType::Tanf),
            "WIC" => Some(ProgramType::Wic),
            "UI" => Some(ProgramType::Ui),
            "GENERAL" => Some(ProgramType::General),
            _ => None,
        }
    }

    /// Parse from program code, mapping anything unknown to `General`
    pub fn from_code_or_general(code: &str) -> Self {
        Self::from_code(code).unwrap_or(ProgramType::General)
    }
}

impl FromStr for ProgramType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s).ok_or_else(|| crate::Error::UnknownProgram(s.to_string()))
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Balance and activity figures the evaluator needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Durable balance
    pub current_balance: Decimal,

    /// Current balance minus outstanding debit holds
    pub available_balance: Decimal,

    /// Sum of outstanding debit holds
    pub pending_debits: Decimal,

    /// Debits posted since start of day (UTC)
    pub daily_spent: Decimal,

    /// Debits posted since start of month (UTC)
    pub monthly_spent: Decimal,

    /// Transactions posted since start of day (UTC)
    pub daily_transaction_count: u32,
}

/// Warning category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    /// Durable balance below the low-balance threshold
    LowBalance,
    /// Daily spend above 80% of the daily limit
    NearDailyLimit,
    /// Daily transaction count above 80% of the count limit
    HighVelocity,
    /// Pending debits above half the available balance
    HighPending,
}

impl WarningKind {
    /// Wire code
    pub fn code(&self) -> &'static str {
        match self {
            WarningKind::LowBalance => "LOW_BALANCE",
            WarningKind::NearDailyLimit => "NEAR_DAILY_LIMIT",
            WarningKind::HighVelocity => "HIGH_VELOCITY",
            WarningKind::HighPending => "HIGH_PENDING",
        }
    }
}

/// Warning severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Needs attention
    Medium,
    /// Act now
    High,
}

/// A single balance warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Category
    #[serde(rename = "type")]
    pub kind: WarningKind,

    /// Human readable message
    pub message: String,

    /// Severity
    pub severity: Severity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_from_code() {
        assert_eq!(ProgramType::from_code("SNAP"), Some(ProgramType::Snap));
        assert_eq!(ProgramType::from_code("tanf"), Some(ProgramType::Tanf));
        assert_eq!(ProgramType::from_code("LIHEAP"), None);
        assert_eq!(ProgramType::from_code_or_general("LIHEAP"), ProgramType::General);
    }

    #[test]
    fn test_program_from_str_strict() {
        assert!("WIC".parse::<ProgramType>().is_ok());
        assert!(matches!(
            "LIHEAP".parse::<ProgramType>(),
            Err(crate::Error::UnknownProgram(_))
        ));
    }

    #[test]
    fn test_warning_wire_format() {
        let warning = Warning {
            kind: WarningKind::NearDailyLimit,
            message: "x".to_string(),
            severity: Severity::High,
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["type"], "NEAR_DAILY_LIMIT");
        assert_eq!(json["severity"], "high");
    }
}
