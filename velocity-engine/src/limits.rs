//! Velocity limits per benefit program

use crate::{Error, ProgramType, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Limit configuration for one program
///
/// `None` means the program has no cap of that kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityLimits {
    /// Maximum debit amount per day
    #[serde(default)]
    pub daily_limit: Option<Decimal>,

    /// Maximum debit amount per month
    #[serde(default)]
    pub monthly_limit: Option<Decimal>,

    /// Maximum amount of a single transaction
    #[serde(default)]
    pub transaction_limit: Option<Decimal>,

    /// Maximum number of transactions per day
    #[serde(default)]
    pub daily_transaction_count: Option<u32>,
}

impl VelocityLimits {
    /// Built-in limits for a program
    pub fn default_for(program: ProgramType) -> Self {
        match program {
            ProgramType::Snap => Self {
                daily_limit: Some(Decimal::from(200)),
                monthly_limit: None,
                transaction_limit: Some(Decimal::from(50)),
                daily_transaction_count: Some(10),
            },
            ProgramType::Tanf => Self {
                daily_limit: Some(Decimal::from(500)),
                monthly_limit: None,
                transaction_limit: Some(Decimal::from(500)),
                daily_transaction_count: Some(20),
            },
            ProgramType::Wic => Self {
                daily_limit: Some(Decimal::from(100)),
                monthly_limit: None,
                transaction_limit: Some(Decimal::from(100)),
                daily_transaction_count: Some(5),
            },
            ProgramType::Ui => Self::default(),
            ProgramType::General => Self {
                daily_limit: Some(Decimal::from(1000)),
                monthly_limit: None,
                transaction_limit: Some(Decimal::from(500)),
                daily_transaction_count: Some(50),
            },
        }
    }

    fn validate(&self, program: ProgramType) -> Result<()> {
        let amounts = [
            ("daily_limit", self.daily_limit),
            ("monthly_limit", self.monthly_limit),
            ("transaction_limit", self.transaction_limit),
        ];
        for (name, value) in amounts {
            if let Some(v) = value {
                if v < Decimal::ZERO {
                    return Err(Error::InvalidConfig(format!(
                        "{} for {} must not be negative, got {}",
                        name, program, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Limit lookup: explicit overrides first, built-in defaults otherwise
#[derive(Debug, Clone, Default)]
pub struct LimitsTable {
    overrides: HashMap<ProgramType, VelocityLimits>,
}

impl LimitsTable {
    /// Table with built-in defaults only
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration keyed by program code
    pub fn from_config(config: &BTreeMap<String, VelocityLimits>) -> Result<Self> {
        let mut table = Self::new();
        for (code, limits) in config {
            let program: ProgramType = code.parse()?;
            table.set_override(program, limits.clone())?;
        }
        Ok(table)
    }

    /// Replace the limits of one program
    pub fn set_override(&mut self, program: ProgramType, limits: VelocityLimits) -> Result<()> {
        limits.validate(program)?;
        tracing::debug!(program = %program, "Velocity limits overridden");
        self.overrides.insert(program, limits);
        Ok(())
    }

    /// Effective limits for a program
    pub fn limits_for(&self, program: ProgramType) -> VelocityLimits {
        self.overrides
            .get(&program)
            .cloned()
            .unwrap_or_else(|| VelocityLimits::default_for(program))
    }
}
