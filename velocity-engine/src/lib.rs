//! Velocity Engine for benefit balances
//!
//! Derives spending limits, headroom and warnings from a balance snapshot.
//! Everything here is a pure function of its inputs: the balance engine
//! gathers current and historical activity, this crate only interprets it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod types;
pub mod limits;
pub mod velocity;
pub mod warnings;

pub use error::{Error, Result};
pub use types::*;
pub use limits::{LimitsTable, VelocityLimits};
pub use velocity::VelocityHeadroom;
pub use warnings::evaluate_warnings;
