//! Tally Common - Shared types, configuration and the traffic ledger
//!
//! Used by tallyd (writer) and tallyctl (reader).

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod types;
pub mod units;
pub mod views;

pub use error::{Result, TallyError};
pub use ledger::Ledger;
pub use types::*;
