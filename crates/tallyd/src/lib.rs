//! tallyd - VPN traffic accounting daemon
//!
//! Polls WireGuard peer counters and OpenVPN session logs, turns
//! cumulative counters into reset-safe deltas and accumulates them into
//! the daily and monthly buckets of the ledger.

pub mod adapters;
pub mod aggregator;
pub mod engine;
pub mod history;
pub mod resolver;
pub mod scheduler;

pub use engine::{Engine, EngineStatus, Phase, PollReport, RolloverReport};
pub use scheduler::Scheduler;
