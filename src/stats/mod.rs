//! Session and broadcaster statistics

pub mod metrics;

pub use metrics::{BroadcastStats, Counters, SessionStats};
