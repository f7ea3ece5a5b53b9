//! Core type definitions

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Symbol;

/// On-chain round identifier
pub type RoundId = u64;

/// Seconds since the unix epoch
pub type UnixTimestamp = i64;

pub fn unix_now() -> UnixTimestamp {
    chrono::Utc::now().timestamp()
}

/// Lifecycle state of a data-source plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Starting,
    Running,
    Degraded,
    Crashed,
    Stopped,
}

impl PluginState {
    pub fn name(&self) -> &'static str {
        match self {
            PluginState::Starting => "starting",
            PluginState::Running => "running",
            PluginState::Degraded => "degraded",
            PluginState::Crashed => "crashed",
            PluginState::Stopped => "stopped",
        }
    }

    /// Whether the plugin takes part in a round's fan-out
    pub fn is_live(&self) -> bool {
        matches!(self, PluginState::Running | PluginState::Degraded)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single price reported by one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub symbol: Symbol,
    pub price: Decimal,
    pub timestamp: UnixTimestamp,
    pub source: String,
}

/// Observation held in a plugin's cache until its freshness deadline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedObservation {
    pub observation: PriceObservation,
    pub deadline: UnixTimestamp,
}

impl CachedObservation {
    pub fn new(observation: PriceObservation, update_interval_secs: u64) -> Self {
        let deadline = observation
            .timestamp
            .saturating_add(update_interval_secs as i64);
        Self { observation, deadline }
    }

    /// The window has elapsed once `now` reaches the deadline
    pub fn is_fresh(&self, now: UnixTimestamp) -> bool {
        now < self.deadline
    }
}

/// The single value reported on-chain for a symbol in a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub symbol: Symbol,
    pub price: Decimal,
    pub sources: usize,
    pub round: RoundId,
}

/// Round boundaries as read from the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWindow {
    pub round_id: RoundId,
    pub vote_period_secs: u64,
    pub started_at: UnixTimestamp,
}

impl RoundWindow {
    pub fn next_boundary(&self) -> UnixTimestamp {
        self.started_at.saturating_add(self.vote_period_secs as i64)
    }

    pub fn secs_until_next(&self, now: UnixTimestamp) -> u64 {
        self.next_boundary().saturating_sub(now).max(0) as u64
    }
}

/// Diagnostics view of one supervised plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub available_symbols: usize,
    pub restarts: u32,
    pub started_at: Option<UnixTimestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn observation(timestamp: UnixTimestamp) -> PriceObservation {
        PriceObservation {
            symbol: Symbol::new("BTC-USD"),
            price: dec!(100.5),
            timestamp,
            source: "sim".to_string(),
        }
    }

    #[test]
    fn test_cache_deadline_boundary() {
        let cached = CachedObservation::new(observation(1_000), 30);
        assert_eq!(cached.deadline, 1_030);
        assert!(cached.is_fresh(1_029));
        assert!(!cached.is_fresh(1_030));
        assert!(!cached.is_fresh(1_031));
    }

    #[test]
    fn test_live_states() {
        assert!(PluginState::Running.is_live());
        assert!(PluginState::Degraded.is_live());
        assert!(!PluginState::Starting.is_live());
        assert!(!PluginState::Crashed.is_live());
        assert!(!PluginState::Stopped.is_live());
    }

    #[test]
    fn test_round_window_boundary() {
        let window = RoundWindow { round_id: 7, vote_period_secs: 60, started_at: 600 };
        assert_eq!(window.next_boundary(), 660);
        assert_eq!(window.secs_until_next(630), 30);
        assert_eq!(window.secs_until_next(700), 0);
    }
}
