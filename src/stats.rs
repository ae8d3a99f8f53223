//! Strategy stats & reporting, grounded in the teacher's `report.rs`.
//! The concrete home for strategy stats, pulled out of `controller.rs`
//! the way the teacher pulls `report.rs` out of `state/ticker.rs`.
//!
//! [`StatsRegistry`] is the multi-asset counterpart: an `assets: Vec<String>`
//! config field implies one controller per configured asset running
//! concurrently, each publishing `cycle_complete`/`emergency_exit` onto its
//! own [`crate::events::EventBus`]. The registry subscribes to each bus
//! and holds a read-only snapshot per asset, mirroring the teacher's
//! `state/mod.rs::Shared.tickers: Arc<DashMap<String, Arc<TickerState>>>`:
//! a concurrent map multiple async tasks write into and a future
//! dashboard (out of scope here) reads from. The controller's exclusive
//! ownership of its own `StrategyStats` is unaffected: the registry only
//! ever stores a cloned snapshot, never a handle back into the controller.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::events::{CycleOutcome, Event, EventBus};
use crate::types::StrategyStats;

/// Logs a structured snapshot of the running totals, matching
/// `report.rs::log_position`'s field-per-metric convention.
pub fn log_snapshot(market_id: &str, stats: &StrategyStats) {
    info!(
        market_id = %market_id,
        cycles_completed = stats.cycles_completed,
        cycles_abandoned = stats.cycles_abandoned,
        cycles_won = stats.cycles_won,
        total_profit = %stats.total_profit,
        emergency_exits = stats.emergency_exits,
        win_rate = %stats.win_rate(),
        "strategy stats snapshot"
    );
}

/// Per-asset stats snapshots, keyed by asset symbol.
/// Cheap to clone (`Arc` inside); a bootstrap that spawns one controller
/// per configured asset hands each controller's `EventBus` to
/// [`StatsRegistry::track`] and keeps one registry for the whole process.
#[derive(Debug, Clone, Default)]
pub struct StatsRegistry {
    snapshots: Arc<DashMap<String, StrategyStats>>,
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// Registers `asset` against `bus`: every `cycle_complete`/
    /// `emergency_exit` event bumps a running tally for that asset. The
    /// subscriber closure only ever inserts/mutates its own entry, so
    /// concurrent buses for different assets never contend on the same
    /// `DashMap` shard key.
    pub fn track(&self, asset: &str, bus: &EventBus) {
        let snapshots = self.snapshots.clone();
        let asset = asset.to_string();
        bus.subscribe(move |event| {
            let mut entry = snapshots.entry(asset.clone()).or_default();
            match event {
                Event::CycleComplete(payload) => {
                    match payload.status {
                        CycleOutcome::Completed => {
                            entry.cycles_completed += 1;
                            if let Some(profit) = payload.profit {
                                entry.total_profit += profit;
                                if profit > rust_decimal::Decimal::ZERO {
                                    entry.cycles_won += 1;
                                }
                            }
                        }
                        CycleOutcome::Abandoned => entry.cycles_abandoned += 1,
                        CycleOutcome::EmergencyExit => {}
                    }
                }
                Event::EmergencyExit(_) => entry.emergency_exits += 1,
                _ => {}
            }
        });
    }

    #[must_use]
    pub fn snapshot(&self, asset: &str) -> Option<StrategyStats> {
        self.snapshots.get(asset).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CycleCompletePayload, EmergencyExitPayload};
    use crate::types::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn log_snapshot_does_not_panic_on_empty_stats() {
        log_snapshot("m1", &StrategyStats::default());
    }

    #[test]
    fn registry_tallies_events_per_asset() {
        let bus = EventBus::new();
        let registry = StatsRegistry::new();
        registry.track("BTC", &bus);

        bus.publish(Event::CycleComplete(CycleCompletePayload {
            market_id: "m1".into(),
            status: CycleOutcome::Completed,
            profit: Some(dec!(10)),
        }));
        bus.publish(Event::EmergencyExit(EmergencyExitPayload {
            market_id: "m2".into(),
            side: Side::Up,
            exit_value: dec!(0),
            profit: dec!(-5),
        }));

        let snap = registry.snapshot("BTC").unwrap();
        assert_eq!(snap.cycles_completed, 1);
        assert_eq!(snap.cycles_won, 1);
        assert_eq!(snap.total_profit, dec!(10));
        assert_eq!(snap.emergency_exits, 1);
        assert!(registry.snapshot("ETH").is_none());
    }
}
