//! Price aggregator: polls orderbook state from the signal source's
//! cached book, maintains bid/ask snapshots and a rolling price history,
//! with a serialized REST-snapshot fallback when the cache stalls.
//!
//! Grounded on the teacher's `src/market_manager.rs` polling-interval loop
//! shape (fixed-cadence `tokio::time::interval`, detect-staleness-then-act)
//! and `src/engine/signal.rs`'s order-book reading helpers. The EMA/
//! momentum scoring itself is not reused; only a rolling history and a
//! price_update event are needed here.

use std::time::Instant;

use rust_decimal::Decimal;

use crate::events::{Event, EventBus, PriceUpdatePayload};
use crate::exchange::{ExchangeAdapter, OrderbookSnapshot};
use crate::types::{PriceHistory, Side};

#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub up_bid: Option<Decimal>,
    pub up_bid_size: Option<Decimal>,
    pub up_ask: Option<Decimal>,
    pub up_ask_size: Option<Decimal>,
    pub down_bid: Option<Decimal>,
    pub down_bid_size: Option<Decimal>,
    pub down_ask: Option<Decimal>,
    pub down_ask_size: Option<Decimal>,
}

impl BookSnapshot {
    #[must_use]
    pub fn sum(&self) -> Option<Decimal> {
        Some(self.up_ask? + self.down_ask?)
    }
}

pub struct PriceAggregator {
    pub history: PriceHistory,
    last_snapshot: BookSnapshot,
    last_advanced_at: Instant,
    rest_in_flight: bool,
}

impl PriceAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: PriceHistory::new(),
            last_snapshot: BookSnapshot::default(),
            last_advanced_at: Instant::now(),
            rest_in_flight: false,
        }
    }

    /// Called on each polling tick with the signal source's cached book
    /// for both tokens. Appends to the rolling ask history when prices
    /// change and emits a `price_update` event.
    pub fn on_book_tick(
        &mut self,
        up: Option<&OrderbookSnapshot>,
        down: Option<&OrderbookSnapshot>,
        now: Instant,
        bus: &EventBus,
    ) {
        let snapshot = BookSnapshot {
            up_bid: up.and_then(OrderbookSnapshot::best_bid),
            up_bid_size: None,
            up_ask: up.and_then(OrderbookSnapshot::best_ask),
            up_ask_size: None,
            down_bid: down.and_then(OrderbookSnapshot::best_bid),
            down_bid_size: None,
            down_ask: down.and_then(OrderbookSnapshot::best_ask),
            down_ask_size: None,
        };

        let advanced = snapshot.up_ask != self.last_snapshot.up_ask
            || snapshot.down_ask != self.last_snapshot.down_ask;

        if advanced {
            if let Some(p) = snapshot.up_ask {
                self.history.push(Side::Up, p, now);
            }
            if let Some(p) = snapshot.down_ask {
                self.history.push(Side::Down, p, now);
            }
            self.last_advanced_at = now;
        }

        bus.publish(Event::PriceUpdate(PriceUpdatePayload {
            up_bid: snapshot.up_bid,
            up_bid_size: snapshot.up_bid_size,
            up_ask: snapshot.up_ask,
            up_ask_size: snapshot.up_ask_size,
            down_bid: snapshot.down_bid,
            down_bid_size: snapshot.down_bid_size,
            down_ask: snapshot.down_ask,
            down_ask_size: snapshot.down_ask_size,
            sum: snapshot.sum(),
        }));

        self.last_snapshot = snapshot;
    }

    /// True when the cache hasn't advanced in 5s and no REST fetch is
    /// currently in flight. The caller should fetch a snapshot and
    /// inject it into the signal source via
    /// [`crate::signal::SignalSource::inject_orderbook`].
    #[must_use]
    pub fn should_fetch_rest_fallback(&self, now: Instant) -> bool {
        !self.rest_in_flight && now.duration_since(self.last_advanced_at).as_secs() >= 5
    }

    pub fn mark_rest_fetch_started(&mut self) {
        self.rest_in_flight = true;
    }

    pub fn mark_rest_fetch_finished(&mut self) {
        self.rest_in_flight = false;
    }

    #[must_use]
    pub fn last_ask(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Up => self.last_snapshot.up_ask,
            Side::Down => self.last_snapshot.down_ask,
        }
    }
}

impl Default for PriceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch an orderbook snapshot via the exchange adapter's REST endpoint.
/// Used only by the at-most-one-in-flight fallback path.
pub async fn fetch_rest_snapshot(
    adapter: &dyn ExchangeAdapter,
    token_id: &str,
) -> anyhow::Result<OrderbookSnapshot> {
    adapter.get_orderbook(token_id).await
}
