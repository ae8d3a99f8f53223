//! Signal source contract. This is an interface only: the concrete
//! detector that watches orderbook asks and emits dip/hedge candidates is
//! explicitly out of scope. Grounded on
//! `andrew-starosciak-deep-algo/crates/core/src/traits.rs`'s async-trait
//! pattern.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::exchange::OrderbookSnapshot;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Leg1,
    Leg2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSourceKind {
    Dip,
    Surge,
    Mispricing,
}

#[derive(Debug, Clone)]
pub struct SignalCandidate {
    pub kind: SignalKind,
    pub source: SignalSourceKind,
    pub dip_side: Side,
    pub current_price: Decimal,
    pub opposite_ask: Decimal,
    pub drop_percent: Decimal,
    pub token_id: String,
    pub target_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub seconds_remaining: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MarketStartedEvent {
    pub market_id: String,
    pub end_time_ms: i64,
    pub duration_minutes: i64,
    pub up_token_id: String,
    pub down_token_id: String,
}

#[derive(Debug, Clone)]
pub struct NewRoundEvent {
    pub round_id: String,
    pub end_time_ms: i64,
    pub up_open: Option<bool>,
    pub down_open: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub leg: u8,
    pub success: bool,
    pub side: Side,
    pub price: Decimal,
    pub shares: Decimal,
    pub token_id: String,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Completed,
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct RoundCompleteEvent {
    pub status: RoundStatus,
    pub profit: Option<Decimal>,
}

/// The event stream the controller consumes from a concrete signal
/// detector.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    MarketStarted(MarketStartedEvent),
    NewRound(NewRoundEvent),
    Signal(SignalCandidate),
    Execution(ExecutionEvent),
    RoundComplete(RoundCompleteEvent),
    Error(String),
}

/// Phase the controller reports back to the source, so it knows whether to
/// keep emitting `leg1` candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Watching,
    Leg1Filled,
}

/// The narrow interface the controller is allowed to reach through to the
/// signal source: three explicit operations rather than dynamic access to
/// underlying service internals.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Blocks until the next event is available. Returns `None` when the
    /// source has shut down.
    async fn next_event(&mut self) -> anyhow::Result<Option<SignalEvent>>;

    fn set_phase(&mut self, phase: Phase);

    fn inject_orderbook(&mut self, token_id: &str, book: OrderbookSnapshot);

    fn current_asks(&self, side: Side) -> Option<Decimal>;
}

/// Default wiring target when no concrete signal detector has been
/// supplied: never produces a candidate, so the controller's startup
/// probe exhausts its three attempts and exits via `StartupError`
/// rather than silently idling. The `SignalSource` counterpart to
/// [`crate::exchange::NullExchangeAdapter`].
pub struct NullSignalSource;

#[async_trait]
impl SignalSource for NullSignalSource {
    async fn next_event(&mut self) -> anyhow::Result<Option<SignalEvent>> {
        Ok(None)
    }

    fn set_phase(&mut self, _phase: Phase) {}

    fn inject_orderbook(&mut self, _token_id: &str, _book: OrderbookSnapshot) {}

    fn current_asks(&self, _side: Side) -> Option<Decimal> {
        None
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Feeds a pre-scripted event sequence; used by controller tests.
    pub struct MockSignalSource {
        pub events: VecDeque<SignalEvent>,
        pub phase: Phase,
        pub asks: std::collections::HashMap<Side, Decimal>,
    }

    impl MockSignalSource {
        #[must_use]
        pub fn new(events: Vec<SignalEvent>) -> Self {
            Self {
                events: events.into(),
                phase: Phase::Watching,
                asks: std::collections::HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl SignalSource for MockSignalSource {
        async fn next_event(&mut self) -> anyhow::Result<Option<SignalEvent>> {
            Ok(self.events.pop_front())
        }

        fn set_phase(&mut self, phase: Phase) {
            self.phase = phase;
        }

        fn inject_orderbook(&mut self, _token_id: &str, book: OrderbookSnapshot) {
            if let Some(ask) = book.best_ask() {
                self.asks.insert(Side::Up, ask);
            }
        }

        fn current_asks(&self, side: Side) -> Option<Decimal> {
            self.asks.get(&side).copied()
        }
    }
}
