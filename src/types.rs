use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which of the two complementary outcome tokens a leg/signal concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Up => "UP",
            Side::Down => "DOWN",
        }
    }
}

/// Configured market duration. Only 15m is exercised by the controller's
/// timing math, but 5m markets (e.g. `poly5m`-style BTC windows) share the
/// same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketDuration {
    FiveMinutes,
    FifteenMinutes,
}

impl MarketDuration {
    #[must_use]
    pub const fn as_secs(self) -> i64 {
        match self {
            MarketDuration::FiveMinutes => 5 * 60,
            MarketDuration::FifteenMinutes => 15 * 60,
        }
    }
}

/// One round of the binary option. Becomes current on rotation, immutable
/// thereafter, replaced when the next rotation fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub duration: MarketDuration,
    pub up_token_id: String,
    pub down_token_id: String,
    pub end_time: DateTime<Utc>,
}

impl Market {
    #[must_use]
    pub fn token_id(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }

    /// Seconds remaining until `end_time`, clamped at 0.
    #[must_use]
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }
}

/// How an order was worked: resting limit (zero taker fee) or immediate
/// fill-or-kill market order (fee charged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    MakerLimit,
    TakerMarket,
}

/// A filled purchase on one side of a cycle.
///
/// Invariant: `fill_price` strictly in (0, 1); `qty` > 0. Enforced in `new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub side: Side,
    pub fill_price: Decimal,
    pub qty: Decimal,
    pub token_id: String,
    pub order_kind: OrderKind,
    pub best_bid_at_fill: Option<Decimal>,
    pub best_ask_at_fill: Option<Decimal>,
    pub order_id: Option<String>,
    pub filled_at: DateTime<Utc>,
}

impl Leg {
    /// Returns `None` if `fill_price` is not strictly in (0, 1) or `qty` is
    /// not positive. The leg-admission gates rely on this constructor never
    /// producing an out-of-range leg.
    #[must_use]
    pub fn new(
        side: Side,
        fill_price: Decimal,
        qty: Decimal,
        token_id: String,
        order_kind: OrderKind,
        best_bid_at_fill: Option<Decimal>,
        best_ask_at_fill: Option<Decimal>,
        order_id: Option<String>,
        filled_at: DateTime<Utc>,
    ) -> Option<Self> {
        if fill_price <= Decimal::ZERO || fill_price >= Decimal::ONE {
            return None;
        }
        if qty <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            side,
            fill_price,
            qty,
            token_id,
            order_kind,
            best_bid_at_fill,
            best_ask_at_fill,
            order_id,
            filled_at,
        })
    }

    #[must_use]
    pub fn cost(&self) -> Decimal {
        self.fill_price * self.qty
    }
}

/// The controller's per-cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    Watching,
    Leg1Pending,
    WaitingForHedge,
    Leg2Pending,
    Completed,
    EmergencyExit,
}

/// A per-market unit of work. At most one cycle is non-terminal at a time.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub market: Market,
    pub leg1: Option<Leg>,
    pub leg2: Option<Leg>,
    pub state: CycleState,
    /// Once set, bars re-entry until market rotation. Preserved across
    /// order failures: a rejected order must not reopen this market to a
    /// second entry attempt.
    pub cycle_attempted_this_market: bool,
    /// Guards idempotent finalization. Once true, repeat finalize calls
    /// are no-ops.
    pub cycle_finalized: bool,
}

impl Cycle {
    #[must_use]
    pub fn new(market: Market) -> Self {
        Self {
            market,
            leg1: None,
            leg2: None,
            state: CycleState::Watching,
            cycle_attempted_this_market: false,
            cycle_finalized: false,
        }
    }
}

/// Which leg/side an in-flight exchange order serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Leg1Buy,
    Leg2Buy,
    Leg1ExitSell,
    Leg2ExitSell,
}

/// A live exchange order the controller is awaiting a terminal status for.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order_id: String,
    pub intent: OrderIntent,
    pub limit_price: Decimal,
    pub target_qty: Decimal,
    pub poll_started_at: Instant,
}

/// Two bounded rolling ask-price sequences, trimmed to a 5-minute window.
/// Used only for emergency-exit P&L estimation.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    up_asks: VecDeque<(Decimal, Instant)>,
    down_asks: VecDeque<(Decimal, Instant)>,
}

const HISTORY_WINDOW_SECS: u64 = 5 * 60;

impl PriceHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, side: Side, price: Decimal, now: Instant) {
        let series = self.series_mut(side);
        series.push_back((price, now));
        while let Some((_, t)) = series.front() {
            if now.duration_since(*t).as_secs() > HISTORY_WINDOW_SECS {
                series.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.up_asks.clear();
        self.down_asks.clear();
    }

    #[must_use]
    pub fn last(&self, side: Side) -> Option<Decimal> {
        self.series(side).back().map(|(p, _)| *p)
    }

    fn series(&self, side: Side) -> &VecDeque<(Decimal, Instant)> {
        match side {
            Side::Up => &self.up_asks,
            Side::Down => &self.down_asks,
        }
    }

    fn series_mut(&mut self, side: Side) -> &mut VecDeque<(Decimal, Instant)> {
        match side {
            Side::Up => &mut self.up_asks,
            Side::Down => &mut self.down_asks,
        }
    }
}

/// Cycle-level outcome counters. Mutated only by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub cycles_won: u64,
    pub total_profit: Decimal,
    pub emergency_exits: u64,
}

impl StrategyStats {
    #[must_use]
    pub fn win_rate(&self) -> Decimal {
        let denom = self.cycles_completed + self.cycles_abandoned;
        if denom == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.cycles_won) / Decimal::from(denom)
    }
}

/// Per (market id, side) aggregate held by the paper simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub market_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub opened_at: DateTime<Utc>,
}
