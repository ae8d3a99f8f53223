//! Event bus: typed outgoing events consumed by the sizer (losses),
//! the simulator (fills), and any UI. Delivery is synchronous, best-effort,
//! and non-blocking: subscribers are plain closures invoked in-line from
//! `publish`, matching the teacher's `tracing`-based structured logging
//! idiom but typed instead of string-keyed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{CycleState, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangePayload {
    pub market_id: String,
    pub from: CycleState,
    pub to: CycleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegExecutedPayload {
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Completed,
    Abandoned,
    EmergencyExit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleCompletePayload {
    pub market_id: String,
    pub status: CycleOutcome,
    pub profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyExitPayload {
    pub market_id: String,
    pub side: Side,
    pub exit_value: Decimal,
    pub profit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoundPayload {
    pub round_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdatePayload {
    pub up_bid: Option<Decimal>,
    pub up_bid_size: Option<Decimal>,
    pub up_ask: Option<Decimal>,
    pub up_ask_size: Option<Decimal>,
    pub down_bid: Option<Decimal>,
    pub down_bid_size: Option<Decimal>,
    pub down_ask: Option<Decimal>,
    pub down_ask_size: Option<Decimal>,
    pub sum: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Typed variant set: `log`, `state_change`, `leg1_executed`,
/// `leg2_executed`, `cycle_complete`, `emergency_exit`, `new_round`,
/// `price_update`, `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Log(LogPayload),
    StateChange(StateChangePayload),
    Leg1Executed(LegExecutedPayload),
    Leg2Executed(LegExecutedPayload),
    CycleComplete(CycleCompletePayload),
    EmergencyExit(EmergencyExitPayload),
    NewRound(NewRoundPayload),
    PriceUpdate(PriceUpdatePayload),
    Error(ErrorPayload),
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Event::Log(_) => "log",
            Event::StateChange(_) => "state_change",
            Event::Leg1Executed(_) => "leg1_executed",
            Event::Leg2Executed(_) => "leg2_executed",
            Event::CycleComplete(_) => "cycle_complete",
            Event::EmergencyExit(_) => "emergency_exit",
            Event::NewRound(_) => "new_round",
            Event::PriceUpdate(_) => "price_update",
            Event::Error(_) => "error",
        }
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Multi-subscriber registry. `publish` never suspends: subscribers must
/// not block or await while invoked.
pub struct EventBus {
    subscribers: std::sync::Mutex<Vec<Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(handler));
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), "publishing event");
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            sub(&event);
        }
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(Event::Log(LogPayload {
            level: level.to_string(),
            message: message.into(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
