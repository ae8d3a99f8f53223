//! Paper simulator: deterministic balance/position/P&L simulation
//! with fee and slippage models, and an append-only JSON-lines trade log.
//!
//! Grounded on the teacher's `src/exec/paper.rs`: async mutate-then-log
//! idiom and the `format!("paper-{}", Uuid::new_v4())` order-id synthesis
//! convention. The order-book queue-position fill simulation in that file
//! is not reused; this module uses a closed-form slippage/fee formula
//! instead.

use std::collections::HashMap;
use std::io::Write;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::events::{CycleCompletePayload, CycleOutcome, Event, EventBus};
use crate::types::{Leg, OrderKind, PaperPosition, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyOutcome {
    Accepted,
    Refused,
}

#[derive(Debug, Serialize)]
struct TradeLogLine {
    id: String,
    timestamp: chrono::DateTime<Utc>,
    side: &'static str,
    shares: Decimal,
    price: Decimal,
    fee: Decimal,
    order_type: &'static str,
    market_slug: String,
    balance_after: Decimal,
}

pub struct PaperSimulator {
    balance: Decimal,
    starting_balance: Decimal,
    positions: HashMap<(String, Side), PaperPosition>,
    history: Vec<Decimal>,
    simulate_fees: bool,
    simulate_slippage: bool,
    slippage_pct: Decimal,
    fee_rate: Decimal,
    log_path: String,
}

impl PaperSimulator {
    #[must_use]
    pub fn new(cfg: &Config) -> Self {
        Self {
            balance: cfg.starting_balance,
            starting_balance: cfg.starting_balance,
            positions: HashMap::new(),
            history: Vec::new(),
            simulate_fees: cfg.simulate_fees,
            simulate_slippage: cfg.simulate_slippage,
            slippage_pct: cfg.slippage_pct,
            fee_rate: cfg.taker_fee_rate,
            log_path: cfg.log_file.clone(),
        }
    }

    #[must_use]
    pub const fn balance(&self) -> Decimal {
        self.balance
    }

    #[must_use]
    pub fn position(&self, market_id: &str, side: Side) -> Option<&PaperPosition> {
        self.positions.get(&(market_id.to_string(), side))
    }

    /// Effective fill price per the slippage model.
    #[must_use]
    pub fn effective_fill_price(
        &self,
        order_kind: OrderKind,
        price: Decimal,
        qty: Decimal,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Decimal {
        if !self.simulate_slippage {
            return price;
        }
        match (order_kind, best_bid, best_ask) {
            (OrderKind::TakerMarket, Some(_bid), Some(ask)) => {
                let fifty = Decimal::from(50);
                let slip = price * self.slippage_pct * (qty / fifty);
                let effective = price + (ask - price) + slip;
                let cap = ask * Decimal::new(102, 2); // 1.02
                effective.min(cap)
            }
            (OrderKind::MakerLimit, _, _) => price,
            _ => price * (Decimal::ONE + self.slippage_pct),
        }
    }

    /// Fee per the fee model.
    #[must_use]
    pub fn fee_for(&self, order_kind: OrderKind, qty: Decimal, price: Decimal) -> Decimal {
        if !self.simulate_fees {
            return Decimal::ZERO;
        }
        match order_kind {
            OrderKind::MakerLimit => Decimal::ZERO,
            OrderKind::TakerMarket => qty * price * (Decimal::ONE - price) * self.fee_rate,
        }
    }

    /// Buys `leg` for `market_id`; deducts balance and merges into the
    /// VWAP position if accepted, otherwise logs and refuses.
    pub fn buy(&mut self, leg: &Leg, market_id: &str, bus: &EventBus) -> BuyOutcome {
        let effective_price = self.effective_fill_price(
            leg.order_kind,
            leg.fill_price,
            leg.qty,
            leg.best_bid_at_fill,
            leg.best_ask_at_fill,
        );
        let fee = self.fee_for(leg.order_kind, leg.qty, effective_price);
        let total_cost = effective_price * leg.qty + fee;

        if self.balance < total_cost {
            bus.log(
                "warn",
                format!(
                    "paper buy refused: balance {} < cost {} (market {market_id})",
                    self.balance, total_cost
                ),
            );
            return BuyOutcome::Refused;
        }

        self.balance -= total_cost;
        self.merge_position(market_id, leg.side, effective_price, leg.qty);
        self.append_trade_log(
            leg.side,
            leg.qty,
            effective_price,
            fee,
            leg.order_kind,
            market_id,
        );
        bus.log(
            "info",
            format!(
                "paper buy: {} {} shares @ {} (fee {}) market {market_id}",
                leg.side.as_str(),
                leg.qty,
                effective_price,
                fee
            ),
        );
        BuyOutcome::Accepted
    }

    /// Immediate sell. Fee is always taker fee since sells are
    /// immediate. Credits `price * qty - fee`, deletes the matching
    /// position.
    pub fn sell(
        &mut self,
        token_id: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        market_id: &str,
        bus: &EventBus,
    ) -> Decimal {
        let fee = self.fee_for(OrderKind::TakerMarket, qty, price);
        let net_proceeds = price * qty - fee;
        self.balance += net_proceeds;
        self.positions.remove(&(market_id.to_string(), side));
        self.append_trade_log(side, qty, price, fee, OrderKind::TakerMarket, market_id);
        bus.log(
            "info",
            format!(
                "paper sell: {token_id} {} {} shares @ {} (fee {}) market {market_id}",
                side.as_str(),
                qty,
                price
            ),
        );
        net_proceeds
    }

    /// Pays 1.00 per share for positions on the winning side, zero for
    /// losing; deletes all positions for `market_id`.
    pub fn settle_round(&mut self, market_id: &str, winning_side: Side, bus: &EventBus) -> Decimal {
        let mut payout = Decimal::ZERO;
        let keys: Vec<(String, Side)> = self
            .positions
            .keys()
            .filter(|(m, _)| m == market_id)
            .cloned()
            .collect();
        for key in keys {
            if key.1 == winning_side {
                if let Some(pos) = self.positions.get(&key) {
                    payout += pos.qty;
                }
            }
            self.positions.remove(&key);
        }
        self.balance += payout;
        bus.publish(Event::CycleComplete(CycleCompletePayload {
            market_id: market_id.to_string(),
            status: CycleOutcome::Completed,
            profit: None,
        }));
        payout
    }

    pub fn record_cycle(&mut self, profit: Decimal) {
        self.history.push(profit);
    }

    /// Deletes all positions for `market_id` without payout or refund.
    pub fn abandon_round(&mut self, market_id: &str) {
        self.positions.retain(|(m, _), _| m != market_id);
    }

    #[must_use]
    pub const fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    fn merge_position(&mut self, market_id: &str, side: Side, price: Decimal, qty: Decimal) {
        let key = (market_id.to_string(), side);
        self.positions
            .entry(key)
            .and_modify(|pos| {
                let total_qty = pos.qty + qty;
                if total_qty > Decimal::ZERO {
                    pos.avg_price = (pos.avg_price * pos.qty + price * qty) / total_qty;
                }
                pos.qty = total_qty;
            })
            .or_insert_with(|| PaperPosition {
                market_id: market_id.to_string(),
                side,
                qty,
                avg_price: price,
                opened_at: Utc::now(),
            });
    }

    /// Writes one JSON line of the trade-log schema. Failures are
    /// swallowed and non-fatal.
    fn append_trade_log(
        &self,
        side: Side,
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
        order_kind: OrderKind,
        market_slug: &str,
    ) {
        let line = TradeLogLine {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            side: side.as_str(),
            shares,
            price,
            fee,
            order_type: match order_kind {
                OrderKind::MakerLimit => "maker-limit",
                OrderKind::TakerMarket => "taker-market",
            },
            market_slug: market_slug.to_string(),
            balance_after: self.balance,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }
}
