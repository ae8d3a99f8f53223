//! Arbitrage controller: the state machine. Owns the cycle, fill
//! polling, emergency timer, exit sells, market-rotation cleanup, and
//! stats. This is the largest module and the hard part of the
//! system: it must preserve strong invariants (one entry per market,
//! idempotent cycle finalization, no orphaned orders across rotations)
//! while several asynchronous event sources race against each other.
//!
//! Grounded on the teacher's `src/engine/task.rs` for the
//! `tokio::select!`-over-interval-and-notify event-loop idiom and
//! `src/market_manager.rs` for the market-rotation procedure (clear
//! per-market flags, cancel stale orders, transition back to a rest
//! state). The teacher's `src/engine/decision.rs` continuous
//! momentum/inventory strategy is not reused. Only its idiom of small
//! named pure-function gate helpers composed into one entry point is
//! kept, here as the admission-gate methods below.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StartupError;
use crate::events::{
    CycleCompletePayload, CycleOutcome, EmergencyExitPayload, Event, EventBus, LegExecutedPayload,
};
use crate::exchange::{
    CreateOrderResult, ExchangeAdapter, OrderSide, OrderStatus, OrderStatusReport,
    SettlementStrategy,
};
use crate::fees::{decide_leg1_order_kind, decide_leg2_order_kind};
use crate::paper::PaperSimulator;
use crate::signal::{
    MarketStartedEvent, NewRoundEvent, Phase, RoundCompleteEvent, RoundStatus, SignalCandidate,
    SignalEvent, SignalKind, SignalSource, SignalSourceKind,
};
use crate::sizer::PositionSizer;
use crate::stats::log_snapshot;
use crate::types::{
    Cycle, CycleState, Leg, Market, MarketDuration, OrderIntent, OrderKind, PendingOrder,
    PriceHistory, Side, StrategyStats,
};

/// Resting exit-sell price: harvest the winning side before resolution.
const EXIT_SELL_PRICE: Decimal = dec!(0.99);

/// Price/token validity gate shared by leg-1 and leg-2 admission.
fn price_and_token_valid(price: Decimal, token_id: &str, market: &Market) -> bool {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return false;
    }
    token_id == market.up_token_id || token_id == market.down_token_id
}

/// The controller's per-market state machine.
///
/// `E` is the exchange adapter, `S` the signal source. Both are consumed
/// through their trait contracts, never a concrete implementation (those
/// are explicitly out of scope here).
pub struct ArbitrageController<S: SignalSource, E: ExchangeAdapter> {
    cfg: Config,
    bus: Arc<EventBus>,
    sizer: PositionSizer,
    paper: PaperSimulator,
    exchange: Arc<E>,
    signal: S,
    stats: StrategyStats,
    cycle: Option<Cycle>,
    price_history: PriceHistory,
    pending_leg1_buy: Option<PendingOrder>,
    pending_leg2_buy: Option<PendingOrder>,
    /// The dip side a pending leg-1 buy targets. `PendingOrder` itself
    /// only names the order id/price/qty; the side is tracked here so a
    /// later fill can be turned back into a `Leg`.
    pending_leg1_side: Option<Side>,
    leg1_exit_order_id: Option<String>,
    leg2_exit_order_id: Option<String>,
    expected_order_ids: HashSet<String>,
    emergency_timer_active: bool,
    in_poll: bool,
    live_mode: bool,
    /// Threaded from the most recent `MarketStarted` event. `on_new_round`
    /// updates `cycle.market.end_time` from this field, not from the
    /// incoming `NewRound.end_time`. Preserved verbatim as observed
    /// behavior, flagged here and in DESIGN.md rather than re-derived.
    market_end_time_ms: Option<i64>,
}

impl<S: SignalSource, E: ExchangeAdapter> ArbitrageController<S, E> {
    #[must_use]
    pub fn new(cfg: Config, bus: Arc<EventBus>, exchange: Arc<E>, signal: S) -> Self {
        let live_mode = !cfg.paper_enabled;
        let sizer = PositionSizer::new(&cfg);
        let paper = PaperSimulator::new(&cfg);
        Self {
            cfg,
            bus,
            sizer,
            paper,
            exchange,
            signal,
            stats: StrategyStats::default(),
            cycle: None,
            price_history: PriceHistory::new(),
            pending_leg1_buy: None,
            pending_leg2_buy: None,
            pending_leg1_side: None,
            leg1_exit_order_id: None,
            leg2_exit_order_id: None,
            expected_order_ids: HashSet::new(),
            emergency_timer_active: false,
            in_poll: false,
            live_mode,
            market_end_time_ms: None,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &StrategyStats {
        &self.stats
    }

    #[must_use]
    pub fn state(&self) -> Option<CycleState> {
        self.cycle.as_ref().map(|c| c.state)
    }

    /// The controller's event loop: single-threaded, cooperative.
    /// Runs until the signal source's event stream ends. Three
    /// suspension points race against each other: signal-source events,
    /// a 1s emergency-timer tick, and a fill-poll tick. None may leave
    /// the state machine in an inconsistent transient state, so every
    /// handler below completes its state mutations before yielding back
    /// to `select!`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.wait_for_first_market().await?;

        let mut emergency_interval = tokio::time::interval(Duration::from_secs(1));
        let mut poll_interval =
            tokio::time::interval(Duration::from_millis(self.cfg.gtc_poll_interval_ms));

        loop {
            tokio::select! {
                ev = self.signal.next_event() => {
                    match ev? {
                        Some(event) => self.handle_signal_event(event).await,
                        None => return Ok(()),
                    }
                }
                _ = emergency_interval.tick() => {
                    self.check_emergency_trigger().await;
                }
                _ = poll_interval.tick() => {
                    self.poll_tick().await;
                }
            }
        }
    }

    /// Three attempts, 30s apart, to observe a `MarketStarted` event
    /// before giving up.
    async fn wait_for_first_market(&mut self) -> Result<(), StartupError> {
        const ATTEMPTS: u32 = 3;
        const INTERVAL_SECS: u64 = 30;

        for attempt in 0..ATTEMPTS {
            match self.signal.next_event().await {
                Ok(Some(SignalEvent::MarketStarted(ev))) => {
                    self.on_market_started(ev).await;
                    return Ok(());
                }
                Ok(Some(_other)) => {
                    // Non-rotation event before the first market; keep waiting.
                }
                Ok(None) | Err(_) => {
                    if attempt + 1 < ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(INTERVAL_SECS)).await;
                    }
                }
            }
        }

        self.bus.publish(Event::Error(crate::events::ErrorPayload {
            message: "no active market found at startup".to_string(),
        }));
        Err(StartupError::NoActiveMarket {
            attempts: ATTEMPTS,
            interval_secs: INTERVAL_SECS,
        })
    }

    async fn handle_signal_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::MarketStarted(ev) => self.on_market_started(ev).await,
            SignalEvent::NewRound(ev) => self.on_new_round(ev),
            SignalEvent::Signal(sig) => self.on_signal(sig).await,
            SignalEvent::Execution(ev) => self.on_execution(ev).await,
            SignalEvent::RoundComplete(ev) => self.on_round_complete(ev).await,
            SignalEvent::Error(msg) => {
                warn!(error = %msg, "signal source reported an error");
                self.bus
                    .publish(Event::Error(crate::events::ErrorPayload { message: msg }));
            }
        }
    }

    // ---- Market rotation ----

    async fn on_market_started(&mut self, ev: MarketStartedEvent) {
        let old_market_id = self.cycle.as_ref().map(|c| c.market.market_id.clone());

        // Preempt any pending leg orders before entering the new market's
        // Watching state.
        self.cancel_all_pending().await;

        if self.live_mode {
            if let Some(market_id) = &old_market_id {
                match self
                    .exchange
                    .settle_market(SettlementStrategy::Redeem, market_id)
                    .await
                {
                    Ok(result) if !result.success => {
                        warn!(market_id = %market_id, "settle_market reported failure, non-fatal");
                    }
                    Err(e) => {
                        warn!(market_id = %market_id, error = %e, "settle_market errored, non-fatal");
                    }
                    _ => {}
                }
            }
        }

        let duration = if ev.duration_minutes <= 5 {
            MarketDuration::FiveMinutes
        } else {
            MarketDuration::FifteenMinutes
        };
        let end_time = chrono::DateTime::from_timestamp_millis(ev.end_time_ms).unwrap_or_else(Utc::now);
        let market = Market {
            market_id: ev.market_id.clone(),
            duration,
            up_token_id: ev.up_token_id,
            down_token_id: ev.down_token_id,
            end_time,
        };
        self.market_end_time_ms = Some(ev.end_time_ms);

        self.price_history.clear();
        self.expected_order_ids.clear();
        self.emergency_timer_active = false;

        self.cycle = Some(Cycle::new(market));
        self.signal.set_phase(Phase::Watching);

        info!(market_id = %ev.market_id, "market rotation complete");
    }

    /// If the current state is not `Watching`, only the round identifier
    /// is updated; mid-cycle state is never touched by a `NewRound`. If
    /// the state is `Watching`, the market end time is refreshed from
    /// the last `MarketStarted`'s `end_time_ms`, not from this event's
    /// own `end_time_ms`. Preserved verbatim as observed behavior rather
    /// than "fixed".
    fn on_new_round(&mut self, ev: NewRoundEvent) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        if cycle.state != CycleState::Watching {
            debug!(round_id = %ev.round_id, "new_round mid-cycle: identifier only");
            return;
        }
        if let Some(end_ms) = self.market_end_time_ms {
            if let Some(end_time) = chrono::DateTime::from_timestamp_millis(end_ms) {
                cycle.market.end_time = end_time;
            }
        }
    }

    // ---- Leg-1 / Leg-2 admission & execution ----

    async fn on_signal(&mut self, sig: SignalCandidate) {
        let Some(state) = self.state() else {
            return;
        };
        match (state, sig.kind) {
            (CycleState::Watching, SignalKind::Leg1) => self.try_enter_leg1(sig).await,
            (CycleState::WaitingForHedge, SignalKind::Leg2) => self.try_enter_leg2(sig).await,
            _ => debug!(state = ?state, kind = ?sig.kind, "signal dropped: wrong state/kind"),
        }
    }

    /// Gates evaluated in a fixed order; the first failure rejects the
    /// signal.
    async fn try_enter_leg1(&mut self, sig: SignalCandidate) {
        let now = Utc::now();
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };

        // 1. state must be Watching (checked by caller).
        // 2. one entry per market.
        if cycle.cycle_attempted_this_market {
            debug!("leg1 rejected: cycle already attempted this market");
            return;
        }
        // 3. would not immediately emergency-exit.
        let exit_cutoff = self.cfg.exit_before_expiry_minutes * 60;
        let seconds_remaining = cycle.market.seconds_remaining(now);
        if seconds_remaining <= exit_cutoff {
            debug!(seconds_remaining, "leg1 rejected: too close to expiry");
            return;
        }
        // 4. only dip signals are acted upon.
        if sig.source != SignalSourceKind::Dip {
            debug!(source = ?sig.source, "leg1 rejected: not a dip signal");
            return;
        }
        // 5. sizer must not be paused.
        if self.sizer.is_trading_paused(now) {
            debug!("leg1 rejected: sizer paused (cooldown active)");
            return;
        }
        // 6. sizer must return a tradeable quantity.
        let balance = if self.live_mode {
            match self.exchange.get_balance().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "leg1 rejected: failed to fetch live balance");
                    return;
                }
            }
        } else {
            self.paper.balance()
        };
        let qty = self.sizer.calculate_shares(balance, sig.current_price, now);
        if qty <= Decimal::ZERO {
            debug!("leg1 rejected: sizer returned 0 shares");
            return;
        }
        // 7. price/token validity (stale-market rejection).
        if !price_and_token_valid(sig.current_price, &sig.token_id, &cycle.market) {
            debug!("leg1 rejected: price out of range or stale token id");
            return;
        }

        let order_kind = decide_leg1_order_kind(
            sig.current_price,
            sig.opposite_ask,
            self.cfg.default_sum_target,
            self.cfg.use_maker_orders,
            self.cfg.maker_fallback_to_taker,
            self.cfg.taker_fee_rate,
        );

        // Barred from re-entry until rotation, regardless of what happens
        // in execution below. Order failures keep this set.
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.cycle_attempted_this_market = true;
        }

        self.execute_leg1(sig, qty, order_kind).await;
    }

    async fn execute_leg1(&mut self, sig: SignalCandidate, qty: Decimal, order_kind: OrderKind) {
        let Some(market_id) = self.cycle.as_ref().map(|c| c.market.market_id.clone()) else {
            return;
        };

        if !self.live_mode {
            let leg = Leg::new(
                sig.dip_side,
                sig.current_price,
                qty,
                sig.token_id.clone(),
                order_kind,
                sig.best_bid,
                sig.best_ask,
                None,
                Utc::now(),
            );
            let Some(leg) = leg else {
                return;
            };
            if self.paper.buy(&leg, &market_id, &self.bus) == crate::paper::BuyOutcome::Refused {
                self.reset_cycle();
                return;
            }
            self.on_leg1_filled(leg).await;
            return;
        }

        match order_kind {
            OrderKind::TakerMarket => {
                let notional = qty * sig.current_price;
                match self
                    .exchange
                    .create_market_order(&sig.token_id, OrderSide::Buy, notional)
                    .await
                {
                    Ok(result) if result.success => {
                        let fill_price = sig.best_ask.unwrap_or(sig.current_price);
                        let Some(leg) = Leg::new(
                            sig.dip_side,
                            fill_price,
                            qty,
                            sig.token_id.clone(),
                            order_kind,
                            sig.best_bid,
                            sig.best_ask,
                            result.order_id,
                            Utc::now(),
                        ) else {
                            return;
                        };
                        self.on_leg1_filled(leg).await;
                    }
                    Ok(_) | Err(_) => {
                        warn!("leg1 taker-market order failed");
                        self.reset_cycle();
                    }
                }
            }
            OrderKind::MakerLimit => {
                match self
                    .exchange
                    .create_limit_order(
                        &sig.token_id,
                        OrderSide::Buy,
                        sig.best_ask.unwrap_or(sig.current_price),
                        qty,
                    )
                    .await
                {
                    Ok(CreateOrderResult { order_id: Some(order_id) }) => {
                        self.expected_order_ids.insert(order_id.clone());
                        self.pending_leg1_buy = Some(PendingOrder {
                            order_id,
                            intent: OrderIntent::Leg1Buy,
                            limit_price: sig.best_ask.unwrap_or(sig.current_price),
                            target_qty: qty,
                            poll_started_at: Instant::now(),
                        });
                        self.pending_leg1_side = Some(sig.dip_side);
                        if let Some(cycle) = self.cycle.as_mut() {
                            cycle.state = CycleState::Leg1Pending;
                        }
                    }
                    Ok(_) | Err(_) => {
                        warn!("leg1 maker-limit order returned no order id");
                        self.reset_cycle();
                    }
                }
            }
        }
    }

    /// Common tail of leg-1 fill handling, whether synthesized (paper) or
    /// observed via fill polling/execution event (live).
    async fn on_leg1_filled(&mut self, leg: Leg) {
        let market_id;
        {
            let Some(cycle) = self.cycle.as_mut() else {
                return;
            };
            cycle.leg1 = Some(leg.clone());
            cycle.state = CycleState::WaitingForHedge;
            market_id = cycle.market.market_id.clone();
        }
        self.start_emergency_timer();
        self.signal.set_phase(Phase::Leg1Filled);
        self.bus.publish(Event::Leg1Executed(LegExecutedPayload {
            market_id: market_id.clone(),
            side: leg.side,
            price: leg.fill_price,
            qty: leg.qty,
            order_id: leg.order_id.clone(),
        }));

        if self.live_mode {
            match self
                .exchange
                .create_limit_order(&leg.token_id, OrderSide::Sell, EXIT_SELL_PRICE, leg.qty)
                .await
            {
                Ok(result) => self.leg1_exit_order_id = result.order_id,
                Err(e) => warn!(error = %e, "failed to place leg1 exit sell"),
            }
        } else {
            info!(
                market_id = %market_id,
                side = leg.side.as_str(),
                price = %EXIT_SELL_PRICE,
                "paper exit sell recorded (not real)"
            );
        }
    }

    async fn try_enter_leg2(&mut self, sig: SignalCandidate) {
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };
        // 1. state must be WaitingForHedge (checked by caller).
        let Some(leg1) = cycle.leg1.clone() else {
            return;
        };
        // 2. combined price must not exceed the sum target.
        if leg1.fill_price + sig.current_price > self.cfg.default_sum_target {
            debug!("leg2 rejected: combined price exceeds sum_target");
            return;
        }
        // 3. price/token validity.
        if !price_and_token_valid(sig.current_price, &sig.token_id, &cycle.market) {
            debug!("leg2 rejected: price out of range or stale token id");
            return;
        }

        self.execute_leg2(sig, leg1.qty).await;
    }

    async fn execute_leg2(&mut self, sig: SignalCandidate, qty: Decimal) {
        let order_kind = decide_leg2_order_kind();
        let Some(market_id) = self.cycle.as_ref().map(|c| c.market.market_id.clone()) else {
            return;
        };

        if !self.live_mode {
            let leg = Leg::new(
                sig.dip_side,
                sig.current_price,
                qty,
                sig.token_id.clone(),
                order_kind,
                sig.best_bid,
                sig.best_ask,
                None,
                Utc::now(),
            );
            let Some(leg) = leg else {
                return;
            };
            self.paper.buy(&leg, &market_id, &self.bus);
            self.on_leg2_filled(leg).await;
            return;
        }

        match self
            .exchange
            .create_limit_order(
                &sig.token_id,
                OrderSide::Buy,
                sig.best_ask.unwrap_or(sig.current_price),
                qty,
            )
            .await
        {
            Ok(CreateOrderResult { order_id: Some(order_id) }) => {
                self.expected_order_ids.insert(order_id.clone());
                self.pending_leg2_buy = Some(PendingOrder {
                    order_id,
                    intent: OrderIntent::Leg2Buy,
                    limit_price: sig.best_ask.unwrap_or(sig.current_price),
                    target_qty: qty,
                    poll_started_at: Instant::now(),
                });
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.state = CycleState::Leg2Pending;
                }
            }
            Ok(_) | Err(_) => {
                warn!("leg2 maker-limit order returned no order id");
                self.reset_cycle();
            }
        }
    }

    async fn on_leg2_filled(&mut self, leg: Leg) {
        let market_id;
        {
            let Some(cycle) = self.cycle.as_mut() else {
                return;
            };
            cycle.leg2 = Some(leg.clone());
            cycle.state = CycleState::Completed;
            market_id = cycle.market.market_id.clone();
        }
        self.emergency_timer_active = false;
        self.bus.publish(Event::Leg2Executed(LegExecutedPayload {
            market_id,
            side: leg.side,
            price: leg.fill_price,
            qty: leg.qty,
            order_id: leg.order_id,
        }));
        self.finalize_cycle().await;
    }

    // ---- Fill polling ----

    async fn poll_tick(&mut self) {
        if self.in_poll {
            return;
        }
        self.in_poll = true;

        if let Some(pending) = self.pending_leg1_buy.clone() {
            self.poll_one(pending, OrderIntent::Leg1Buy).await;
        }
        if let Some(pending) = self.pending_leg2_buy.clone() {
            self.poll_one(pending, OrderIntent::Leg2Buy).await;
        }

        self.in_poll = false;
    }

    async fn poll_one(&mut self, pending: PendingOrder, intent: OrderIntent) {
        let report = match self.exchange.get_order(&pending.order_id).await {
            Ok(r) => r,
            Err(e) => {
                debug!(order_id = %pending.order_id, error = %e, "transient get_order error, retried next tick");
                return;
            }
        };

        match report.status {
            OrderStatus::Filled => {
                self.apply_fill(&pending, intent, report.filled_size).await;
            }
            status if status.is_terminal_non_fill() => {
                if report.filled_size > Decimal::ZERO {
                    self.apply_fill(&pending, intent, report.filled_size).await;
                } else {
                    self.terminal_zero_fill(&pending, intent).await;
                }
            }
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => {
                let elapsed_ms = pending.poll_started_at.elapsed().as_millis() as u64;
                if elapsed_ms > self.cfg.gtc_fill_timeout_ms {
                    let _ = self.exchange.cancel_order(&pending.order_id).await;
                    self.terminal_zero_fill(&pending, intent).await;
                }
            }
        }
    }

    async fn apply_fill(&mut self, pending: &PendingOrder, intent: OrderIntent, filled_size: Decimal) {
        self.expected_order_ids.remove(&pending.order_id);
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };

        let (leg_side, token_id) = match intent {
            OrderIntent::Leg1Buy => {
                let Some(side) = self.pending_leg1_side else {
                    return;
                };
                (side, cycle.market.token_id(side).to_string())
            }
            OrderIntent::Leg2Buy => {
                let Some(leg1) = cycle.leg1.as_ref() else {
                    return;
                };
                let side = leg1.side.opposite();
                (side, cycle.market.token_id(side).to_string())
            }
            _ => return,
        };

        let Some(leg) = Leg::new(
            leg_side,
            pending.limit_price,
            filled_size,
            token_id,
            OrderKind::MakerLimit,
            None,
            None,
            Some(pending.order_id.clone()),
            Utc::now(),
        ) else {
            return;
        };

        match intent {
            OrderIntent::Leg1Buy => {
                self.pending_leg1_buy = None;
                self.pending_leg1_side = None;
                self.on_leg1_filled(leg).await;
            }
            OrderIntent::Leg2Buy => {
                self.pending_leg2_buy = None;
                self.on_leg2_filled(leg).await;
            }
            _ => {}
        }
    }

    async fn terminal_zero_fill(&mut self, pending: &PendingOrder, intent: OrderIntent) {
        self.expected_order_ids.remove(&pending.order_id);
        match intent {
            OrderIntent::Leg1Buy => {
                self.pending_leg1_buy = None;
                self.pending_leg1_side = None;
                self.reset_cycle();
            }
            OrderIntent::Leg2Buy => {
                self.pending_leg2_buy = None;
                self.start_emergency_exit().await;
            }
            _ => {}
        }
    }

    async fn on_execution(&mut self, ev: crate::signal::ExecutionEvent) {
        // Fill notification parallel to explicit polling. `expected_order_ids`
        // rejects stale/duplicate callbacks; `cycle_finalized` rejects
        // double-finalization even if this races a polling success.
        if let Some(order_id) = &ev.order_id {
            if !self.expected_order_ids.contains(order_id) {
                debug!(order_id = %order_id, "execution event for unexpected order id, dropped");
                return;
            }
        }
        if !ev.success {
            return;
        }
        let Some(leg) = Leg::new(
            ev.side,
            ev.price,
            ev.shares,
            ev.token_id.clone(),
            OrderKind::MakerLimit,
            None,
            None,
            ev.order_id.clone(),
            Utc::now(),
        ) else {
            return;
        };
        match ev.leg {
            1 => {
                if let Some(order_id) = &ev.order_id {
                    self.expected_order_ids.remove(order_id);
                }
                self.pending_leg1_buy = None;
                self.on_leg1_filled(leg).await;
            }
            2 => {
                if let Some(order_id) = &ev.order_id {
                    self.expected_order_ids.remove(order_id);
                }
                self.pending_leg2_buy = None;
                self.on_leg2_filled(leg).await;
            }
            _ => {}
        }
    }

    // ---- Cycle finalization ----

    /// Idempotent: guarded by `cycle.cycle_finalized`. Safe to call from
    /// both the polling path and an `execution` event racing it.
    async fn finalize_cycle(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        if cycle.cycle_finalized {
            return;
        }
        let (Some(leg1), Some(leg2)) = (cycle.leg1.clone(), cycle.leg2.clone()) else {
            return;
        };
        cycle.cycle_finalized = true;
        let market_id = cycle.market.market_id.clone();

        let payout = leg1.qty.min(leg2.qty);
        let total_cost = leg1.cost() + leg2.cost();
        let profit = payout - total_cost;

        self.stats.cycles_completed += 1;
        if profit > Decimal::ZERO {
            self.stats.cycles_won += 1;
        }
        self.stats.total_profit += profit;
        self.sizer.record_result(profit, Utc::now());

        self.bus.publish(Event::CycleComplete(CycleCompletePayload {
            market_id: market_id.clone(),
            status: CycleOutcome::Completed,
            profit: Some(profit),
        }));

        if self.live_mode {
            match self
                .exchange
                .create_limit_order(&leg2.token_id, OrderSide::Sell, EXIT_SELL_PRICE, leg2.qty)
                .await
            {
                Ok(result) => self.leg2_exit_order_id = result.order_id,
                Err(e) => warn!(error = %e, "failed to place leg2 exit sell"),
            }
        } else {
            info!(market_id = %market_id, "paper leg2 exit sell recorded (not real)");
        }

        self.paper.record_cycle(profit);
        log_snapshot(&market_id, &self.stats);
        self.clear_timers();
        self.reset_cycle();
    }

    // ---- Emergency exit ----

    async fn check_emergency_trigger(&mut self) {
        if !self.cfg.emergency_enabled || !self.emergency_timer_active {
            return;
        }
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };
        if cycle.leg1.is_none() || cycle.leg2.is_some() {
            return;
        }
        let cutoff = self.cfg.exit_before_expiry_minutes * 60;
        if cycle.market.seconds_remaining(Utc::now()) <= cutoff {
            self.start_emergency_exit().await;
        }
    }

    async fn start_emergency_exit(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        let Some(leg1) = cycle.leg1.clone() else {
            return;
        };
        cycle.state = CycleState::EmergencyExit;
        self.stats.emergency_exits += 1;

        let market_id = cycle.market.market_id.clone();

        if self.live_mode {
            if let Some(order_id) = self.pending_leg2_buy.take().map(|p| p.order_id) {
                self.expected_order_ids.remove(&order_id);
                let _ = self.exchange.cancel_order(&order_id).await;
            }
            if let Some(order_id) = self.leg1_exit_order_id.take() {
                let _ = self.exchange.cancel_order(&order_id).await;
            }
            let last_price = self.price_history.last(leg1.side).unwrap_or(leg1.fill_price);
            let notional = leg1.qty * last_price;
            if let Err(e) = self
                .exchange
                .create_market_order(&leg1.token_id, OrderSide::Sell, notional)
                .await
            {
                warn!(error = %e, "emergency exit market sell failed");
            }
        }
        self.clear_timers();

        let last_price = self.price_history.last(leg1.side);
        let (exit_value, profit) = match last_price {
            Some(p) => {
                let exit_value = leg1.qty * p;
                (exit_value, exit_value - leg1.cost())
            }
            None => (Decimal::ZERO, Decimal::ZERO - leg1.cost()),
        };

        if !self.live_mode {
            if let Some(p) = last_price {
                self.paper.sell(&leg1.token_id, leg1.side, leg1.qty, p, &market_id, &self.bus);
            } else {
                self.paper.abandon_round(&market_id);
            }
        }

        self.bus.publish(Event::EmergencyExit(EmergencyExitPayload {
            market_id: market_id.clone(),
            side: leg1.side,
            exit_value,
            profit,
        }));
        self.bus.publish(Event::CycleComplete(CycleCompletePayload {
            market_id: market_id.clone(),
            status: CycleOutcome::EmergencyExit,
            profit: Some(profit),
        }));

        self.sizer.record_result(profit, Utc::now());
        log_snapshot(&market_id, &self.stats);
        self.reset_cycle();
    }

    // ---- Round completion handling ----

    async fn on_round_complete(&mut self, ev: RoundCompleteEvent) {
        if let Some(cycle) = &self.cycle {
            if cycle.cycle_finalized {
                return;
            }
        }
        match ev.status {
            RoundStatus::Completed => {
                self.stats.cycles_completed += 1;
                if let Some(profit) = ev.profit {
                    self.stats.total_profit += profit;
                    if profit > Decimal::ZERO {
                        self.stats.cycles_won += 1;
                    }
                }
            }
            RoundStatus::Abandoned => {
                self.stats.cycles_abandoned += 1;
            }
        }
        if self.live_mode {
            if let Some(market_id) = self.cycle.as_ref().map(|c| c.market.market_id.clone()) {
                let _ = self
                    .exchange
                    .settle_market(SettlementStrategy::Redeem, &market_id)
                    .await;
            }
        }
    }

    // ---- Shared helpers ----

    fn start_emergency_timer(&mut self) {
        self.emergency_timer_active = true;
    }

    /// Clears every timer/fill-poll loop a cycle may own: the emergency
    /// timer and any pending leg1/leg2 buy poll. Called explicitly from
    /// every exit path (`reset_cycle`, `finalize_cycle`,
    /// `start_emergency_exit`) rather than left to `Drop`.
    fn clear_timers(&mut self) {
        self.emergency_timer_active = false;
        self.pending_leg1_buy = None;
        self.pending_leg1_side = None;
        self.pending_leg2_buy = None;
    }

    fn reset_cycle(&mut self) {
        self.clear_timers();
        if let Some(cycle) = self.cycle.as_mut() {
            let attempted = cycle.cycle_attempted_this_market;
            let finalized = cycle.cycle_finalized;
            let market = cycle.market.clone();
            *cycle = Cycle::new(market);
            cycle.cycle_attempted_this_market = attempted;
            cycle.cycle_finalized = finalized;
        }
    }

    async fn cancel_all_pending(&mut self) {
        if self.live_mode {
            if let Some(p) = self.pending_leg1_buy.take() {
                let _ = self.exchange.cancel_order(&p.order_id).await;
            }
            if let Some(p) = self.pending_leg2_buy.take() {
                let _ = self.exchange.cancel_order(&p.order_id).await;
            }
            if let Some(order_id) = self.leg1_exit_order_id.take() {
                let _ = self.exchange.cancel_order(&order_id).await;
            }
            if let Some(order_id) = self.leg2_exit_order_id.take() {
                let _ = self.exchange.cancel_order(&order_id).await;
            }
        } else {
            self.leg1_exit_order_id = None;
            self.leg2_exit_order_id = None;
        }
        self.clear_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MarketOrderResult, OrderbookSnapshot, SettlementResult};
    use crate::signal::mock::MockSignalSource;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct MockExchange {
        order_statuses: Mutex<std::collections::HashMap<String, OrderStatusReport>>,
        next_order_id: Mutex<u64>,
    }

    impl MockExchange {
        fn new() -> Self {
            Self {
                order_statuses: Mutex::new(std::collections::HashMap::new()),
                next_order_id: Mutex::new(0),
            }
        }

        fn set_status(&self, order_id: &str, status: OrderStatus, filled_size: Decimal) {
            self.order_statuses
                .lock()
                .unwrap()
                .insert(order_id.to_string(), OrderStatusReport { status, filled_size });
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        async fn create_limit_order(
            &self,
            _token_id: &str,
            _side: OrderSide,
            _price: Decimal,
            _size: Decimal,
        ) -> anyhow::Result<CreateOrderResult> {
            let mut n = self.next_order_id.lock().unwrap();
            *n += 1;
            Ok(CreateOrderResult {
                order_id: Some(format!("ord-{n}")),
            })
        }

        async fn create_market_order(
            &self,
            _token_id: &str,
            _side: OrderSide,
            _notional_amount: Decimal,
        ) -> anyhow::Result<MarketOrderResult> {
            Ok(MarketOrderResult {
                success: true,
                order_id: Some("mkt-1".into()),
                error: None,
            })
        }

        async fn get_order(&self, order_id: &str) -> anyhow::Result<OrderStatusReport> {
            Ok(self
                .order_statuses
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .unwrap_or(OrderStatusReport {
                    status: OrderStatus::Open,
                    filled_size: Decimal::ZERO,
                }))
        }

        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_orderbook(&self, _token_id: &str) -> anyhow::Result<OrderbookSnapshot> {
            Ok(OrderbookSnapshot::default())
        }

        async fn settle_market(
            &self,
            _strategy: SettlementStrategy,
            _market_id: &str,
        ) -> anyhow::Result<SettlementResult> {
            Ok(SettlementResult {
                success: true,
                amount_received: None,
            })
        }

        async fn get_balance(&self) -> anyhow::Result<Decimal> {
            Ok(dec!(1000))
        }
    }

    fn market_started(now: chrono::DateTime<Utc>, secs_from_now: i64) -> MarketStartedEvent {
        MarketStartedEvent {
            market_id: "m1".into(),
            end_time_ms: (now + ChronoDuration::seconds(secs_from_now)).timestamp_millis(),
            duration_minutes: 15,
            up_token_id: "up".into(),
            down_token_id: "down".into(),
        }
    }

    fn dip_signal(kind: SignalKind, side: Side, price: Decimal, opposite_ask: Decimal) -> SignalCandidate {
        SignalCandidate {
            kind,
            source: SignalSourceKind::Dip,
            dip_side: side,
            current_price: price,
            opposite_ask,
            drop_percent: dec!(0.20),
            token_id: match side {
                Side::Up => "up".into(),
                Side::Down => "down".into(),
            },
            target_price: None,
            best_bid: Some(price - dec!(0.01)),
            best_ask: Some(price),
            seconds_remaining: None,
        }
    }

    fn make_controller() -> ArbitrageController<MockSignalSource, MockExchange> {
        let mut cfg = Config::default();
        cfg.log_file = format!("/tmp/ctrl_test_{}.jsonl", uuid::Uuid::new_v4());
        let bus = Arc::new(EventBus::new());
        let exchange = Arc::new(MockExchange::new());
        let signal = MockSignalSource::new(vec![]);
        ArbitrageController::new(cfg, bus, exchange, signal)
    }

    /// Scenario 1: paper win.
    #[tokio::test]
    async fn scenario_paper_win() {
        let mut ctrl = make_controller();
        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;

        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::WaitingForHedge));

        ctrl.on_signal(dip_signal(SignalKind::Leg2, Side::Down, dec!(0.50), dec!(0.40)))
            .await;

        assert_eq!(ctrl.stats().cycles_completed, 1);
        assert_eq!(ctrl.stats().cycles_won, 1);
        assert_eq!(ctrl.stats().total_profit, dec!(10));
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
    }

    /// Scenario 4: one entry per market. A second leg1 dip is dropped.
    #[tokio::test]
    async fn scenario_one_entry_per_market() {
        let mut ctrl = make_controller();
        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;

        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::WaitingForHedge));

        // Second leg1 dip, same market: must be dropped (wrong state too,
        // but cycle_attempted_this_market is the load-bearing guard).
        let before = ctrl.cycle.as_ref().unwrap().leg1.clone();
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.41), dec!(0.55)))
            .await;
        assert_eq!(ctrl.cycle.as_ref().unwrap().leg1.as_ref().unwrap().fill_price, before.unwrap().fill_price);
    }

    /// Scenario 5: circuit breaker after three consecutive losing cycles.
    #[tokio::test]
    async fn scenario_circuit_breaker_pauses_trading() {
        let mut ctrl = make_controller();
        let now = Utc::now();
        ctrl.sizer.record_result(dec!(-5), now);
        ctrl.sizer.record_result(dec!(-5), now);
        ctrl.sizer.record_result(dec!(-5), now);

        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;

        // Trading paused: leg1 must not have been admitted.
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
        assert!(ctrl.cycle.as_ref().unwrap().leg1.is_none());
    }

    /// Scenario 3 (paper variant): emergency exit when no leg2 arrives in
    /// time, using a synthetic price-history sample instead of a real
    /// wall-clock sleep.
    #[tokio::test]
    async fn scenario_emergency_exit_records_loss() {
        let mut ctrl = make_controller();
        let now = Utc::now();
        // Market ends in 240s; leg1 fills, then we simulate 61s passing by
        // constructing a market whose remaining time already reflects it.
        ctrl.on_market_started(market_started(now, 240)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::WaitingForHedge));

        ctrl.price_history.push(Side::Up, dec!(0.20), Instant::now());
        // Force the market into the emergency window.
        ctrl.cycle.as_mut().unwrap().market.end_time = Utc::now() + ChronoDuration::seconds(179);
        ctrl.emergency_timer_active = true;

        ctrl.check_emergency_trigger().await;

        assert_eq!(ctrl.stats().emergency_exits, 1);
        assert_eq!(ctrl.stats().total_profit, dec!(-20));
        assert_eq!(ctrl.sizer.consecutive_losses(), 1);
    }

    /// Cycle finalization is idempotent even if invoked twice.
    #[tokio::test]
    async fn finalize_cycle_is_idempotent() {
        let mut ctrl = make_controller();
        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        ctrl.on_signal(dip_signal(SignalKind::Leg2, Side::Down, dec!(0.50), dec!(0.40)))
            .await;
        assert_eq!(ctrl.stats().cycles_completed, 1);

        // finalize_cycle on a freshly reset (Watching, no legs) cycle is a
        // no-op since there's no leg1/leg2 pair to finalize.
        ctrl.finalize_cycle().await;
        assert_eq!(ctrl.stats().cycles_completed, 1);
    }

    /// Live-mode fill-poll path: leg1 maker-limit order fills, then leg2
    /// fills, completing the cycle via the polling loop rather than paper
    /// synthesis.
    #[tokio::test]
    async fn live_mode_fill_poll_completes_cycle() {
        let mut cfg = Config::default();
        cfg.paper_enabled = false;
        cfg.log_file = format!("/tmp/ctrl_test_{}.jsonl", uuid::Uuid::new_v4());
        let bus = Arc::new(EventBus::new());
        let exchange = Arc::new(MockExchange::new());
        let signal = MockSignalSource::new(vec![]);
        let mut ctrl = ArbitrageController::new(cfg, bus, exchange, signal);

        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::Leg1Pending));

        let order_id = ctrl.pending_leg1_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id, OrderStatus::Filled, dec!(100));
        ctrl.poll_tick().await;
        assert_eq!(ctrl.state(), Some(CycleState::WaitingForHedge));

        ctrl.on_signal(dip_signal(SignalKind::Leg2, Side::Down, dec!(0.50), dec!(0.40)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::Leg2Pending));
        let order_id2 = ctrl.pending_leg2_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id2, OrderStatus::Filled, dec!(100));
        ctrl.poll_tick().await;

        assert_eq!(ctrl.stats().cycles_completed, 1);
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
    }

    /// Scenario 2: leg2 terminates with a partial fill (cancelled after
    /// resting, but some shares did cross before cancellation). The
    /// partial quantity still finalizes the cycle rather than routing to
    /// emergency exit, and payout is capped at the smaller leg.
    #[tokio::test]
    async fn scenario_leg2_partial_fill_finalizes_with_smaller_payout() {
        let mut cfg = Config::default();
        cfg.paper_enabled = false;
        cfg.log_file = format!("/tmp/ctrl_test_{}.jsonl", uuid::Uuid::new_v4());
        let bus = Arc::new(EventBus::new());
        let exchange = Arc::new(MockExchange::new());
        let signal = MockSignalSource::new(vec![]);
        let mut ctrl = ArbitrageController::new(cfg, bus, exchange, signal);

        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        let order_id = ctrl.pending_leg1_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id, OrderStatus::Filled, dec!(100));
        ctrl.poll_tick().await;
        assert_eq!(ctrl.state(), Some(CycleState::WaitingForHedge));

        ctrl.on_signal(dip_signal(SignalKind::Leg2, Side::Down, dec!(0.50), dec!(0.40)))
            .await;
        let order_id2 = ctrl.pending_leg2_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id2, OrderStatus::Cancelled, dec!(60));
        ctrl.poll_tick().await;

        // payout = min(100, 60) = 60; total_cost = 100*0.40 + 60*0.50 = 70;
        // profit = 60 - 70 = -10.
        assert_eq!(ctrl.stats().cycles_completed, 1);
        assert_eq!(ctrl.stats().total_profit, dec!(-10));
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
    }

    /// Boundary: `not_found` on a leg2 poll triggers emergency exit, not a
    /// silent drop.
    #[tokio::test]
    async fn leg2_not_found_triggers_emergency_exit() {
        let mut cfg = Config::default();
        cfg.paper_enabled = false;
        cfg.log_file = format!("/tmp/ctrl_test_{}.jsonl", uuid::Uuid::new_v4());
        let bus = Arc::new(EventBus::new());
        let exchange = Arc::new(MockExchange::new());
        let signal = MockSignalSource::new(vec![]);
        let mut ctrl = ArbitrageController::new(cfg, bus, exchange, signal);

        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        let order_id = ctrl.pending_leg1_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id, OrderStatus::Filled, dec!(100));
        ctrl.poll_tick().await;

        ctrl.on_signal(dip_signal(SignalKind::Leg2, Side::Down, dec!(0.50), dec!(0.40)))
            .await;
        let order_id2 = ctrl.pending_leg2_buy.as_ref().unwrap().order_id.clone();
        ctrl.exchange
            .set_status(&order_id2, OrderStatus::NotFound, Decimal::ZERO);
        ctrl.poll_tick().await;

        assert_eq!(ctrl.stats().emergency_exits, 1);
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
    }

    /// Scenario 6: market rotation mid-cycle cancels pending orders and
    /// returns to Watching on the new market, admitting a fresh leg1.
    #[tokio::test]
    async fn scenario_market_rotation_mid_cycle() {
        let mut cfg = Config::default();
        cfg.paper_enabled = false;
        cfg.log_file = format!("/tmp/ctrl_test_{}.jsonl", uuid::Uuid::new_v4());
        let bus = Arc::new(EventBus::new());
        let exchange = Arc::new(MockExchange::new());
        let signal = MockSignalSource::new(vec![]);
        let mut ctrl = ArbitrageController::new(cfg, bus, exchange, signal);

        let now = Utc::now();
        ctrl.on_market_started(market_started(now, 900)).await;
        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::Leg1Pending));

        // New market rotates in while leg1 is still pending.
        ctrl.on_market_started(market_started(now, 900)).await;
        assert_eq!(ctrl.state(), Some(CycleState::Watching));
        assert!(ctrl.pending_leg1_buy.is_none());

        ctrl.on_signal(dip_signal(SignalKind::Leg1, Side::Up, dec!(0.40), dec!(0.55)))
            .await;
        assert_eq!(ctrl.state(), Some(CycleState::Leg1Pending));
    }
}
