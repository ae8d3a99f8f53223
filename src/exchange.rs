//! Exchange adapter contract. This is an interface only: the concrete
//! exchange client (order placement, cancellation, websocket orderbook
//! feed, resolved-market redemption) is explicitly out of scope.
//! Grounded on
//! `andrew-starosciak-deep-algo/crates/core/src/traits.rs`'s
//! `#[async_trait] pub trait X: Send + Sync` pattern.

use async_trait::async_trait;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    NotFound,
}

impl OrderStatus {
    /// Terminal statuses that did not fully fill. The fallback path
    /// applies: if `filled_size > 0`, treat the observed partial as the
    /// final fill; otherwise fall through to leg1-reset / leg2-emergency-
    /// exit.
    #[must_use]
    pub const fn is_terminal_non_fill(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::NotFound
        )
    }
}

#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub filled_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateOrderResult {
    pub order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MarketOrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct OrderbookSnapshot {
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

impl OrderbookSnapshot {
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStrategy {
    Redeem,
}

#[derive(Debug, Clone)]
pub struct SettlementResult {
    pub success: bool,
    pub amount_received: Option<Decimal>,
}

/// The operations the controller consumes from a live exchange client.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> anyhow::Result<CreateOrderResult>;

    /// `notional_amount` for `Sell` equals `qty * current estimated price`,
    /// not the raw share count.
    async fn create_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        notional_amount: Decimal,
    ) -> anyhow::Result<MarketOrderResult>;

    async fn get_order(&self, order_id: &str) -> anyhow::Result<OrderStatusReport>;

    /// Idempotent: cancelling an already-terminal order is not an error.
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;

    async fn get_orderbook(&self, token_id: &str) -> anyhow::Result<OrderbookSnapshot>;

    /// Idempotent.
    async fn settle_market(
        &self,
        strategy: SettlementStrategy,
        market_id: &str,
    ) -> anyhow::Result<SettlementResult>;

    /// Live mode only.
    async fn get_balance(&self) -> anyhow::Result<Decimal>;
}

/// Default wiring target when no concrete adapter has been supplied: every
/// call fails loudly rather than silently behaving like paper mode.
pub struct NullExchangeAdapter;

#[async_trait]
impl ExchangeAdapter for NullExchangeAdapter {
    async fn create_limit_order(
        &self,
        _token_id: &str,
        _side: OrderSide,
        _price: Decimal,
        _size: Decimal,
    ) -> anyhow::Result<CreateOrderResult> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn create_market_order(
        &self,
        _token_id: &str,
        _side: OrderSide,
        _notional_amount: Decimal,
    ) -> anyhow::Result<MarketOrderResult> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn get_order(&self, _order_id: &str) -> anyhow::Result<OrderStatusReport> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn get_orderbook(&self, _token_id: &str) -> anyhow::Result<OrderbookSnapshot> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn settle_market(
        &self,
        _strategy: SettlementStrategy,
        _market_id: &str,
    ) -> anyhow::Result<SettlementResult> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }

    async fn get_balance(&self) -> anyhow::Result<Decimal> {
        anyhow::bail!("no ExchangeAdapter configured for live trading")
    }
}
