//! Position sizer: share-count computation plus the consecutive-loss
//! circuit breaker.
//!
//! The cooldown counter/deadline pattern is grounded in
//! `bog-core/src/risk/circuit_breaker.rs`'s consecutive-violation-count
//! threshold: any non-negative result resets the counter, and only a full
//! run of `consecutive_loss_limit` losses starts a cooldown.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::Config;

/// Owns the consecutive-loss counter and cooldown deadline exclusively.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    max_balance_pct: Decimal,
    min_shares: Decimal,
    max_shares: Decimal,
    loss_limit: u32,
    cooldown_minutes: i64,
    consecutive_losses: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl PositionSizer {
    #[must_use]
    pub fn new(cfg: &Config) -> Self {
        Self {
            max_balance_pct: cfg.max_balance_pct_per_trade,
            min_shares: cfg.min_shares,
            max_shares: cfg.max_shares,
            loss_limit: cfg.consecutive_loss_limit,
            cooldown_minutes: cfg.cooldown_minutes,
            consecutive_losses: 0,
            cooldown_until: None,
        }
    }

    #[must_use]
    pub const fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Computes the share count to buy at `leg1_price` given `balance`.
    /// Returns 0 (a go/no-go, not a clamp-up) if trading is paused or the
    /// computed quantity would fall below `min_shares`.
    #[must_use]
    pub fn calculate_shares(&mut self, balance: Decimal, leg1_price: Decimal, now: DateTime<Utc>) -> Decimal {
        if self.is_trading_paused(now) {
            return Decimal::ZERO;
        }
        if leg1_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let max_risk = balance * self.max_balance_pct;
        let mut qty = (max_risk / leg1_price).floor();
        qty = qty.min(self.max_shares);

        let safety_cap = balance * Decimal::new(95, 2); // 0.95
        if qty * leg1_price > safety_cap {
            qty = (safety_cap / leg1_price).floor();
        }

        if qty < self.min_shares {
            return Decimal::ZERO;
        }
        qty
    }

    /// Feeds a completed cycle's profit back into the breaker. Any
    /// non-negative profit resets `consecutive_losses` to 0 immediately;
    /// a negative profit increments it, and upon reaching `loss_limit`
    /// starts a cooldown of `cooldown_minutes`.
    pub fn record_result(&mut self, profit: Decimal, now: DateTime<Utc>) {
        if profit < Decimal::ZERO {
            self.consecutive_losses += 1;
            if self.consecutive_losses >= self.loss_limit {
                self.cooldown_until = Some(now + chrono::Duration::minutes(self.cooldown_minutes));
            }
        } else {
            self.consecutive_losses = 0;
        }
    }

    /// True only while `now` is before the cooldown deadline. Once the
    /// deadline has elapsed this self-clears: unpauses and resets the
    /// loss counter.
    pub fn is_trading_paused(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(deadline) if now < deadline => true,
            Some(_) => {
                self.cooldown_until = None;
                self.consecutive_losses = 0;
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        PositionSizer::new(&Config::default())
    }

    #[test]
    fn calculate_shares_clamps_between_min_and_max() {
        let mut s = sizer();
        let now = Utc::now();
        // balance=1000, price=0.40, max_balance_pct=0.05 -> max_risk=50 -> floor(50/0.4)=125 -> min(125,100)=100
        let qty = s.calculate_shares(dec!(1000), dec!(0.40), now);
        assert_eq!(qty, dec!(100));
    }

    #[test]
    fn calculate_shares_zero_below_min() {
        let mut s = sizer();
        let now = Utc::now();
        // balance=10, price=0.40 -> max_risk=0.5 -> floor(0.5/0.4)=1, below min_shares(5) -> 0
        let qty = s.calculate_shares(dec!(10), dec!(0.40), now);
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn calculate_shares_respects_safety_rail() {
        let mut s = sizer();
        let now = Utc::now();
        // balance=10000, price=0.01 -> max_risk=500 -> floor(500/0.01)=50000 -> min(.,100)=100 (max_shares cap)
        let qty = s.calculate_shares(dec!(10000), dec!(0.01), now);
        assert_eq!(qty, dec!(100));
    }

    #[test]
    fn any_non_negative_result_resets_consecutive_losses() {
        let mut s = sizer();
        let now = Utc::now();
        s.record_result(dec!(-5), now);
        s.record_result(dec!(-5), now);
        assert_eq!(s.consecutive_losses(), 2);
        s.record_result(Decimal::ZERO, now);
        assert_eq!(s.consecutive_losses(), 0);
    }

    #[test]
    fn three_consecutive_losses_trip_cooldown() {
        let mut s = sizer();
        let now = Utc::now();
        s.record_result(dec!(-5), now);
        s.record_result(dec!(-5), now);
        s.record_result(dec!(-5), now);
        assert!(s.is_trading_paused(now));
        let qty = s.calculate_shares(dec!(1000), dec!(0.40), now);
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn cooldown_elapses_and_self_clears() {
        let mut s = sizer();
        let now = Utc::now();
        s.record_result(dec!(-5), now);
        s.record_result(dec!(-5), now);
        s.record_result(dec!(-5), now);
        assert!(s.is_trading_paused(now));
        let after = now + chrono::Duration::minutes(361);
        assert!(!s.is_trading_paused(after));
        assert_eq!(s.consecutive_losses(), 0);
    }
}
