//! Fee model: pure functions over `Decimal`.
//!
//! The exchange charges a quadratic per-share taker fee
//! `price * (1 - price) * FEE_RATE`; expressed as a fraction of cost per
//! share this is `(1 - price) * FEE_RATE`, which is what
//! [`estimate_taker_fee`] returns.

use rust_decimal::Decimal;

use crate::types::{OrderKind, Side};

/// Fee as a fraction of cost per share, for `price` strictly in (0, 1).
/// Returns zero outside that range: there is no fee to estimate for a
/// price that can't legally fill.
///
/// # Example
/// Lower prices carry a higher fee rate: `rate(0.2) > rate(0.5) > rate(0.8)`.
#[must_use]
pub fn estimate_taker_fee(price: Decimal, fee_rate: Decimal) -> Decimal {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Decimal::ZERO;
    }
    (Decimal::ONE - price) * fee_rate
}

/// Decide whether leg 1 should be worked as a resting maker-limit order or
/// sent immediately as a taker-market order.
///
/// If `use_maker` is false, always taker-market. Otherwise compute the
/// margin between the configured `sum_target` and the actual combined
/// price; if `fallback_to_taker` is set and that margin comfortably beats
/// (more than 1.5x) the taker fee rate at `leg1_price`, prefer speed over
/// the maker rebate and go taker-market. Otherwise rest as maker-limit.
#[must_use]
pub fn decide_leg1_order_kind(
    leg1_price: Decimal,
    opposite_ask: Decimal,
    sum_target: Decimal,
    use_maker: bool,
    fallback_to_taker: bool,
    fee_rate: Decimal,
) -> OrderKind {
    if !use_maker {
        return OrderKind::TakerMarket;
    }
    if sum_target == Decimal::ZERO {
        return OrderKind::MakerLimit;
    }
    let margin = (sum_target - (leg1_price + opposite_ask)) / sum_target;
    if fallback_to_taker && margin > Decimal::new(15, 1) * estimate_taker_fee(leg1_price, fee_rate)
    {
        OrderKind::TakerMarket
    } else {
        OrderKind::MakerLimit
    }
}

/// Leg 2 (the hedge) is always worked as a resting maker-limit order.
#[must_use]
pub const fn decide_leg2_order_kind() -> OrderKind {
    OrderKind::MakerLimit
}

const TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// One tick inside the spread, clamped so buys never cross the ask and
/// sells never cross the bid. `side` selects which edge of the spread the
/// price is being placed for: [`Side::Up`] is treated as the buy-side
/// (price moves toward the ask), [`Side::Down`] as the sell-side (price
/// moves toward the bid). Callers pick whichever matches the order being
/// priced.
#[must_use]
pub fn limit_price_inside_spread(best_bid: Decimal, best_ask: Decimal, side: Side) -> Decimal {
    if best_ask <= best_bid {
        return best_bid;
    }
    match side {
        Side::Up => (best_bid + TICK).min(best_ask),
        Side::Down => (best_ask - TICK).max(best_bid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn taker_fee_rate_decreases_with_price() {
        let rate = dec!(0.0625);
        let r2 = estimate_taker_fee(dec!(0.2), rate);
        let r5 = estimate_taker_fee(dec!(0.5), rate);
        let r8 = estimate_taker_fee(dec!(0.8), rate);
        assert!(r2 > r5);
        assert!(r5 > r8);
    }

    #[test]
    fn taker_fee_zero_outside_range() {
        let rate = dec!(0.0625);
        assert_eq!(estimate_taker_fee(Decimal::ZERO, rate), Decimal::ZERO);
        assert_eq!(estimate_taker_fee(Decimal::ONE, rate), Decimal::ZERO);
        assert_eq!(estimate_taker_fee(dec!(1.5), rate), Decimal::ZERO);
    }

    #[test]
    fn taker_fee_matches_quadratic_formula_as_fraction_of_cost() {
        // price * (1-price) * FEE_RATE / price == (1-price) * FEE_RATE
        let price = dec!(0.4);
        let rate = dec!(0.0625);
        let per_share_fee = price * (Decimal::ONE - price) * rate;
        let as_fraction_of_cost = per_share_fee / price;
        assert_eq!(estimate_taker_fee(price, rate), as_fraction_of_cost);
    }

    #[test]
    fn leg1_uses_taker_when_maker_disabled() {
        let kind = decide_leg1_order_kind(
            dec!(0.40),
            dec!(0.50),
            dec!(0.95),
            false,
            true,
            dec!(0.0625),
        );
        assert_eq!(kind, OrderKind::TakerMarket);
    }

    #[test]
    fn leg1_prefers_maker_when_margin_thin() {
        // sum_target 0.95, combined 0.94 -> tiny margin, should stay maker
        let kind = decide_leg1_order_kind(
            dec!(0.44),
            dec!(0.50),
            dec!(0.95),
            true,
            true,
            dec!(0.0625),
        );
        assert_eq!(kind, OrderKind::MakerLimit);
    }

    #[test]
    fn leg1_falls_back_to_taker_when_margin_wide() {
        // combined 0.60 vs sum_target 0.95: huge margin, fallback enabled
        let kind = decide_leg1_order_kind(
            dec!(0.10),
            dec!(0.50),
            dec!(0.95),
            true,
            true,
            dec!(0.0625),
        );
        assert_eq!(kind, OrderKind::TakerMarket);
    }

    #[test]
    fn leg1_stays_maker_without_fallback_even_with_wide_margin() {
        let kind = decide_leg1_order_kind(
            dec!(0.10),
            dec!(0.50),
            dec!(0.95),
            true,
            false,
            dec!(0.0625),
        );
        assert_eq!(kind, OrderKind::MakerLimit);
    }

    #[test]
    fn leg2_always_maker() {
        assert_eq!(decide_leg2_order_kind(), OrderKind::MakerLimit);
    }

    #[test]
    fn limit_price_inside_spread_stays_within_bounds() {
        let bid = dec!(0.49);
        let ask = dec!(0.50);
        let buy_price = limit_price_inside_spread(bid, ask, Side::Up);
        let sell_price = limit_price_inside_spread(bid, ask, Side::Down);
        assert!(buy_price >= bid && buy_price <= ask);
        assert!(sell_price >= bid && sell_price <= ask);
    }

    #[test]
    fn limit_price_inside_spread_handles_crossed_book() {
        // Defensive: bid >= ask shouldn't happen but must not crash or cross.
        let price = limit_price_inside_spread(dec!(0.50), dec!(0.50), Side::Up);
        assert_eq!(price, dec!(0.50));
    }
}
