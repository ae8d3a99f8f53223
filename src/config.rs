use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Flat, grouped configuration. Loading from file/env is out of scope:
/// callers construct this directly or start from `Default` and override
/// fields. The wallet private key is read from the ambient environment
/// separately and never stored here.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Api ---
    pub clob_endpoint: String,
    pub gamma_endpoint: String,
    pub chain_id: u64,
    pub use_binance: bool,
    pub max_price_age_secs: u64,

    // --- Trading ---
    pub assets: Vec<String>,
    pub duration: String,
    pub default_shares: Decimal,
    pub default_sum_target: Decimal,
    pub default_dip_threshold: Decimal,
    pub window_minutes: u64,
    pub max_cycles: u32,
    pub dump_window_ms: u64,
    pub use_maker_orders: bool,
    pub maker_fallback_to_taker: bool,
    pub taker_fee_rate: Decimal,
    pub max_spread_pct: Decimal,
    pub gtc_fill_timeout_ms: u64,
    pub gtc_poll_interval_ms: u64,

    // --- Risk ---
    pub max_balance_pct_per_trade: Decimal,
    pub min_shares: Decimal,
    pub max_shares: Decimal,
    pub consecutive_loss_limit: u32,
    pub cooldown_minutes: i64,
    pub emergency_enabled: bool,
    pub exit_before_expiry_minutes: i64,

    // --- Paper ---
    pub paper_enabled: bool,
    pub starting_balance: Decimal,
    pub simulate_fees: bool,
    pub simulate_slippage: bool,
    pub slippage_pct: Decimal,
    pub log_file: String,
    pub record_data: bool,
    pub data_dir: String,
    pub record_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Api
            clob_endpoint: "https://clob.polymarket.com".to_string(),
            gamma_endpoint: "https://gamma-api.polymarket.com".to_string(),
            chain_id: 137,
            use_binance: true,
            max_price_age_secs: 10,

            // Trading
            assets: vec!["BTC".to_string()],
            duration: "15m".to_string(),
            default_shares: dec!(20),
            default_sum_target: dec!(0.95),
            default_dip_threshold: dec!(0.20),
            window_minutes: 5,
            max_cycles: 1,
            dump_window_ms: 3000,
            use_maker_orders: true,
            maker_fallback_to_taker: true,
            taker_fee_rate: dec!(0.0625),
            max_spread_pct: dec!(0.10),
            gtc_fill_timeout_ms: 30_000,
            gtc_poll_interval_ms: 1000,

            // Risk
            max_balance_pct_per_trade: dec!(0.05),
            min_shares: dec!(5),
            max_shares: dec!(100),
            consecutive_loss_limit: 3,
            cooldown_minutes: 360,
            emergency_enabled: true,
            exit_before_expiry_minutes: 3,

            // Paper
            paper_enabled: true,
            starting_balance: dec!(1000),
            simulate_fees: true,
            simulate_slippage: true,
            slippage_pct: dec!(0.02),
            log_file: "trades.jsonl".to_string(),
            record_data: true,
            data_dir: "./data".to_string(),
            record_interval_ms: 1000,
        }
    }
}
