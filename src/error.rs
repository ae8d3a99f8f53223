use thiserror::Error;

/// Named startup-failure kinds, used to pick the process exit code: 0 on
/// graceful shutdown, 1 on unrecoverable startup failure. Everything past
/// startup flows through `anyhow::Result`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("WALLET_PRIVATE_KEY is not set in the environment (required for live mode)")]
    MissingWalletKey,

    #[error("no active market found after {attempts} attempts, {interval_secs}s apart")]
    NoActiveMarket { attempts: u32, interval_secs: u64 },
}

impl StartupError {
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }
}
