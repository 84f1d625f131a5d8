//! Configuration for the exchange engine

use crate::{error::ExchangeError, ExchangeResult};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the exchange engine
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Lowest balance any account may reach; a small overdraft bootstraps
    /// new members
    pub overdraft_floor: Decimal,
    /// Hard ceiling on pending requests per service, independent of capacity
    pub pending_queue_cap: usize,
    /// Upper bound on any single row-lock wait, in milliseconds
    pub lock_wait_ms: u64,
    /// Retry an operation once after a transient lock timeout
    pub retry_transient: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            overdraft_floor: Decimal::new(-1000, 2), // -10.00 hours
            pending_queue_cap: 50,
            lock_wait_ms: 5_000,
            retry_transient: true,
        }
    }
}

impl ExchangeConfig {
    /// The lock-wait bound as a `Duration`
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Load the configuration from `TIMEBANK_`-prefixed environment
    /// variables, falling back to the defaults for anything unset.
    pub fn from_env() -> ExchangeResult<Self> {
        let settings = config::Config::builder()
            .set_default("overdraft_floor", "-10.00")
            .map_err(|e| ExchangeError::config(e.to_string()))?
            .set_default("pending_queue_cap", 50_i64)
            .map_err(|e| ExchangeError::config(e.to_string()))?
            .set_default("lock_wait_ms", 5_000_i64)
            .map_err(|e| ExchangeError::config(e.to_string()))?
            .set_default("retry_transient", true)
            .map_err(|e| ExchangeError::config(e.to_string()))?
            .add_source(config::Environment::with_prefix("TIMEBANK"))
            .build()
            .map_err(|e| ExchangeError::config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| ExchangeError::config(e.to_string()))
    }
}
