use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,

    // Payment gateway
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub gateway_webhook_secret: String,

    // Escrow
    /// Platform cut taken out of every charge (0.10 = 10%)
    pub platform_fee_rate: Decimal,
    /// Held charges on DONE tasks older than this are swept to the steward
    pub auto_release_after_hours: i64,
    pub sweep_interval_secs: u64,

    // Withdrawals (minor currency units)
    pub min_withdrawal: Decimal,
    pub withdrawal_fixed_fee: Decimal,
    pub withdrawal_percent_fee: Decimal,
    pub withdrawal_fee_cap: Decimal,

    pub default_currency: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/escrow_ledger".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            gateway_base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.paystack.co".to_string()),
            gateway_secret_key: std::env::var("GATEWAY_SECRET_KEY").unwrap_or_default(),
            gateway_webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_default(),
            platform_fee_rate: decimal_env("PLATFORM_FEE_RATE", "0.10")?,
            auto_release_after_hours: int_env("AUTO_RELEASE_AFTER_HOURS", 24)?,
            sweep_interval_secs: int_env("SWEEP_INTERVAL_SECS", 600)? as u64,
            min_withdrawal: decimal_env("MIN_WITHDRAWAL", "10000")?,
            withdrawal_fixed_fee: decimal_env("WITHDRAWAL_FIXED_FEE", "500")?,
            withdrawal_percent_fee: decimal_env("WITHDRAWAL_PERCENT_FEE", "0.005")?,
            withdrawal_fee_cap: decimal_env("WITHDRAWAL_FEE_CAP", "5000")?,
            default_currency: std::env::var("DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "NGN".to_string()),
        })
    }
}

fn decimal_env(key: &str, default: &str) -> Result<Decimal, config::ConfigError> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw)
        .map_err(|e| config::ConfigError::Message(format!("{}: {}", key, e)))
}

fn int_env(key: &str, default: i64) -> Result<i64, config::ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<i64>()
            .map_err(|e| config::ConfigError::Message(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
