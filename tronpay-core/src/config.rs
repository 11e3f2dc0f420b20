//! Engine configuration.
//!
//! Every knob is an environment variable with a default; `from_env` reads and
//! validates the whole set at once so a bad deployment fails at startup
//! instead of mid-cycle.

use crate::entities::Currency;
use crate::validation::{self, AmountLimits};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A variable is present but unusable.
    #[error("invalid configuration {key}: {message}")]
    Invalid {
        key: &'static str,
        message: String,
    },
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Merchant wallet receiving all payments. Required, validated TRON shape.
    pub wallet_address: String,
    /// Path of the embedded database file.
    pub database_path: PathBuf,
    /// Block-explorer base URL; must be https and on the allow-list.
    pub api_url: String,
    /// Explorer requests allowed per sliding 60-second window.
    pub requests_per_minute: u32,
    /// TTL of the explorer response cache.
    pub api_cache_ttl: Duration,

    pub db_pool_size: u32,
    pub db_connection_timeout: Duration,
    pub db_pool_timeout: Duration,
    pub db_cache_size: i64,
    pub db_mmap_size: i64,

    pub min_usdt_amount: f64,
    pub max_usdt_amount: f64,
    pub min_trx_amount: f64,
    pub max_trx_amount: f64,
    pub max_amount_limit: f64,
    pub max_description_length: usize,

    /// Oldest transfer age still accepted by the freshness check.
    pub max_transaction_age: Duration,
    /// Clock-skew tolerance for transfers stamped in the future.
    pub future_tolerance: Duration,

    pub min_confirmations_trx: i64,
    pub min_confirmations_usdt: i64,
    pub default_min_confirmations: i64,

    /// Senders whose payments are never accepted.
    pub blacklisted_addresses: Vec<String>,

    pub max_total_forms: i64,
    pub min_form_creation_interval: Duration,
    pub min_user_form_interval: Duration,
    pub max_user_forms_per_hour: u32,
    pub max_user_counters: usize,
    pub user_counters_cleanup: Duration,
    pub default_form_expires_hours: i64,

    /// TTL of the form read cache.
    pub cache_expiry: Duration,
    pub max_form_cache_size: usize,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            wallet_address: String::new(),
            database_path: PathBuf::from("transaction.db"),
            api_url: "https://apilist.tronscanapi.com/api".to_string(),
            requests_per_minute: 20,
            api_cache_ttl: Duration::from_secs(30),
            db_pool_size: 5,
            db_connection_timeout: Duration::from_secs(30),
            db_pool_timeout: Duration::from_secs(10),
            db_cache_size: 10_000,
            db_mmap_size: 268_435_456,
            min_usdt_amount: 0.1,
            max_usdt_amount: 10_000.0,
            min_trx_amount: 1.0,
            max_trx_amount: 100_000.0,
            max_amount_limit: 1e15,
            max_description_length: 500,
            max_transaction_age: Duration::from_secs(2 * 3600),
            future_tolerance: Duration::from_secs(5 * 60),
            min_confirmations_trx: 19,
            min_confirmations_usdt: 19,
            default_min_confirmations: 19,
            blacklisted_addresses: Vec::new(),
            max_total_forms: 1000,
            min_form_creation_interval: Duration::from_secs_f64(0.5),
            min_user_form_interval: Duration::from_secs_f64(2.0),
            max_user_forms_per_hour: 20,
            max_user_counters: 10_000,
            user_counters_cleanup: Duration::from_secs(3600),
            default_form_expires_hours: 24,
            cache_expiry: Duration::from_secs(300),
            max_form_cache_size: 1000,
        }
    }
}

impl PaymentConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let wallet_address =
            env_string("WALLET_ADDRESS").ok_or(ConfigError::Missing("WALLET_ADDRESS"))?;

        // API_RATE_LIMIT is the legacy name for API_REQUESTS_PER_MINUTE.
        let requests_per_minute = match env_string("API_REQUESTS_PER_MINUTE") {
            Some(raw) => parse_value("API_REQUESTS_PER_MINUTE", &raw)?,
            None => env_parse("API_RATE_LIMIT", defaults.requests_per_minute)?,
        };

        let config = Self {
            wallet_address,
            database_path: env_string("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            api_url: env_string("TRONSCAN_API_URL").unwrap_or(defaults.api_url),
            requests_per_minute,
            api_cache_ttl: env_secs("API_CACHE_TTL_SECONDS", defaults.api_cache_ttl)?,
            db_pool_size: env_parse("DB_POOL_SIZE", defaults.db_pool_size)?,
            db_connection_timeout: env_secs(
                "DB_CONNECTION_TIMEOUT",
                defaults.db_connection_timeout,
            )?,
            db_pool_timeout: env_secs("DB_POOL_TIMEOUT", defaults.db_pool_timeout)?,
            db_cache_size: env_parse("DB_CACHE_SIZE", defaults.db_cache_size)?,
            db_mmap_size: env_parse("DB_MMAP_SIZE", defaults.db_mmap_size)?,
            min_usdt_amount: env_parse("MIN_USDT_AMOUNT", defaults.min_usdt_amount)?,
            max_usdt_amount: env_parse("MAX_USDT_AMOUNT", defaults.max_usdt_amount)?,
            min_trx_amount: env_parse("MIN_TRX_AMOUNT", defaults.min_trx_amount)?,
            max_trx_amount: env_parse("MAX_TRX_AMOUNT", defaults.max_trx_amount)?,
            max_amount_limit: env_parse("MAX_AMOUNT_LIMIT", defaults.max_amount_limit)?,
            max_description_length: env_parse(
                "MAX_DESCRIPTION_LENGTH",
                defaults.max_description_length,
            )?,
            max_transaction_age: env_hours(
                "MAX_TRANSACTION_AGE_HOURS",
                defaults.max_transaction_age,
            )?,
            future_tolerance: env_minutes(
                "FUTURE_TOLERANCE_MINUTES",
                defaults.future_tolerance,
            )?,
            min_confirmations_trx: env_parse(
                "MIN_CONFIRMATIONS_TRX",
                defaults.min_confirmations_trx,
            )?,
            min_confirmations_usdt: env_parse(
                "MIN_CONFIRMATIONS_USDT",
                defaults.min_confirmations_usdt,
            )?,
            default_min_confirmations: env_parse(
                "DEFAULT_MIN_CONFIRMATIONS",
                defaults.default_min_confirmations,
            )?,
            blacklisted_addresses: env_string("BLACKLISTED_ADDRESSES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            max_total_forms: env_parse("MAX_TOTAL_FORMS", defaults.max_total_forms)?,
            min_form_creation_interval: env_secs_f64(
                "MIN_FORM_CREATION_INTERVAL_SECONDS",
                defaults.min_form_creation_interval,
            )?,
            min_user_form_interval: env_secs_f64(
                "MIN_USER_FORM_INTERVAL_SECONDS",
                defaults.min_user_form_interval,
            )?,
            max_user_forms_per_hour: env_parse(
                "MAX_USER_FORMS_PER_HOUR",
                defaults.max_user_forms_per_hour,
            )?,
            max_user_counters: env_parse("MAX_USER_COUNTERS", defaults.max_user_counters)?,
            user_counters_cleanup: env_hours(
                "USER_COUNTERS_CLEANUP_HOURS",
                defaults.user_counters_cleanup,
            )?,
            default_form_expires_hours: env_parse(
                "DEFAULT_FORM_EXPIRES_HOURS",
                defaults.default_form_expires_hours,
            )?,
            cache_expiry: env_secs("CACHE_EXPIRY_SECONDS", defaults.cache_expiry)?,
            max_form_cache_size: env_parse(
                "MAX_FORM_CACHE_SIZE",
                defaults.max_form_cache_size,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !validation::is_valid_tron_address(&self.wallet_address) {
            return Err(ConfigError::Invalid {
                key: "WALLET_ADDRESS",
                message: "not a valid TRON address".to_string(),
            });
        }
        if !(1..=1000).contains(&self.requests_per_minute) {
            return Err(ConfigError::Invalid {
                key: "API_REQUESTS_PER_MINUTE",
                message: format!("{} is outside 1..=1000", self.requests_per_minute),
            });
        }
        if !(1..=168).contains(&self.default_form_expires_hours) {
            return Err(ConfigError::Invalid {
                key: "DEFAULT_FORM_EXPIRES_HOURS",
                message: format!("{} is outside 1..=168", self.default_form_expires_hours),
            });
        }
        if self.db_pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "DB_POOL_SIZE",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Per-currency amount bounds.
    pub fn amount_limits(&self, currency: Currency) -> AmountLimits {
        match currency {
            Currency::Usdt => AmountLimits {
                min: self.min_usdt_amount,
                max: self.max_usdt_amount,
            },
            Currency::Trx => AmountLimits {
                min: self.min_trx_amount,
                max: self.max_trx_amount,
            },
        }
    }

    /// Required confirmation count for a currency.
    pub fn min_confirmations(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Trx => self.min_confirmations_trx,
            Currency::Usdt => self.min_confirmations_usdt,
        }
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        message: e.to_string(),
    })
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_secs_f64(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let value: f64 = env_parse(key, default.as_secs_f64())?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{value} is not a non-negative duration"),
        });
    }
    Ok(Duration::from_secs_f64(value))
}

fn env_hours(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        env_parse(key, default.as_secs() / 3600)? * 3600,
    ))
}

fn env_minutes(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        env_parse(key, default.as_secs() / 60)? * 60,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_WALLET: &str = "TN9RRaXkCFtTXRso2GdTZxSxxwufzxLQPP";

    fn valid_config() -> PaymentConfig {
        PaymentConfig {
            wallet_address: TEST_WALLET.to_string(),
            ..PaymentConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PaymentConfig::default();
        assert_eq!(config.requests_per_minute, 20);
        assert_eq!(config.db_pool_size, 5);
        assert_eq!(config.max_total_forms, 1000);
        assert_eq!(config.default_form_expires_hours, 24);
        assert_eq!(config.max_transaction_age, Duration::from_secs(7200));
        assert_eq!(config.future_tolerance, Duration::from_secs(300));
    }

    #[test]
    fn validate_rejects_bad_wallet() {
        let config = PaymentConfig {
            wallet_address: "not-a-wallet".to_string(),
            ..PaymentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_rate_limit_out_of_range() {
        let config = PaymentConfig {
            requests_per_minute: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());

        let config = PaymentConfig {
            requests_per_minute: 1001,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults_with_wallet() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn per_currency_limits() {
        let config = valid_config();
        let usdt = config.amount_limits(Currency::Usdt);
        assert_eq!(usdt.min, 0.1);
        assert_eq!(usdt.max, 10_000.0);
        let trx = config.amount_limits(Currency::Trx);
        assert_eq!(trx.min, 1.0);
        assert_eq!(trx.max, 100_000.0);
    }
}
