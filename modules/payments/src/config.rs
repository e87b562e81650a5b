use chrono::Duration;
use std::env;
use std::str::FromStr;

use crate::gateway::ccbill::CcbillConfig;
use crate::gateway::tilled::TilledConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    Memory,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_json: bool,

    pub default_gateway: String,
    pub fake_webhook_secret: String,
    pub tilled: Option<TilledConfig>,
    pub ccbill: Option<CcbillConfig>,

    /// Platform fee in basis points of the gross amount
    pub platform_fee_bps: u32,
    pub intent_ttl: Duration,
    /// `None` when no grace window applies
    pub subscription_grace: Option<Duration>,
    pub reminder_lookahead: Duration,
    pub intent_retention: Duration,
    pub sweep_batch_size: i64,
    pub sweep_interval: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_type: StoreType::Postgres,
            database_url: None,
            host: "0.0.0.0".to_string(),
            port: 8091,
            log_json: false,
            default_gateway: "fake".to_string(),
            fake_webhook_secret: "whsec_fake".to_string(),
            tilled: None,
            ccbill: None,
            platform_fee_bps: 0,
            intent_ttl: Duration::minutes(60),
            subscription_grace: Some(Duration::days(3)),
            reminder_lookahead: Duration::hours(48),
            intent_retention: Duration::days(90),
            sweep_batch_size: 100,
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid {}", name, std::any::type_name::<T>())),
        _ => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Config::default();

        let store_type = match env::var("STORE_TYPE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreType::Postgres,
            "memory" => StoreType::Memory,
            other => {
                return Err(format!(
                    "Invalid STORE_TYPE: {}. Must be 'postgres' or 'memory'",
                    other
                ))
            }
        };

        let database_url = optional_var("DATABASE_URL");
        if store_type == StoreType::Postgres && database_url.is_none() {
            return Err("DATABASE_URL must be set".to_string());
        }

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port: u16 = parse_var("PORT", defaults.port)?;
        let log_json = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let default_gateway =
            env::var("PAYMENTS_DEFAULT_GATEWAY").unwrap_or(defaults.default_gateway);
        let fake_webhook_secret =
            env::var("FAKE_WEBHOOK_SECRET").unwrap_or(defaults.fake_webhook_secret);

        let tilled = match (
            optional_var("TILLED_SECRET_KEY"),
            optional_var("TILLED_ACCOUNT_ID"),
            optional_var("TILLED_WEBHOOK_SECRET"),
        ) {
            (Some(secret_key), Some(account_id), Some(webhook_secret)) => {
                let sandbox = parse_var("TILLED_SANDBOX", false)?;
                Some(TilledConfig::new(secret_key, account_id, webhook_secret, sandbox))
            }
            _ => None,
        };

        let ccbill = match (
            optional_var("CCBILL_ACCOUNT"),
            optional_var("CCBILL_SUBACCOUNT"),
            optional_var("CCBILL_WEBHOOK_SECRET"),
        ) {
            (Some(account), Some(subaccount), Some(webhook_secret)) => Some(CcbillConfig {
                account,
                subaccount,
                webhook_secret,
                datalink_user: optional_var("CCBILL_DATALINK_USER"),
                datalink_password: optional_var("CCBILL_DATALINK_PASSWORD"),
                form_name: optional_var("CCBILL_FORM_NAME").unwrap_or_else(|| "cc".to_string()),
            }),
            _ => None,
        };

        let platform_fee_bps: u32 = parse_var("PLATFORM_FEE_BPS", 0)?;
        if platform_fee_bps > 10_000 {
            return Err("PLATFORM_FEE_BPS must be between 0 and 10000".to_string());
        }

        let intent_ttl_minutes: i64 = parse_var("INTENT_TTL_MINUTES", 60)?;
        let grace_days: i64 = parse_var("SUBSCRIPTION_GRACE_DAYS", 3)?;
        let lookahead_hours: i64 = parse_var("RENEWAL_REMINDER_LOOKAHEAD_HOURS", 48)?;
        let retention_days: i64 = parse_var("INTENT_RETENTION_DAYS", 90)?;
        let sweep_batch_size: i64 = parse_var("SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?;
        let sweep_interval_secs: u64 = parse_var("SWEEP_INTERVAL_SECS", 60)?;

        if sweep_batch_size <= 0 {
            return Err("SWEEP_BATCH_SIZE must be positive".to_string());
        }

        Ok(Config {
            store_type,
            database_url,
            host,
            port,
            log_json,
            default_gateway,
            fake_webhook_secret,
            tilled,
            ccbill,
            platform_fee_bps,
            intent_ttl: Duration::minutes(intent_ttl_minutes),
            subscription_grace: (grace_days > 0).then(|| Duration::days(grace_days)),
            reminder_lookahead: Duration::hours(lookahead_hours),
            intent_retention: Duration::days(retention_days),
            sweep_batch_size,
            sweep_interval: std::time::Duration::from_secs(sweep_interval_secs.max(1)),
        })
    }
}
