use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub phone_number_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// New polls start `active` instead of waiting for approval.
    pub auto_activate_polls: bool,
    pub otp_ttl: Duration,
    pub sweep_interval: Duration,
    pub read_retries: u32,
    pub admin_token: Option<String>,
    pub whatsapp: Option<WhatsAppConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let otp_ttl_minutes: u64 = try_load("OTP_TTL_MINUTES", "10")?;
        let sweep_interval_secs: u64 = try_load("SWEEP_INTERVAL_SECS", "60")?;

        if otp_ttl_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "OTP_TTL_MINUTES",
                reason: "must be at least 1".into(),
            });
        }
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                reason: "must be at least 1".into(),
            });
        }

        let whatsapp = match (
            optional("WHATSAPP_PHONE_NUMBER_ID"),
            optional("WHATSAPP_ACCESS_TOKEN"),
        ) {
            (Some(phone_number_id), Some(access_token)) => Some(WhatsAppConfig {
                phone_number_id,
                access_token,
            }),
            _ => {
                warn!("WhatsApp credentials not set, notifications will only be logged");
                None
            }
        };

        let admin_token = optional("ADMIN_TOKEN");
        if admin_token.is_none() {
            warn!("ADMIN_TOKEN not set, admin routes will refuse every request");
        }

        Ok(Self {
            port: try_load("PORT", "3030")?,
            database_url: optional("DATABASE_URL"),
            db_max_connections: try_load("DB_MAX_CONNECTIONS", "5")?,
            auto_activate_polls: try_load("AUTO_ACTIVATE_POLLS", "false")?,
            otp_ttl: Duration::from_secs(otp_ttl_minutes * 60),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            read_retries: try_load("READ_RETRIES", "2")?,
            admin_token,
            whatsapp,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    optional(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })
}
