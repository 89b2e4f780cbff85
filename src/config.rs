// Runtime configuration, read from the environment once at startup.
//
// `main` loads `.env` first, so everything here can also live in that file.
// A provider whose client id is unset is simply not registered.

use anyhow::{bail, Context};
use chrono::Duration;
use std::str::FromStr;

use crate::core::compliance::MAX_RENEWAL_DAYS;
use crate::core::storage::{ComplianceThresholds, RetryPolicy, UploadSettings};
use crate::infra::providers::{GoogleDriveSettings, MetaSettings, MicrosoftGraphSettings};

/// Drive wants 256 KiB multiples and Graph 320 KiB; 1280 KiB satisfies both.
pub const CHUNK_ALIGNMENT: usize = 1280 * 1024;

/// `GATEWAY_DATABASE_URL` value that selects the in-memory stores.
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub bind: String,
    pub upload: UploadSettings,
    pub token_skew: Duration,
    pub renewal_days: i64,
    pub thresholds: ComplianceThresholds,
    pub oauth_state_ttl: Duration,
    pub google: Option<GoogleDriveSettings>,
    pub microsoft: Option<MicrosoftGraphSettings>,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let chunk_size: usize = parse_or(&get, "GATEWAY_UPLOAD_CHUNK_BYTES", 5 * 1024 * 1024)?;
        if chunk_size == 0 || chunk_size % CHUNK_ALIGNMENT != 0 {
            bail!(
                "GATEWAY_UPLOAD_CHUNK_BYTES must be a positive multiple of {} bytes, got {}",
                CHUNK_ALIGNMENT,
                chunk_size
            );
        }

        let max_attempts: u32 = parse_or(&get, "GATEWAY_CHUNK_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            bail!("GATEWAY_CHUNK_MAX_ATTEMPTS must be at least 1");
        }
        let chunk_timeout_secs: u64 = parse_or(&get, "GATEWAY_CHUNK_TIMEOUT_SECS", 60)?;
        if chunk_timeout_secs == 0 {
            bail!("GATEWAY_CHUNK_TIMEOUT_SECS must be at least 1");
        }
        let base_delay_ms: u64 = parse_or(&get, "GATEWAY_RETRY_BASE_DELAY_MS", 250)?;

        let mut skew_secs: i64 = parse_or(&get, "GATEWAY_TOKEN_SKEW_SECS", 60)?;
        if skew_secs < 60 {
            tracing::warn!(skew_secs, "Token skew below 60 seconds, using 60");
            skew_secs = 60;
        }

        let renewal_days: i64 = parse_or(&get, "GATEWAY_RENEWAL_DAYS", 365)?;
        if !(1..=MAX_RENEWAL_DAYS).contains(&renewal_days) {
            bail!(
                "GATEWAY_RENEWAL_DAYS must be between 1 and {}, got {}",
                MAX_RENEWAL_DAYS,
                renewal_days
            );
        }
        let expiry_days: i64 = parse_or(&get, "GATEWAY_EXPIRY_DAYS", 365)?;
        let pending_days: i64 = parse_or(&get, "GATEWAY_PENDING_RENEWAL_DAYS", 300)?;
        if expiry_days <= 0 || pending_days <= 0 {
            bail!("GATEWAY_EXPIRY_DAYS and GATEWAY_PENDING_RENEWAL_DAYS must be positive");
        }
        if pending_days > expiry_days {
            bail!(
                "GATEWAY_PENDING_RENEWAL_DAYS ({}) must not exceed GATEWAY_EXPIRY_DAYS ({})",
                pending_days,
                expiry_days
            );
        }

        let state_ttl_secs: i64 = parse_or(&get, "GATEWAY_OAUTH_STATE_TTL_SECS", 600)?;
        if state_ttl_secs <= 0 {
            bail!("GATEWAY_OAUTH_STATE_TTL_SECS must be positive");
        }

        let google = match get("GOOGLE_CLIENT_ID") {
            Some(client_id) => {
                let secret = get("GOOGLE_CLIENT_SECRET")
                    .context("GOOGLE_CLIENT_SECRET is required when GOOGLE_CLIENT_ID is set")?;
                Some(GoogleDriveSettings::new(client_id, secret))
            }
            None => None,
        };

        let microsoft = match get("MICROSOFT_CLIENT_ID") {
            Some(client_id) => {
                let secret = get("MICROSOFT_CLIENT_SECRET").context(
                    "MICROSOFT_CLIENT_SECRET is required when MICROSOFT_CLIENT_ID is set",
                )?;
                let mut settings = MicrosoftGraphSettings::new(client_id, secret);
                if let Some(tenant) = get("MICROSOFT_TENANT") {
                    settings.tenant = tenant;
                }
                Some(settings)
            }
            None => None,
        };

        Ok(Self {
            database_url: get("GATEWAY_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/gateway.db".to_string()),
            bind: get("GATEWAY_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            upload: UploadSettings {
                chunk_size,
                chunk_timeout: std::time::Duration::from_secs(chunk_timeout_secs),
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: std::time::Duration::from_millis(base_delay_ms),
                },
            },
            token_skew: Duration::seconds(skew_secs),
            renewal_days,
            thresholds: ComplianceThresholds {
                pending_renewal_days: pending_days,
                expiry_days,
            },
            oauth_state_ttl: Duration::seconds(state_ttl_secs),
            google,
            microsoft,
        })
    }

    pub fn uses_memory_stores(&self) -> bool {
        self.database_url == MEMORY_DATABASE
    }

    pub fn meta_settings(&self) -> MetaSettings {
        MetaSettings {
            renewal_period: Duration::days(self.renewal_days),
            thresholds: self.thresholds,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}
