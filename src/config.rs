use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::dedup::DEFAULT_LOOKBACK_DAYS;
use crate::dispatch::Pacing;

/// Runtime configuration, resolved from the environment (with `.env`
/// support) at startup. Only `DATABASE_URL` is unconditionally required;
/// collaborator settings are validated when the collaborator is built.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub digest_dir: PathBuf,
    pub lookback_days: i64,
    pub stale_processing_hours: i64,
    pub due_limit: Option<i64>,
    pub api: ApiSettings,
    pub smtp: SmtpSettings,
    pub pacing: Pacing,
}

/// Generation API settings, including the retry layer that wraps each call.
/// This retry layer is independent of the scheduler's own one-day retry.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub url: String,
    pub key: String,
    pub model: String,
    pub temperature: f64,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_jitter: bool,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub cc_recipients: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} value {value:?}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let due_limit = match std::env::var("DUE_LIMIT") {
            Ok(value) => Some(
                value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid DUE_LIMIT value {value:?}: {e}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            digest_dir: PathBuf::from(env_or("DIGEST_DIR", "digests")),
            lookback_days: env_parse("LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS)?,
            stale_processing_hours: env_parse("STALE_PROCESSING_HOURS", 2)?,
            due_limit,
            api: ApiSettings {
                url: env_or(
                    "MATCH_API_URL",
                    "https://api.perplexity.ai/chat/completions",
                ),
                key: env_or("MATCH_API_KEY", ""),
                model: env_or("MATCH_API_MODEL", "sonar-pro"),
                temperature: env_parse("MATCH_API_TEMPERATURE", 0.2)?,
                timeout: Duration::from_secs(env_parse("MATCH_API_TIMEOUT_SECS", 600u64)?),
                max_attempts: env_parse("MATCH_API_MAX_ATTEMPTS", 3u32)?,
                retry_base_delay: Duration::from_millis(env_parse(
                    "MATCH_API_RETRY_BASE_MS",
                    2000u64,
                )?),
                retry_jitter: env_parse("MATCH_API_RETRY_JITTER", true)?,
            },
            smtp: SmtpSettings {
                host: env_or("SMTP_HOST", "localhost"),
                port: env_parse("SMTP_PORT", 587u16)?,
                sender: env_or("SENDER_EMAIL", ""),
                cc_recipients: env_or("CC_RECIPIENTS", "")
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            pacing: Pacing {
                batch_size: env_parse("BATCH_SIZE", 5usize)?,
                stagger: Duration::from_secs(env_parse("STAGGER_SECS", 2u64)?),
                inter_batch_delay: Duration::from_secs(env_parse(
                    "INTER_BATCH_DELAY_SECS",
                    10u64,
                )?),
            },
        })
    }
}
