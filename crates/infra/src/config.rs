//! Environment-driven configuration.
//!
//! Key spellings follow the operational knob table: dotted keys map to
//! upper-snake environment variables (`router.cacheSize` →
//! `ROUTER_CACHE_SIZE`, `consumer.bill-summary.batchSize` →
//! `CONSUMER_BILL_SUMMARY_BATCH_SIZE`).

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, bail};

pub const DEFAULT_RETRY_ON_CONFLICT: u32 = 3;
pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_POISON_BUDGET: u32 = 5;
pub const DEFAULT_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// File acceptance policy enforced by the router before the entity runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePolicy {
    pub max_bytes: u64,
    /// `None` accepts any content type.
    pub allowed_content_types: Option<BTreeSet<String>>,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self::permissive()
    }
}

impl FilePolicy {
    pub fn permissive() -> Self {
        Self {
            max_bytes: DEFAULT_FILE_MAX_BYTES,
            allowed_content_types: None,
        }
    }

    pub fn allows_content_type(&self, content_type: &str) -> bool {
        match &self.allowed_content_types {
            None => true,
            Some(set) => set.contains(content_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub cache_size: usize,
    pub retry_on_conflict: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            retry_on_conflict: DEFAULT_RETRY_ON_CONFLICT,
        }
    }
}

/// Per-consumer knobs, resolved by consumer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poison_budget: u32,
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poison_budget: DEFAULT_POISON_BUDGET,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrConfig {
    pub timeout: Duration,
    /// Cap on automatic re-runs after an `OcrFailed` event.
    pub max_attempts: u32,
    /// OCR service base URL; absent means no HTTP client is wired (dev).
    pub endpoint: Option<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConfig {
    pub timeout: Duration,
    /// Base URL presigned download links are issued under.
    pub public_base_url: String,
    pub presign_ttl: Duration,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            public_base_url: "http://localhost:8080/blobs".to_string(),
            presign_ttl: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub timeout: Duration,
    /// SMTP relay host; absent means notifications are recorded in memory
    /// (dev).
    pub host: Option<String>,
    pub port: u16,
    pub from: String,
    pub recipients: Vec<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            host: None,
            port: 587,
            from: "billflow@localhost".to_string(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub router: RouterConfig,
    pub file_policy: FilePolicy,
    pub ocr: OcrConfig,
    pub blob: BlobConfig,
    pub smtp: SmtpConfig,
    /// Postgres connection string; absent means in-memory stores (dev).
    pub database_url: Option<String>,
    pub bind_addr: String,
}

impl Config {
    /// Load configuration from the environment, rejecting invalid knobs at
    /// startup.
    pub fn from_env() -> anyhow::Result<Self> {
        // The log never discards history; the knob exists so a deployment
        // that expects otherwise fails loudly.
        if let Ok(retention) = std::env::var("LOG_RETENTION") {
            if retention != "forever" {
                bail!("log.retention must be \"forever\", got {retention:?}");
            }
        }

        let file_policy = FilePolicy {
            max_bytes: env_parse("FILE_MAX_BYTES", DEFAULT_FILE_MAX_BYTES)?,
            allowed_content_types: env_set("FILE_ALLOWED_CONTENT_TYPES"),
        };

        let router = RouterConfig {
            cache_size: env_parse("ROUTER_CACHE_SIZE", DEFAULT_CACHE_SIZE)?,
            retry_on_conflict: env_parse("ROUTER_RETRY_ON_CONFLICT", DEFAULT_RETRY_ON_CONFLICT)?,
        };

        let ocr = OcrConfig {
            timeout: Duration::from_secs(env_parse("OCR_TIMEOUT_SECS", 30u64)?),
            max_attempts: env_parse("OCR_MAX_ATTEMPTS", 3u32)?,
            endpoint: env_opt("OCR_ENDPOINT"),
        };

        let blob_defaults = BlobConfig::default();
        let blob = BlobConfig {
            timeout: Duration::from_secs(env_parse("BLOB_TIMEOUT_SECS", 10u64)?),
            public_base_url: env_opt("BLOB_PUBLIC_BASE_URL")
                .unwrap_or(blob_defaults.public_base_url),
            presign_ttl: Duration::from_secs(env_parse("BLOB_PRESIGN_TTL_SECS", 900u64)?),
        };

        let smtp_defaults = SmtpConfig::default();
        let smtp = SmtpConfig {
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS", 10u64)?),
            host: env_opt("SMTP_HOST"),
            port: env_parse("SMTP_PORT", smtp_defaults.port)?,
            from: env_opt("SMTP_FROM").unwrap_or(smtp_defaults.from),
            recipients: env_list("NOTIFY_RECIPIENTS"),
        };

        Ok(Self {
            router,
            file_policy,
            ocr,
            blob,
            smtp,
            database_url: env_opt("DATABASE_URL"),
            bind_addr: env_opt("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    /// Per-consumer knobs: `CONSUMER_<NAME>_BATCH_SIZE` and
    /// `CONSUMER_<NAME>_POISON_BUDGET`, with dashes mapped to underscores.
    pub fn consumer(&self, name: &str) -> ConsumerConfig {
        let prefix = format!("CONSUMER_{}", name.to_uppercase().replace('-', "_"));
        let defaults = ConsumerConfig::default();
        ConsumerConfig {
            batch_size: env_parse(&format!("{prefix}_BATCH_SIZE"), defaults.batch_size)
                .unwrap_or(defaults.batch_size),
            poison_budget: env_parse(&format!("{prefix}_POISON_BUDGET"), defaults.poison_budget)
                .unwrap_or(defaults.poison_budget),
            poll_interval: defaults.poll_interval,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_set(key: &str) -> Option<BTreeSet<String>> {
    let list = env_list(key);
    if list.is_empty() {
        None
    } else {
        Some(list.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_knob_table() {
        let config = Config::default();
        assert_eq!(config.router.retry_on_conflict, 3);
        assert_eq!(config.file_policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(ConsumerConfig::default().batch_size, 1);
        assert_eq!(ConsumerConfig::default().poison_budget, 5);
        assert_eq!(OcrConfig::default().timeout, Duration::from_secs(30));
        assert_eq!(BlobConfig::default().timeout, Duration::from_secs(10));
        assert_eq!(SmtpConfig::default().timeout, Duration::from_secs(10));
    }

    #[test]
    fn permissive_policy_accepts_anything_under_the_cap() {
        let policy = FilePolicy::permissive();
        assert_eq!(policy.max_bytes, 10 * 1024 * 1024);
        assert!(policy.allows_content_type("application/pdf"));
    }

    #[test]
    fn restricted_policy_filters_content_types() {
        let policy = FilePolicy {
            max_bytes: 1024,
            allowed_content_types: Some(BTreeSet::from(["image/png".to_string()])),
        };
        assert!(policy.allows_content_type("image/png"));
        assert!(!policy.allows_content_type("application/pdf"));
    }
}
