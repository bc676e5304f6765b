//! Pipeline configuration and environment overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default overall pipeline bound (one minute).
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default per-request network bound.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;

/// Companion script fetched next to a manifest URL.
pub const DEFAULT_COMPANION_FILENAME: &str = "prepare.js";

/// What the request builder does when extraction fails on a capture delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// The first failed extraction ends the pipeline.
    #[default]
    Terminal,
    /// Keep extracting on every new delivery (multi-step logins) until one
    /// succeeds, the surface closes, or `max_attempts` deliveries were tried.
    RetryOnUpdate { max_attempts: u32 },
}

/// Configuration for one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overall bound across fetch, capture and extraction, in milliseconds.
    pub timeout_ms: u64,
    /// Bound for each network request, in milliseconds.
    pub fetch_timeout_ms: u64,
    pub companion_filename: String,
    pub redelivery: RedeliveryPolicy,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            companion_filename: DEFAULT_COMPANION_FILENAME.to_string(),
            redelivery: RedeliveryPolicy::default(),
            user_agent: concat!("web-attest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `WEB_ATTEST_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_u64(&lookup, "WEB_ATTEST_TIMEOUT_MS") {
            self.timeout_ms = ms;
        }
        if let Some(ms) = parse_u64(&lookup, "WEB_ATTEST_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = ms;
        }
        if let Some(name) = lookup("WEB_ATTEST_COMPANION_FILE") {
            let name = name.trim();
            if !name.is_empty() && !name.contains('/') {
                self.companion_filename = name.to_string();
            } else {
                tracing::warn!("ignoring WEB_ATTEST_COMPANION_FILE={name:?}");
            }
        }
        if let Some(n) = parse_u64(&lookup, "WEB_ATTEST_RETRY_ON_UPDATE") {
            self.redelivery = match u32::try_from(n) {
                Ok(0) => RedeliveryPolicy::Terminal,
                Ok(max_attempts) => RedeliveryPolicy::RetryOnUpdate { max_attempts },
                Err(_) => RedeliveryPolicy::RetryOnUpdate {
                    max_attempts: u32::MAX,
                },
            };
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring {key}={raw:?}: {e}");
            None
        }
    }
}
