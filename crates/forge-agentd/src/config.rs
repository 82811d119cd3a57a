use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, bail};
use forge_observe::{LoggerConfig, LoggerFormat};

pub const HTTP_ADDR_ENV: &str = "FORGE_HTTP_ADDR";
pub const LOG_LEVEL_ENV: &str = "FORGE_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "FORGE_LOG_FORMAT";
pub const WORKERS_ENV: &str = "FORGE_WORKERS";
pub const GITHUB_API_ENV: &str = "FORGE_GITHUB_API";
pub const FULFILL_DELAY_ENV: &str = "FORGE_FULFILL_DELAY_MS";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub http_addr: SocketAddr,
    pub logger: LoggerConfig,
    /// In-process claim workers.
    pub workers: usize,
    /// Base URL of the GitHub API used to verify tokens.
    pub github_api: Option<String>,
    /// How long the simulated fulfiller takes per auction.
    pub fulfill_delay: Duration,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(addr) = lookup(HTTP_ADDR_ENV) {
            cfg.http_addr = addr
                .parse()
                .with_context(|| format!("{HTTP_ADDR_ENV}={addr} is not a socket address"))?;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            cfg.logger.format = format
                .parse::<LoggerFormat>()
                .with_context(|| format!("invalid {LOG_FORMAT_ENV}"))?;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            cfg.logger.level = level;
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            cfg.workers = workers
                .parse()
                .with_context(|| format!("{WORKERS_ENV}={workers} is not a number"))?;
        }
        if let Some(delay) = lookup(FULFILL_DELAY_ENV) {
            let ms: u64 = delay
                .parse()
                .with_context(|| format!("{FULFILL_DELAY_ENV}={delay} is not a number"))?;
            cfg.fulfill_delay = Duration::from_millis(ms);
        }
        cfg.github_api = lookup(GITHUB_API_ENV).filter(|v| !v.trim().is_empty());

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("{WORKERS_ENV} must be at least 1");
        }
        self.logger.validate()?;
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            logger: LoggerConfig::default(),
            workers: 2,
            github_api: None,
            fulfill_delay: Duration::from_millis(250),
        }
    }
}
