//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration for local development.

use std::path::PathBuf;

use vigil_shared::constants::{
    CHANNEL_CAPACITY, DEFAULT_CORRECTIVE_SCROLL, DEFAULT_NEAR_TOP_THRESHOLD, DEFAULT_PAGE_SIZE,
    MAX_CORRECTIVE_SCROLL, MAX_PAGE_SIZE,
};
use vigil_shared::types::{ConversationId, TenantId};

use crate::error::ConfigError;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Messages requested per Fetch Page call.
    /// Env: `VIGIL_PAGE_SIZE`
    /// Default: `50`
    pub page_size: u32,

    /// Scroll distance from the oldest loaded message under which a
    /// user-driven scroll requests the next page.
    /// Env: `VIGIL_NEAR_TOP_THRESHOLD`
    /// Default: `24`
    pub near_top_threshold: f64,

    /// Offset a programmatic scroll-to-top settles at. Must be positive, at
    /// most 100 and larger than the near-top threshold.
    /// Env: `VIGIL_CORRECTIVE_SCROLL`
    /// Default: `40`
    pub corrective_scroll: f64,

    /// Capacity of internal command and completion channels.
    pub channel_capacity: usize,

    /// Local database file. `None` uses the platform data directory.
    /// Env: `VIGIL_DB_PATH`
    pub database_path: Option<PathBuf>,

    /// Conversation opened by the command-line client.
    /// Env: `VIGIL_CONVERSATION_ID`
    pub conversation_id: Option<ConversationId>,

    /// Tenant scope of every query.
    /// Env: `VIGIL_TENANT_ID`
    pub tenant_id: Option<TenantId>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            near_top_threshold: DEFAULT_NEAR_TOP_THRESHOLD,
            corrective_scroll: DEFAULT_CORRECTIVE_SCROLL,
            channel_capacity: CHANNEL_CAPACITY,
            database_path: None,
            conversation_id: None,
            tenant_id: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Invalid values are
    /// logged and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("VIGIL_PAGE_SIZE") {
            match val.trim().parse::<u32>() {
                Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => config.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid VIGIL_PAGE_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("VIGIL_NEAR_TOP_THRESHOLD") {
            match val.trim().parse::<f64>() {
                Ok(n) if n.is_finite() && n >= 0.0 => config.near_top_threshold = n,
                _ => tracing::warn!(value = %val, "Invalid VIGIL_NEAR_TOP_THRESHOLD, using default"),
            }
        }

        if let Some(val) = lookup("VIGIL_CORRECTIVE_SCROLL") {
            match val.trim().parse::<f64>() {
                Ok(n) if n.is_finite() && n > 0.0 && n <= MAX_CORRECTIVE_SCROLL => {
                    config.corrective_scroll = n
                }
                _ => tracing::warn!(value = %val, "Invalid VIGIL_CORRECTIVE_SCROLL, using default"),
            }
        }

        if config.corrective_scroll <= config.near_top_threshold {
            tracing::warn!(
                corrective = config.corrective_scroll,
                threshold = config.near_top_threshold,
                "Corrective scroll inside the near-top zone, restoring scroll defaults"
            );
            config.near_top_threshold = DEFAULT_NEAR_TOP_THRESHOLD;
            config.corrective_scroll = DEFAULT_CORRECTIVE_SCROLL;
        }

        if let Some(path) = lookup("VIGIL_DB_PATH") {
            if !path.trim().is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("VIGIL_CONVERSATION_ID") {
            match ConversationId::parse(&val) {
                Ok(id) => config.conversation_id = Some(id),
                Err(e) => tracing::warn!(value = %val, error = %e, "Invalid VIGIL_CONVERSATION_ID"),
            }
        }

        if let Some(val) = lookup("VIGIL_TENANT_ID") {
            match TenantId::parse(&val) {
                Ok(id) => config.tenant_id = Some(id),
                Err(e) => tracing::warn!(value = %val, error = %e, "Invalid VIGIL_TENANT_ID"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::PageSize {
                value: self.page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        if !self.near_top_threshold.is_finite() || self.near_top_threshold < 0.0 {
            return Err(ConfigError::NearTopThreshold(self.near_top_threshold));
        }
        if !self.corrective_scroll.is_finite()
            || self.corrective_scroll <= 0.0
            || self.corrective_scroll > MAX_CORRECTIVE_SCROLL
        {
            return Err(ConfigError::CorrectiveScroll {
                value: self.corrective_scroll,
                max: MAX_CORRECTIVE_SCROLL,
            });
        }
        if self.corrective_scroll <= self.near_top_threshold {
            return Err(ConfigError::CorrectiveInsideThreshold {
                corrective: self.corrective_scroll,
                threshold: self.near_top_threshold,
            });
        }
        Ok(())
    }
}
