//! Store configuration module.
//!
//! Configuration is chosen once when a store is opened and never changes
//! afterwards. It can be built in code or loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `TRIPLESTORE_PERSISTENCE_STRATEGY`: `append-only` or `rewrite` (default: `append-only`)
//! - `TRIPLESTORE_PRELOAD_PAGES`: related-resource index pages to preload on open (default: `0`)
//! - `TRIPLESTORE_MAX_KEYS_PER_NODE`: cap on keys per B+Tree node (default: derived from the page size)
//!
//! # Invariants
//!
//! - `max_keys_per_node`, when set, is at least [`StoreConfig::MIN_KEYS_PER_NODE`]
//! - The strategy recorded in an existing store wins over the configured one

use std::str::FromStr;

/// How superseded pages are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PersistenceStrategy {
    /// Superseded pages are never reused. Every commit stays readable.
    #[default]
    AppendOnly = 1,
    /// Superseded pages are recycled once no reader can reach them.
    Rewrite = 2,
}

impl TryFrom<u8> for PersistenceStrategy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AppendOnly),
            2 => Ok(Self::Rewrite),
            _ => Err(value),
        }
    }
}

impl FromStr for PersistenceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append-only" | "appendonly" | "append_only" => Ok(Self::AppendOnly),
            "rewrite" => Ok(Self::Rewrite),
            other => Err(format!(
                "'{other}' is not a persistence strategy (expected 'append-only' or 'rewrite')"
            )),
        }
    }
}

impl std::fmt::Display for PersistenceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppendOnly => write!(f, "append-only"),
            Self::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreConfig {
    /// Persistence strategy used when creating a store.
    pub strategy: PersistenceStrategy,
    /// Number of related-resource index pages to load into the cache on open.
    pub preload_pages: usize,
    /// Upper bound on keys per B+Tree node. `None` lets the page size decide.
    pub max_keys_per_node: Option<usize>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreConfig {
    /// Smallest branching factor that still lets a split leave keys on both sides.
    pub const MIN_KEYS_PER_NODE: usize = 3;

    const STRATEGY_VAR: &'static str = "TRIPLESTORE_PERSISTENCE_STRATEGY";
    const PRELOAD_VAR: &'static str = "TRIPLESTORE_PRELOAD_PAGES";
    const MAX_KEYS_VAR: &'static str = "TRIPLESTORE_MAX_KEYS_PER_NODE";

    /// Use the given persistence strategy for newly created stores.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: PersistenceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Preload this many related-resource index pages on open.
    #[must_use]
    pub const fn with_preload_pages(mut self, pages: usize) -> Self {
        self.preload_pages = pages;
        self
    }

    /// Cap the number of keys per tree node. Values below
    /// [`Self::MIN_KEYS_PER_NODE`] are raised to it.
    #[must_use]
    pub fn with_max_keys_per_node(mut self, max_keys: usize) -> Self {
        self.max_keys_per_node = Some(max_keys.max(Self::MIN_KEYS_PER_NODE));
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::STRATEGY_VAR) {
            config.strategy = value
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    name: Self::STRATEGY_VAR.to_string(),
                    message,
                })?;
        }

        if let Some(value) = lookup(Self::PRELOAD_VAR) {
            config.preload_pages = parse_count(Self::PRELOAD_VAR, &value)?;
        }

        if let Some(value) = lookup(Self::MAX_KEYS_VAR) {
            let max_keys = parse_count(Self::MAX_KEYS_VAR, &value)?;
            if max_keys < Self::MIN_KEYS_PER_NODE {
                return Err(ConfigError::InvalidValue {
                    name: Self::MAX_KEYS_VAR.to_string(),
                    message: format!(
                        "must be at least {}, got {max_keys}",
                        Self::MIN_KEYS_PER_NODE
                    ),
                });
            }
            config.max_keys_per_node = Some(max_keys);
        }

        Ok(config)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a non-negative integer"),
        })
}
