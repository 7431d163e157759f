//! Runtime configuration.
//!
//! Compile-time defaults with environment overrides, resolved once at
//! first use.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. Library defaults

use std::sync::OnceLock;
use weft_core::env::env_get;

/// Compile-time defaults.
pub mod defaults {
    /// Usable stack size per fiber.
    pub const STACK_SIZE: usize = 128 * 1024;
    /// Default worker thread count when the caller passes 0.
    pub const NUM_WORKERS: usize = 1;
    /// Recycled default-size stacks kept around.
    pub const STACK_POOL_CAP: usize = 64;
    /// Upper bound on a single epoll_wait, so a missed tickle never
    /// stalls shutdown indefinitely.
    pub const MAX_EPOLL_TIMEOUT_MS: u64 = 3000;
    /// Worker park timeout when no reactor is attached.
    pub const PARK_TIMEOUT_MS: u64 = 100;
}

/// Resolved runtime configuration.
///
/// Environment variables (all optional):
/// - `WEFT_STACK_SIZE` - Usable stack bytes per fiber
/// - `WEFT_NUM_WORKERS` - Default worker thread count
/// - `WEFT_STACK_POOL_CAP` - Recycled stack pool capacity
/// - `WEFT_MAX_EPOLL_TIMEOUT_MS` - Cap on reactor wait
/// - `WEFT_PARK_TIMEOUT_MS` - Plain idler park timeout
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub stack_size: usize,
    pub num_workers: usize,
    pub stack_pool_cap: usize,
    pub max_epoll_timeout_ms: u64,
    pub park_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            num_workers: env_get("WEFT_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_pool_cap: env_get("WEFT_STACK_POOL_CAP", defaults::STACK_POOL_CAP),
            max_epoll_timeout_ms: env_get(
                "WEFT_MAX_EPOLL_TIMEOUT_MS",
                defaults::MAX_EPOLL_TIMEOUT_MS,
            ),
            park_timeout_ms: env_get("WEFT_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
        }
        .normalized()
    }

    /// Library defaults with no env override. Useful for tests.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            num_workers: defaults::NUM_WORKERS,
            stack_pool_cap: defaults::STACK_POOL_CAP,
            max_epoll_timeout_ms: defaults::MAX_EPOLL_TIMEOUT_MS,
            park_timeout_ms: defaults::PARK_TIMEOUT_MS,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_pool_cap(mut self, cap: usize) -> Self {
        self.stack_pool_cap = cap;
        self
    }

    pub fn max_epoll_timeout_ms(mut self, ms: u64) -> Self {
        self.max_epoll_timeout_ms = ms;
        self
    }

    pub fn park_timeout_ms(mut self, ms: u64) -> Self {
        self.park_timeout_ms = ms;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > 256 {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.stack_size % 4096 != 0 {
            return Err(ConfigError::InvalidValue(
                "stack_size must be page aligned",
            ));
        }
        if self.max_epoll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "max_epoll_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }

    /// Clamp values the rest of the runtime cannot tolerate.
    fn normalized(mut self) -> Self {
        // Stacks are mapped in whole pages; round up.
        const PAGE: usize = 4096;
        if self.stack_size < 4 * PAGE {
            self.stack_size = 4 * PAGE;
        }
        self.stack_size = (self.stack_size + PAGE - 1) & !(PAGE - 1);
        if self.num_workers == 0 {
            self.num_workers = 1;
        }
        if self.stack_pool_cap == 0 {
            self.stack_pool_cap = 1;
        }
        if self.max_epoll_timeout_ms == 0 {
            self.max_epoll_timeout_ms = 1;
        }
        self
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, resolved on first call.
pub fn runtime() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}
