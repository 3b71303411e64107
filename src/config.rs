//! Process-wide init-time configuration (§6, §9.4).
//!
//! Allocator backend selection and debug-logging gate. Both are init-time
//! decisions: the allocator backend cannot be changed after [`RuntimeConfig::init`]
//! runs (§6 "once set, it cannot be changed").

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorBackend {
    Malloc,
    Arena,
}

impl AllocatorBackend {
    fn from_env() -> Self {
        match std::env::var("CATZILLA_ALLOCATOR").as_deref() {
            Ok("ARENA") => AllocatorBackend::Arena,
            _ => AllocatorBackend::Malloc,
        }
    }
}

pub struct RuntimeConfig {
    pub allocator: AllocatorBackend,
    pub debug_logging: bool,
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// `CATZILLA_C_DEBUG` raises verbosity when set to anything other than `0` or
/// `false` (case-insensitively) — set but empty, or any other value, counts as on
/// (§9.2).
fn debug_logging_enabled() -> bool {
    match std::env::var("CATZILLA_C_DEBUG") {
        Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false"),
        Err(_) => false,
    }
}

impl RuntimeConfig {
    /// Resolve configuration from the environment exactly once per process.
    /// Subsequent calls return the config established on the first call,
    /// matching the "cannot be changed" allocator-selection invariant.
    pub fn init() -> &'static RuntimeConfig {
        RUNTIME_CONFIG.get_or_init(|| RuntimeConfig {
            allocator: AllocatorBackend::from_env(),
            debug_logging: debug_logging_enabled(),
        })
    }

    /// Test-only override, bypassing the environment. Panics if the global config
    /// has already been initialized by a prior call in the same process.
    #[cfg(test)]
    pub fn init_for_test(allocator: AllocatorBackend, debug_logging: bool) -> &'static RuntimeConfig {
        RUNTIME_CONFIG.get_or_init(|| RuntimeConfig {
            allocator,
            debug_logging,
        })
    }
}

/// Install a `tracing-subscriber` `EnvFilter` subscriber, raising the default
/// level to `debug` when `CATZILLA_C_DEBUG` is set (§9.2).
pub fn init_logging() {
    let config = RuntimeConfig::init();
    let default_directive = if config.debug_logging { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
