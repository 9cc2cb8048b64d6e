//! Runtime configuration.
//!
//! Diagnostic switches mirror the classic `PRINT_*` environment options of
//! Objective-C runtimes: each one turns on an `info!` line for a class of
//! runtime events. They are read once when a runtime is built.
//!
//! # Example
//!
//! ```
//! use oxidec::config::RuntimeOptions;
//!
//! let options = RuntimeOptions::from_lookup(|key| match key {
//!     "OXIDEC_PRINT_INITIALIZE" => Some("YES".to_string()),
//!     "OXIDEC_CACHE_CAPACITY" => Some("10".to_string()),
//!     _ => None,
//! });
//!
//! assert!(options.print_initialize);
//! assert!(!options.print_images);
//! assert_eq!(options.initial_cache_capacity, 16);
//! ```

use log::info;

/// Smallest method cache a class can start with.
pub const MIN_CACHE_CAPACITY: usize = 4;

/// Largest starting method cache. Caches still grow past it on demand.
pub const MAX_CACHE_CAPACITY: usize = 1 << 16;

/// Environment variable names read by [`RuntimeOptions::from_env`].
pub mod env {
    /// Log every class initializer run.
    pub const PRINT_INITIALIZE: &str = "OXIDEC_PRINT_INITIALIZE";
    /// Log every resolver hook invocation.
    pub const PRINT_RESOLVED: &str = "OXIDEC_PRINT_RESOLVED";
    /// Log every method replacement.
    pub const PRINT_REPLACED: &str = "OXIDEC_PRINT_REPLACED";
    /// Log image loads and unloads.
    pub const PRINT_IMAGES: &str = "OXIDEC_PRINT_IMAGES";
    /// Log every bulk cache invalidation.
    pub const PRINT_CACHE_FLUSH: &str = "OXIDEC_PRINT_CACHE_FLUSH";
    /// Initial method cache capacity per class.
    pub const CACHE_CAPACITY: &str = "OXIDEC_CACHE_CAPACITY";
}

/// Diagnostic switches and tuning values for a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Log each class initializer as it runs.
    pub print_initialize: bool,
    /// Log each resolver hook invocation and whether it installed a method.
    pub print_resolved: bool,
    /// Log method replacements, including category shadowing.
    pub print_replaced: bool,
    /// Log image batches as they are loaded and unloaded.
    pub print_images: bool,
    /// Log every bulk cache invalidation.
    pub print_cache_flush: bool,
    /// Starting capacity of every class's method cache. Always a power of
    /// two between [`MIN_CACHE_CAPACITY`] and [`MAX_CACHE_CAPACITY`].
    pub initial_cache_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            print_initialize: false,
            print_resolved: false,
            print_replaced: false,
            print_images: false,
            print_cache_flush: false,
            initial_cache_capacity: MIN_CACHE_CAPACITY,
        }
    }
}

impl RuntimeOptions {
    /// Reads options from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads options through `lookup`, which maps a variable name to its
    /// value. Unset or unparsable values keep their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).is_some_and(|value| parse_flag(&value));
        let defaults = RuntimeOptions::default();

        RuntimeOptions {
            print_initialize: flag(env::PRINT_INITIALIZE),
            print_resolved: flag(env::PRINT_RESOLVED),
            print_replaced: flag(env::PRINT_REPLACED),
            print_images: flag(env::PRINT_IMAGES),
            print_cache_flush: flag(env::PRINT_CACHE_FLUSH),
            initial_cache_capacity: lookup(env::CACHE_CAPACITY)
                .and_then(|value| value.trim().parse::<usize>().ok())
                .map_or(defaults.initial_cache_capacity, normalize_capacity),
        }
    }

    /// Sets the initial cache capacity, normalized to a power of two
    /// between [`MIN_CACHE_CAPACITY`] and [`MAX_CACHE_CAPACITY`].
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.initial_cache_capacity = normalize_capacity(capacity);
        self
    }

    /// Logs every switch that is turned on.
    pub(crate) fn log_enabled(&self) {
        let switches = [
            (env::PRINT_INITIALIZE, self.print_initialize),
            (env::PRINT_RESOLVED, self.print_resolved),
            (env::PRINT_REPLACED, self.print_replaced),
            (env::PRINT_IMAGES, self.print_images),
            (env::PRINT_CACHE_FLUSH, self.print_cache_flush),
        ];

        for (name, _) in switches.iter().filter(|(_, on)| *on) {
            info!("{name} is set");
        }
        if self.initial_cache_capacity != MIN_CACHE_CAPACITY {
            info!(
                "{} is {}",
                env::CACHE_CAPACITY,
                self.initial_cache_capacity
            );
        }
    }
}

/// `YES`, `1` and `true` (any case) turn a switch on.
fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1"
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("true")
}

fn normalize_capacity(capacity: usize) -> usize {
    capacity
        .clamp(MIN_CACHE_CAPACITY, MAX_CACHE_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(MAX_CACHE_CAPACITY)
}
