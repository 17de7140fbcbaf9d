//! Scheduler configuration.
//!
//! All tunables are carried in one explicit [`SchedulerConfig`] value that is
//! passed into the scheduling entry point; the library never consults global
//! state. Tools and demos may load a config from a TOML file with environment
//! overrides:
//!
//! 1. Environment variables (`SYNCPLAN_BARRIERS`, `SYNCPLAN_WLM`, ...)
//! 2. Project-local config file (`./syncplan.toml`)
//! 3. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # syncplan.toml
//!
//! # Physical barrier pool size of the target generation
//! physical_barriers = 16
//!
//! # Hardware register-width limit on producer signals per barrier
//! max_producers_per_barrier = 255
//!
//! # Workload-management mode (explicit completion signal on every queue)
//! wlm = false
//! ```

use serde::Deserialize;
use std::path::Path;

/// Default physical barrier pool size.
///
/// Matches the common per-generation semaphore count; override per target.
pub const DEFAULT_PHYSICAL_BARRIERS: usize = 16;

/// Default hardware limit on producer signals per barrier.
///
/// The producer counter is an 8-bit hardware register.
pub const DEFAULT_MAX_PRODUCERS: u32 = 255;

/// Default cap on legalizer fixpoint iterations.
pub const DEFAULT_LEGALIZE_CAP: u32 = 1024;

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of physical barrier slots available on the target (`N`).
    pub physical_barriers: usize,

    /// Hardware limit on the summed producer signal count per barrier.
    pub max_producers_per_barrier: u32,

    /// Workload-management mode: every queue must emit an explicit,
    /// detectable completion signal, and the legalizers budget one slot of
    /// headroom for the completion barrier.
    pub wlm: bool,

    /// Optional override for the live-barrier budget the legalizers aim for.
    /// When unset the budget is derived from `physical_barriers` (and `wlm`).
    pub virtual_barrier_threshold: Option<usize>,

    /// Hard cap on legalizer fixpoint iterations. Exceeding the cap is a
    /// fatal compiler error, never a silent fallback.
    pub legalize_iteration_cap: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            physical_barriers: DEFAULT_PHYSICAL_BARRIERS,
            max_producers_per_barrier: DEFAULT_MAX_PRODUCERS,
            wlm: false,
            virtual_barrier_threshold: None,
            legalize_iteration_cap: DEFAULT_LEGALIZE_CAP,
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration for a given physical pool size, with all other
    /// fields at their defaults.
    pub fn with_pool(physical_barriers: usize) -> Self {
        Self {
            physical_barriers,
            ..Default::default()
        }
    }

    /// Live-barrier budget the legalizers aim for.
    ///
    /// The explicit threshold override wins when set; otherwise WLM mode
    /// reserves one slot of headroom for the completion barrier. The budget
    /// never exceeds the physical pool and is never zero.
    pub fn slot_budget(&self) -> usize {
        let derived = if self.wlm {
            self.physical_barriers.saturating_sub(1)
        } else {
            self.physical_barriers
        };
        let budget = self.virtual_barrier_threshold.unwrap_or(derived);
        budget.min(self.physical_barriers).max(1)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// Load configuration for tools: project-local `syncplan.toml` if present,
    /// then environment overrides, then defaults.
    pub fn load() -> Self {
        let mut config = if Path::new("syncplan.toml").exists() {
            match Self::from_toml_file("syncplan.toml") {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("ignoring syncplan.toml: {}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        log::debug!("loaded scheduler configuration: {:?}", config);
        config
    }

    /// Apply environment-variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse::<usize>("SYNCPLAN_BARRIERS") {
            self.physical_barriers = n;
        }
        if let Some(n) = env_parse::<u32>("SYNCPLAN_MAX_PRODUCERS") {
            self.max_producers_per_barrier = n;
        }
        if let Some(v) = std::env::var_os("SYNCPLAN_WLM") {
            self.wlm = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(n) = env_parse::<usize>("SYNCPLAN_VIRTUAL_THRESHOLD") {
            self.virtual_barrier_threshold = Some(n);
        }
        if let Some(n) = env_parse::<u32>("SYNCPLAN_LEGALIZE_CAP") {
            self.legalize_iteration_cap = n;
        }
    }
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Config file is not valid TOML.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparsable {}={}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.physical_barriers, DEFAULT_PHYSICAL_BARRIERS);
        assert_eq!(config.max_producers_per_barrier, DEFAULT_MAX_PRODUCERS);
        assert!(!config.wlm);
        assert_eq!(config.virtual_barrier_threshold, None);
    }

    #[test]
    fn test_slot_budget() {
        let mut config = SchedulerConfig::with_pool(8);
        assert_eq!(config.slot_budget(), 8);

        // WLM reserves headroom for the completion barrier
        config.wlm = true;
        assert_eq!(config.slot_budget(), 7);

        // Explicit threshold wins, but is clamped to the pool
        config.virtual_barrier_threshold = Some(4);
        assert_eq!(config.slot_budget(), 4);
        config.virtual_barrier_threshold = Some(64);
        assert_eq!(config.slot_budget(), 8);
    }

    #[test]
    fn test_budget_never_zero() {
        let mut config = SchedulerConfig::with_pool(1);
        config.wlm = true;
        assert_eq!(config.slot_budget(), 1);
    }

    #[test]
    fn test_toml_parse() {
        let config: SchedulerConfig = toml::from_str(
            r#"
            physical_barriers = 32
            wlm = true
            "#,
        )
        .unwrap();
        assert_eq!(config.physical_barriers, 32);
        assert!(config.wlm);
        // Unlisted fields fall back to defaults
        assert_eq!(config.max_producers_per_barrier, DEFAULT_MAX_PRODUCERS);
    }
}
