//! Machine configuration
//!
//! Every table is `serde`-friendly with defaults for missing fields, so an
//! embedder can keep a partial JSON file and only override what it needs.

use core_types::MemoryModelKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kernel generation being emulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Personality {
    /// The legacy kernel: capability enforcement is bypassed
    Eka1,
    #[default]
    Eka2,
}

impl Personality {
    pub fn is_eka1(&self) -> bool {
        matches!(self, Personality::Eka1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Record a [`ScheduleEvent`](crate::scheduler::ScheduleEvent) for every transition
    pub audit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub personality: Personality,
    pub memory_model: MemoryModelKind,
    /// Disables capability and policy checks
    ///
    /// When unset, the bypass follows the personality.
    pub security_bypass: Option<bool>,
    pub scheduler: SchedulerConfig,
}

impl KernelConfig {
    pub fn for_personality(personality: Personality) -> Self {
        Self {
            personality,
            ..Default::default()
        }
    }

    pub fn with_memory_model(mut self, model: MemoryModelKind) -> Self {
        self.memory_model = model;
        self
    }

    pub fn with_audit(mut self, audit: bool) -> Self {
        self.scheduler.audit = audit;
        self
    }

    /// Whether capability checks are skipped
    pub fn security_bypass(&self) -> bool {
        self.security_bypass
            .unwrap_or_else(|| self.personality.is_eka1())
    }

    /// Whether fixed regions use the legacy memory map
    pub fn eka1_memory_map(&self) -> bool {
        self.personality.is_eka1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Cycles granted to the CPU backend per loop iteration
    pub slice_ticks: u64,
    /// Ticks added by an iteration with nothing to run
    pub idle_ticks: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            slice_ticks: 5000,
            idle_ticks: 1000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub kernel: KernelConfig,
    pub timing: TimingConfig,
}

impl SystemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.slice_ticks == 0 {
            return Err(ConfigError::Invalid("slice_ticks must be non-zero".into()));
        }
        if self.timing.idle_ticks == 0 {
            return Err(ConfigError::Invalid("idle_ticks must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_follows_personality() {
        assert!(KernelConfig::for_personality(Personality::Eka1).security_bypass());
        assert!(!KernelConfig::for_personality(Personality::Eka2).security_bypass());
    }

    #[test]
    fn test_explicit_bypass_wins() {
        let mut config = KernelConfig::for_personality(Personality::Eka1);
        config.security_bypass = Some(false);
        assert!(!config.security_bypass());
    }

    #[test]
    fn test_partial_json() {
        let config =
            SystemConfig::from_json(r#"{ "kernel": { "personality": "Eka1" } }"#).unwrap();
        assert_eq!(config.kernel.personality, Personality::Eka1);
        assert_eq!(config.kernel.memory_model, MemoryModelKind::Multiple);
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = SystemConfig::new();
        config.kernel.memory_model = MemoryModelKind::Flexible;
        config.timing.slice_ticks = 64;

        let text = config.to_json().unwrap();
        assert_eq!(SystemConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_zero_slice() {
        let err = SystemConfig::from_json(r#"{ "timing": { "slice_ticks": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SystemConfig::from_json("{ kernel"),
            Err(ConfigError::Parse(_))
        ));
    }
}
