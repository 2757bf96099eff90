//! Runtime configuration types.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::ImplicitChecks;
use crate::isa::{InstructionSet, InstructionSetFeatures};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no instruction set configured and the host is not supported")]
    UnknownInstructionSet,
}

/// GC mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Stop-the-world GC, no read barriers
    #[default]
    Stw,
    /// Concurrent copying GC (read barriers while marking)
    ConcurrentCopying,
}

impl GcMode {
    pub fn uses_read_barriers(self) -> bool {
        self == GcMode::ConcurrentCopying
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Target ISA; the host's when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_set: Option<InstructionSet>,
    pub gc_mode: GcMode,
    pub debuggable: bool,
    pub implicit_null_checks: bool,
    pub implicit_suspend_checks: bool,
    pub implicit_stack_overflow_checks: bool,
    /// Invocations before a native method gets a compiled stub
    pub jit_threshold: u32,
    pub trace_jit: bool,
    /// Serialized as the trailing `[features]` table
    pub features: InstructionSetFeatures,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instruction_set: None,
            gc_mode: GcMode::Stw,
            debuggable: false,
            implicit_null_checks: true,
            implicit_suspend_checks: false,
            implicit_stack_overflow_checks: true,
            jit_threshold: 1000,
            trace_jit: false,
            features: InstructionSetFeatures::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The configured ISA, falling back to the host.
    pub fn resolved_instruction_set(&self) -> Result<InstructionSet, ConfigError> {
        self.instruction_set
            .or_else(InstructionSet::runtime)
            .ok_or(ConfigError::UnknownInstructionSet)
    }

    /// Implicit checks compiled code may rely on. A debuggable runtime keeps
    /// every check explicit.
    pub fn implicit_checks(&self) -> ImplicitChecks {
        if self.debuggable {
            return ImplicitChecks { null: false, suspend: false, stack_overflow: false };
        }
        ImplicitChecks {
            null: self.implicit_null_checks,
            suspend: self.implicit_suspend_checks,
            stack_overflow: self.implicit_stack_overflow_checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_parse_full_document() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            instruction_set = "arm64"
            gc_mode = "concurrent_copying"
            implicit_suspend_checks = true
            jit_threshold = 10

            [features]
            has_lse_atomics = true
            "#,
        )
        .unwrap();
        assert_eq!(config.instruction_set, Some(InstructionSet::Arm64));
        assert!(config.gc_mode.uses_read_barriers());
        assert!(config.features.has_lse_atomics);
        assert_eq!(config.jit_threshold, 10);
        assert!(config.implicit_checks().suspend);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = RuntimeConfig::from_toml_str("gc = \"stw\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_debuggable_disables_implicit_checks() {
        let config = RuntimeConfig { debuggable: true, ..RuntimeConfig::default() };
        assert_eq!(
            config.implicit_checks(),
            ImplicitChecks { null: false, suspend: false, stack_overflow: false }
        );
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let config = RuntimeConfig {
            instruction_set: Some(InstructionSet::X86_64),
            trace_jit: true,
            ..RuntimeConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("instruction_set = \"x86_64\""));
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}
