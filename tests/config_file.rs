//! Loading runtime configuration from disk.

use std::io::Write;

use jnibridge::compiler::{Compiler, JniStubCompiler};
use jnibridge::config::{ConfigError, GcMode, RuntimeConfig};
use jnibridge::fault::ImplicitChecks;
use jnibridge::isa::InstructionSet;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
instruction_set = "x86_64"
gc_mode = "concurrent_copying"
implicit_null_checks = false
jit_threshold = 50

[features]
has_avx2 = true
"#
    )
    .unwrap();

    let config = RuntimeConfig::load(file.path()).unwrap();
    assert_eq!(config.resolved_instruction_set().unwrap(), InstructionSet::X86_64);
    assert_eq!(config.gc_mode, GcMode::ConcurrentCopying);
    assert!(config.features.has_avx2);
    assert_eq!(
        config.implicit_checks(),
        ImplicitChecks { null: false, suspend: false, stack_overflow: true }
    );

    let compiler = JniStubCompiler::from_config(&config).unwrap();
    assert_eq!(compiler.instruction_set(), InstructionSet::X86_64);
    assert!(compiler.is_hot(50));
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    match RuntimeConfig::load(&path) {
        Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_saved_config_loads_back() {
    let config = RuntimeConfig {
        instruction_set: Some(InstructionSet::Arm64),
        debuggable: true,
        ..RuntimeConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.toml");
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
    assert_eq!(RuntimeConfig::load(&path).unwrap(), config);
}
