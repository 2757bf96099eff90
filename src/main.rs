use clap::{Args, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use jnibridge::compiler::{Compiler, JniStubCompiler};
use jnibridge::config::{GcMode, RuntimeConfig};
use jnibridge::fault::x86;
use jnibridge::isa::{InstructionSet, InstructionSetFeatures};
use jnibridge::jni::calling_convention::JniKind;
use jnibridge::logging;
use jnibridge::runtime::entrypoints::{
    is_usable_mark_slot, mark_slot_register, read_barrier_mark_offset,
    update_read_barrier_entrypoints, READ_BARRIER_MARK_SLOTS,
};
use jnibridge::runtime::method::access_flags;
use jnibridge::runtime::{QuickEntryPoints, ThreadList};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum KindArg {
    #[default]
    Normal,
    Fast,
    Critical,
}

impl From<KindArg> for JniKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Normal => JniKind::Normal,
            KindArg::Fast => JniKind::Fast,
            KindArg::Critical => JniKind::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GcModeArg {
    Stw,
    ConcurrentCopying,
}

impl From<GcModeArg> for GcMode {
    fn from(arg: GcModeArg) -> Self {
        match arg {
            GcModeArg::Stw => GcMode::Stw,
            GcModeArg::ConcurrentCopying => GcMode::ConcurrentCopying,
        }
    }
}

#[derive(Parser)]
#[command(name = "jnibridge")]
#[command(about = "JNI stub generation and runtime bridge tooling", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Configuration file plus per-field overrides.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target instruction set (arm, arm64, x86, x86_64, riscv64)
    #[arg(long, value_parser = parse_isa)]
    isa: Option<InstructionSet>,

    /// ISA feature string, e.g. "lse" or "avx2"
    #[arg(long)]
    features: Option<String>,

    /// GC mode
    #[arg(long, value_enum)]
    gc_mode: Option<GcModeArg>,

    /// Keep every runtime check explicit
    #[arg(long)]
    debuggable: bool,

    /// Invocations before a native method is compiled
    #[arg(long)]
    jit_threshold: Option<u32>,

    /// Trace JIT compilation events
    #[arg(long)]
    trace_jit: bool,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<RuntimeConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(isa) = self.isa {
            config.instruction_set = Some(isa);
        }
        if let Some(features) = &self.features {
            let isa = config.resolved_instruction_set()?;
            config.features = InstructionSetFeatures::from_variant_string(isa, features)?;
        }
        if let Some(gc_mode) = self.gc_mode {
            config.gc_mode = gc_mode.into();
        }
        if let Some(threshold) = self.jit_threshold {
            config.jit_threshold = threshold;
        }
        config.debuggable |= self.debuggable;
        config.trace_jit |= self.trace_jit;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the JNI stub for a method shorty, e.g. "ILJ"
    Stub {
        shorty: String,

        /// Native method flavor
        #[arg(long, value_enum, default_value = "normal")]
        kind: KindArg,

        /// Compile for a static method
        #[arg(long = "static")]
        is_static: bool,

        /// Print the stub as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Dump the read-barrier mark entrypoints of a fresh table as JSON
    Entrypoints {
        /// Install the mark routines, as while the GC is marking
        #[arg(long)]
        read_barrier: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Length of the x86 instruction encoded by a hex string
    Decode {
        /// Instruction bytes, e.g. "8b 40 08"
        hex: String,

        /// Decode as 32-bit x86
        #[arg(long = "32bit")]
        is_32bit: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn parse_isa(s: &str) -> Result<InstructionSet, String> {
    s.parse()
}

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn run_stub(
    shorty: &str,
    kind: KindArg,
    is_static: bool,
    json: bool,
    args: &ConfigArgs,
) -> Result<(), Box<dyn Error>> {
    let config = args.resolve()?;
    let compiler = JniStubCompiler::from_config(&config)?;
    let mut flags = access_flags::NATIVE;
    if is_static {
        flags |= access_flags::STATIC;
    }
    match JniKind::from(kind) {
        JniKind::Normal => {}
        JniKind::Fast => flags |= access_flags::FAST_NATIVE,
        JniKind::Critical => flags |= access_flags::CRITICAL_NATIVE,
    }
    let stub = compiler.jni_compile(flags, shorty)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stub)?);
        return Ok(());
    }
    println!(
        "{} {} ({:?}{}): frame {} bytes, out args {} bytes, code {} bytes",
        stub.isa,
        stub.shorty,
        stub.kind,
        if stub.is_static { ", static" } else { "" },
        stub.frame_size,
        stub.out_args_size,
        stub.code.len()
    );
    for (i, line) in stub.code.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:04x}: {}", i * 16, bytes.join(" "));
    }
    Ok(())
}

fn run_entrypoints(read_barrier: bool, args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let config = args.resolve()?;
    let isa = config.resolved_instruction_set()?;
    let active = read_barrier || config.gc_mode.uses_read_barriers();

    let table = QuickEntryPoints::new(isa);
    let threads = ThreadList::new(isa);
    {
        let guard = threads.suspend_all("entrypoint dump");
        update_read_barrier_entrypoints(&table, isa, active, guard.mutators_suspended());
    }

    let slots: Vec<serde_json::Value> = (0..READ_BARRIER_MARK_SLOTS)
        .map(|slot| {
            serde_json::json!({
                "slot": slot,
                "register": mark_slot_register(isa, slot),
                "usable": is_usable_mark_slot(isa, slot),
                "offset": read_barrier_mark_offset(isa.pointer_size(), slot).value(),
                "entrypoint": format!("{:#x}", table.read_barrier_mark(slot)),
            })
        })
        .collect();
    let dump = serde_json::json!({
        "isa": isa,
        "read_barrier": active,
        "slots": slots,
    });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}

fn run_decode(hex: &str, is_32bit: bool) -> Result<(), Box<dyn Error>> {
    let code = parse_hex(hex)?;
    match x86::instruction_size(&code, !is_32bit) {
        0 => Err(format!("unrecognized or truncated instruction '{}'", hex).into()),
        size => {
            println!("{}", size);
            Ok(())
        }
    }
}

fn run_config(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let config = args.resolve()?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    if let Err(e) = logging::init(level) {
        eprintln!("error: failed to initialize logging: {}", e);
    }

    let result = match &cli.command {
        Commands::Stub {
            shorty,
            kind,
            is_static,
            json,
            config,
        } => run_stub(shorty, *kind, *is_static, *json, config),
        Commands::Entrypoints { read_barrier, config } => run_entrypoints(*read_barrier, config),
        Commands::Decode { hex, is_32bit } => run_decode(hex, *is_32bit),
        Commands::Config { config } => run_config(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("8b 40 08").unwrap(), vec![0x8b, 0x40, 0x08]);
        assert_eq!(parse_hex("C7000100").unwrap(), vec![0xc7, 0x00, 0x01, 0x00]);
        assert!(parse_hex("8").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_cli_overrides_apply() {
        let cli = Cli::parse_from([
            "jnibridge",
            "config",
            "--isa",
            "arm64",
            "--gc-mode",
            "concurrent-copying",
            "--jit-threshold",
            "5",
        ]);
        let Commands::Config { config } = cli.command else {
            panic!("expected config subcommand");
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.instruction_set, Some(InstructionSet::Arm64));
        assert_eq!(resolved.gc_mode, GcMode::ConcurrentCopying);
        assert_eq!(resolved.jit_threshold, 5);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
