//! CLI argument surface for the `chem` compiler driver.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compiler for the Chemical programming language")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Input files; the kind is inferred from the extension (.ch source,
    /// .c C source, .o object, .lab build descriptor).
    #[arg(index = 1)]
    pub inputs: Vec<PathBuf>,

    /// Output path; the extension chooses the job kind (.o object, .s
    /// assembly, .ll textual IR, .bc bitcode, .c C translation, .ch
    /// round-trip translation, otherwise binary).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Optimisation mode.
    #[arg(long, value_enum, default_value_t = Mode::Debug)]
    pub mode: Mode,

    /// Force the textual-IR output channel.
    #[arg(long = "out-ll")]
    pub out_ll: Option<PathBuf>,

    /// Force the bitcode output channel.
    #[arg(long = "out-bc")]
    pub out_bc: Option<PathBuf>,

    /// Force the object output channel.
    #[arg(long = "out-obj")]
    pub out_obj: Option<PathBuf>,

    /// Force the assembly output channel.
    #[arg(long = "out-asm")]
    pub out_asm: Option<PathBuf>,

    /// Force the binary output channel.
    #[arg(long = "out-bin")]
    pub out_bin: Option<PathBuf>,

    /// Compile only, do not link.
    #[arg(short = 'c')]
    pub compile_only: bool,

    #[arg(long)]
    pub lto: bool,

    #[arg(long)]
    pub assertions: bool,

    /// Print the IR of each function as it is emitted.
    #[arg(long = "debug-ir")]
    pub debug_ir: bool,

    #[arg(long = "no-cbi")]
    pub no_cbi: bool,

    #[arg(long = "cpp-like")]
    pub cpp_like: bool,

    /// Compile inputs regardless of their extension.
    #[arg(long = "ignore-extension")]
    pub ignore_extension: bool,

    #[arg(long)]
    pub jit: bool,

    /// Resources directory; defaults to a path relative to the executable.
    #[arg(long)]
    pub res: Option<PathBuf>,

    /// Target triple (honoured when the LLVM back-end is built in).
    #[arg(long)]
    pub target: Option<String>,

    #[arg(long)]
    pub benchmark: bool,

    #[arg(long = "print-ast")]
    pub print_ast: bool,

    #[arg(long = "print-cst")]
    pub print_cst: bool,

    #[arg(long = "print-ig")]
    pub print_ig: bool,

    #[arg(long)]
    pub verbose: bool,

    /// Context arguments collected from `--arg-<name> <value>` pairs and
    /// forwarded to a build descriptor.
    #[clap(skip)]
    pub build_args: HashMap<String, String>,
}

impl Cli {
    /// Parse, extracting `--arg-<name> <value>` pairs before clap sees the
    /// remaining arguments.
    pub fn init() -> Self {
        let mut build_args = HashMap::new();
        let mut filtered = vec![];
        let mut args = std::env::args().peekable();
        while let Some(arg) = args.next() {
            if let Some(name) = arg.strip_prefix("--arg-") {
                if let Some(value) = args.next() {
                    build_args.insert(name.to_string(), value);
                }
                continue;
            }
            filtered.push(arg);
        }
        let mut cli = Cli::parse_from(filtered);
        cli.build_args = build_args;
        cli
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Debug,
    DebugQuick,
    Release,
    ReleaseFast,
    ReleaseSmall,
}

/// Native toolchain passthrough surfaces, reserved.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Invoke the bundled C compiler (reserved).
    Cc { args: Vec<String> },
    /// Invoke the bundled archiver (reserved).
    Ar { args: Vec<String> },
    /// Configure a build descriptor (reserved).
    Configure { args: Vec<String> },
    /// Invoke the linker (reserved).
    Linker { args: Vec<String> },
}
