//! The `chem` compiler driver: ties the import graph, front end, resolver
//! and the two back-ends together behind the CLI.

mod cli;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cli::{Cli, Commands};
use log::{error, info, warn};

use chemical::processor::{ASTProcessor, Compilation, ProcessorOptions};
use chemical::Diagnostics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Object,
    Assembly,
    TextualIr,
    Bitcode,
    CTranslation,
    RoundTrip,
    Binary,
}

fn job_kind(path: &Path) -> JobKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("o") => JobKind::Object,
        Some("s") => JobKind::Assembly,
        Some("ll") => JobKind::TextualIr,
        Some("bc") => JobKind::Bitcode,
        Some("c") => JobKind::CTranslation,
        Some("ch") => JobKind::RoundTrip,
        _ => JobKind::Binary,
    }
}

fn main() -> ExitCode {
    let args = Cli::init();

    let level = if args.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).unwrap();

    if let Some(command) = &args.command {
        let surface = match command {
            Commands::Cc { .. } => "cc",
            Commands::Ar { .. } => "ar",
            Commands::Configure { .. } => "configure",
            Commands::Linker { .. } => "linker",
        };
        warn!("'{surface}' is reserved for native toolchain passthrough");
        return ExitCode::SUCCESS;
    }

    if args.verbose {
        info!("chem {}", env!("CARGO_PKG_VERSION"));
        if let Some(target) = &args.target {
            info!("target triple: {target}");
        }
        info!("resources: {}", resources_dir(&args).display());
    }

    let root = match pick_root(&args) {
        Some(root) => root,
        None => {
            error!("no .ch source input given");
            return ExitCode::FAILURE;
        }
    };

    let options = ProcessorOptions {
        benchmark: args.benchmark,
        print_cst: args.print_cst,
        print_ast: args.print_ast,
        print_ig: args.print_ig,
        verbose: args.verbose,
    };
    let mut processor = ASTProcessor::new(options);
    let compilation = match processor.compile_root(&root) {
        Ok(compilation) => compilation,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    print_diagnostics(&compilation.diagnostics);
    if !compilation.success() {
        return ExitCode::FAILURE;
    }

    match run_jobs(&args, &compilation) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Resources directory: `--res` when given, else a fixed path relative to
/// the executable.
fn resources_dir(args: &Cli) -> PathBuf {
    if let Some(res) = &args.res {
        return res.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("resources")))
        .unwrap_or_else(|| PathBuf::from("resources"))
}

fn pick_root(args: &Cli) -> Option<PathBuf> {
    for input in &args.inputs {
        let extension = input.extension().and_then(|e| e.to_str());
        match extension {
            Some("ch") => return Some(input.clone()),
            Some("lab") => {
                warn!("build descriptors are handled by the lab collaborator; skipping");
            }
            Some("c") | Some("o") => {
                warn!("{} is forwarded to the native toolchain", input.display());
            }
            _ if args.ignore_extension => return Some(input.clone()),
            _ => {}
        }
    }
    None
}

fn run_jobs(args: &Cli, compilation: &Compilation) -> anyhow::Result<()> {
    let mut did_anything = false;

    if let Some(path) = &args.out_ll {
        write_ir(compilation, path)?;
        did_anything = true;
    }
    for (channel, path) in [
        ("bitcode", &args.out_bc),
        ("object", &args.out_obj),
        ("assembly", &args.out_asm),
        ("binary", &args.out_bin),
    ] {
        if path.is_some() {
            anyhow::bail!("the {channel} channel needs the LLVM back-end, which is not built in");
        }
    }

    if let Some(output) = &args.output {
        match job_kind(output) {
            JobKind::CTranslation => write_c(compilation, output)?,
            JobKind::TextualIr => write_ir(compilation, output)?,
            JobKind::RoundTrip => {
                anyhow::bail!("round-trip translation is not implemented for this target")
            }
            JobKind::Object | JobKind::Assembly | JobKind::Bitcode | JobKind::Binary => {
                anyhow::bail!(
                    "emitting {:?} needs the LLVM back-end, which is not built in",
                    job_kind(output)
                )
            }
        }
        did_anything = true;
    }

    if !did_anything {
        info!("nothing to emit; pass -o or an --out-* channel");
    }
    Ok(())
}

fn write_c(compilation: &Compilation, path: &Path) -> anyhow::Result<()> {
    let (text, diagnostics) = compilation.to_c();
    print_diagnostics(&diagnostics);
    if diagnostics.has_errors() {
        anyhow::bail!("the C translation failed");
    }
    fs::write(path, text)?;
    info!("wrote {}", path.display());
    Ok(())
}

fn write_ir(compilation: &Compilation, path: &Path) -> anyhow::Result<()> {
    let (text, diagnostics) = compilation.to_ir();
    print_diagnostics(&diagnostics);
    if diagnostics.has_errors() {
        anyhow::bail!("IR emission failed");
    }
    fs::write(path, text)?;
    info!("wrote {}", path.display());
    Ok(())
}

fn print_diagnostics(diagnostics: &Diagnostics) {
    for diagnostic in diagnostics.iter() {
        eprintln!("{}", diagnostic.ansi());
    }
}
