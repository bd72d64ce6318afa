//! The compiler driver: flags, config assembly, and the ACME subprocess
//! invocation. The lexer, parser, and semantic analyzer are external
//! collaborators this crate does not implement, so this binary currently
//! drives the middle-to-back-end pipeline against a fixed demonstration
//! program (a border-color set) rather than a real front end; `file` is
//! accepted and threaded through as the diagnostics' source path so the CLI
//! surface and output plumbing are exercised the way they would be against
//! real input. Wiring a real front end only requires building a different
//! `(Program, CallGraph, ILModule)` triple and passing it to
//! `blend65::compile`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use clap::Parser;

use blend65::common::{intern, Span};
use blend65::config::{CompileConfig, DebugLevel, ExitCode, OptLevel, OutputFormat, Target};
use blend65::diagnostics::Code;
use blend65::front::ast::{Expr, FunctionDecl, Module, Program, Stmt, Type};
use blend65::middle::{BasicBlock, CallGraph, Function, ILInstruction, ILModule, Operand, Terminator};
use blend65::{compile, Cancellation, CompileOutput};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// source file to compile
    file: PathBuf,

    /// target platform
    #[arg(long, value_enum, default_value_t = Target::C64)]
    target: Target,

    /// optimizer pass set
    #[arg(short = 'O', long = "opt", value_enum, default_value_t = OptLevel::O1)]
    optimization: OptLevel,

    /// debug-info verbosity
    #[arg(long, value_enum, default_value_t = DebugLevel::None)]
    debug: DebugLevel,

    /// which artifacts to produce
    #[arg(long = "emit", value_enum, default_value_t = OutputFormat::Both)]
    output_format: OutputFormat,

    /// override the default load address ($0801)
    #[arg(long, default_value_t = 0x0801)]
    load_address: u16,

    /// skip the BASIC loader stub
    #[arg(long)]
    no_basic_stub: bool,

    /// promote warnings to errors
    #[arg(long)]
    strict: bool,

    /// path to the ACME executable
    #[arg(long, default_value = "acme")]
    acme: String,

    /// directory to write `.asm`/`.prg`/`.labels` into
    #[arg(short = 'd', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = CompileConfig {
        target: args.target,
        optimization: args.optimization,
        debug: args.debug,
        output_format: args.output_format,
        load_address: args.load_address,
        basic_stub: !args.no_basic_stub,
        strict: args.strict,
    };

    let (program, call_graph, il) = demo_program(&args.file);
    let output = compile(&program, &call_graph, il, &config, &Cancellation::new());

    for diagnostic in output.diagnostics.sorted() {
        eprintln!("{diagnostic}");
    }

    let exit = exit_code(&output);
    if exit != ExitCode::Success {
        std::process::exit(exit as i32);
    }

    let stem = args
        .file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out")
        .to_string();

    let Some(emitted) = &output.emitted else {
        return Ok(());
    };

    let asm_path = args.out_dir.join(format!("{stem}.asm"));
    if config.output_format.wants_asm() {
        fs::write(&asm_path, &emitted.text)
            .with_context(|| format!("writing {}", asm_path.display()))?;
    }

    let labels_path = args.out_dir.join(format!("{stem}.labels"));
    if config.debug.wants_vice_labels() {
        let labels = blend65::back::emitter::emit_vice_labels(emitted);
        fs::write(&labels_path, labels)
            .with_context(|| format!("writing {}", labels_path.display()))?;
    }

    if config.output_format.wants_prg() {
        let prg_path = args.out_dir.join(format!("{stem}.prg"));
        match invoke_acme(&args.acme, &asm_path, &prg_path, config.debug.wants_vice_labels(), &labels_path)? {
            AcmeOutcome::Produced => {}
            AcmeOutcome::NotFound => {
                eprintln!("warning: `{}` not found on PATH; .prg not produced", args.acme);
            }
            AcmeOutcome::Failed(status) => {
                eprintln!("error[ACME_SUBPROCESS_FAILED]: acme exited with {status}");
                std::process::exit(ExitCode::AcmeFailed as i32);
            }
        }
    }

    Ok(())
}

/// Maps the pipeline's accumulated diagnostics onto a process exit code.
/// The core never calls `std::process::exit` itself; only this binary
/// does.
fn exit_code(output: &CompileOutput) -> ExitCode {
    if output
        .diagnostics
        .iter()
        .any(|d| d.code == Code::ConfigUnknownTarget)
    {
        ExitCode::ConfigurationError
    } else if !output.success() {
        ExitCode::CompilationError
    } else {
        ExitCode::Success
    }
}

enum AcmeOutcome {
    Produced,
    NotFound,
    Failed(ExitStatus),
}

/// Invokes the external ACME assembler: `acme -f cbm -o <out>.prg
/// <in>.asm`, plus `-l <labels>` when VICE labels were requested. A missing
/// executable is reported as `NotFound`, not an error — a build should warn
/// and skip the `.prg`, not fail outright, when the assembler isn't on
/// PATH.
fn invoke_acme(acme: &str, asm_path: &Path, prg_path: &Path, with_labels: bool, labels_path: &Path) -> Result<AcmeOutcome> {
    let mut cmd = Command::new(acme);
    cmd.args(["-f", "cbm", "-o"]).arg(prg_path).arg(asm_path);
    if with_labels {
        cmd.arg("-l").arg(labels_path);
    }

    match cmd.status() {
        Ok(status) if status.success() => Ok(AcmeOutcome::Produced),
        Ok(status) => Ok(AcmeOutcome::Failed(status)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AcmeOutcome::NotFound),
        Err(e) => Err(e).context("failed to launch acme"),
    }
}

/// Builds the border-color-set demonstration program as a stand-in for a
/// real front end's output.
fn demo_program(file: &Path) -> (Program, CallGraph, ILModule) {
    let span = Span::new(intern(&file.display().to_string()), 1, 1, 0);

    let main = FunctionDecl {
        name: intern("main"),
        exported: true,
        is_callback: false,
        params: Vec::new(),
        return_type: Type::Void,
        body: vec![Stmt::ExprStmt(Expr::Call(
            intern("poke"),
            vec![Expr::Const(0xD020), Expr::Const(5)],
        ))],
        span,
    };
    let program = Program {
        modules: vec![Module {
            qualified_name: intern("Demo"),
            imports: Vec::new(),
            exports: vec![intern("main")],
            globals: Vec::new(),
            functions: vec![main],
        }],
    };
    let call_graph = CallGraph::from_program(&program);

    let mut function = Function::new(intern("main"), Vec::new(), Type::Void);
    let mut block = BasicBlock::new(intern("main"), Terminator::Return(None));
    block.instructions.push(ILInstruction::Poke {
        addr: Operand::Const(0xD020),
        value: Operand::Const(5),
        span,
    });
    function.blocks.push(block);

    let mut il = ILModule::new();
    il.functions.insert(intern("main"), function);
    il.entry = Some(intern("main"));

    (program, call_graph, il)
}
