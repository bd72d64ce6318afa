//! This is the compiler as a library.  See `src/bin` directory for the
//! executable programs using this library.
//!
//! `compile()` is the single pipeline entry point: it wires the frame
//! allocator, IL optimizer, code generator, ASM optimizer, and ACME emitter
//! into one fixed phase order. Everything upstream of the frame allocator —
//! lexer, parser, semantic analyzer, IL generator — is an external
//! collaborator; `compile()` takes their output (`Program`, `CallGraph`,
//! `ILModule`) as input rather than producing it.

// Because this is a library, allow dead code to make in-class exercises easier
// to develop.
#![allow(dead_code)]

pub mod back;
pub mod common;
pub mod config;
pub mod diagnostics;
pub mod frame;
pub mod front;
pub mod middle;

use common::{Id, Map};
use config::{CompileConfig, PlatformConfig};
use diagnostics::{Code, Diagnostics};
use front::ast::Program;
use middle::{CallGraph, ILModule};

/// Per-function compilation state. Transitions are monotonic: a function
/// that reaches `Failed` is skipped by every later phase but keeps the
/// diagnostics it already produced.
///
/// Tracked here at whole-phase granularity rather than re-deriving which
/// individual function a phase failure belongs to: the frame allocator and
/// code generator already attribute their own diagnostics to a span, so a
/// coarser state here doesn't lose information, it just doesn't duplicate
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FunctionState {
    Unstarted,
    Framed,
    Iled,
    Optimized,
    Lowered,
    Emitted,
    Failed,
}

fn initial_states(call_graph: &CallGraph) -> Map<Id, FunctionState> {
    call_graph
        .functions()
        .into_iter()
        .map(|name| (name, FunctionState::Unstarted))
        .collect()
}

fn advance_all(states: &mut Map<Id, FunctionState>, from: FunctionState, to: FunctionState) {
    for state in states.values_mut() {
        if *state == from {
            *state = to;
        }
    }
}

fn fail_all(states: &mut Map<Id, FunctionState>) {
    for state in states.values_mut() {
        if *state != FunctionState::Failed {
            *state = FunctionState::Failed;
        }
    }
}

/// A cheap cooperative-cancellation handle: phases check this between
/// functions, they never poll a clock or spawn a watchdog.
#[derive(Clone, Default)]
pub struct Cancellation(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Everything one `compile()` run produces: a pure function from
/// (sources, config) to (frames, asm, diagnostics, optional emitted text).
/// The `.prg` itself is produced by the CLI shelling out to ACME on
/// `emitted.text`, not by this crate.
pub struct CompileOutput {
    pub frames: Option<frame::FrameMap>,
    pub asm: Option<back::asm::AsmModule>,
    pub emitted: Option<back::emitter::EmitResult>,
    pub function_states: Map<Id, FunctionState>,
    pub diagnostics: Diagnostics,
}

impl CompileOutput {
    fn failed(function_states: Map<Id, FunctionState>, diagnostics: Diagnostics) -> Self {
        CompileOutput {
            frames: None,
            asm: None,
            emitted: None,
            function_states,
            diagnostics,
        }
    }

    /// Whether the run produced no errors (warnings are fine unless
    /// `strict` already promoted them).
    pub fn success(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

/// Runs the full middle-to-back-end pipeline over an already-generated IL
/// module:
///
/// 1. Frame allocation (`frame::allocate`) against `program`/`call_graph`.
/// 2. The IL optimizer (`middle::optimize`), fixed point, in place.
/// 3. Code generation (`back::generate`) against the placed frames.
/// 4. The ASM optimizer (`back::asm_opt::optimize`), fixed point, in place.
/// 5. The ACME emitter (`back::emitter::emit`) to textual assembly.
///
/// A phase that reports a fatal diagnostic short-circuits the rest of the
/// pipeline; diagnostics already collected are still returned.
pub fn compile(
    program: &Program,
    call_graph: &CallGraph,
    mut il_module: ILModule,
    config: &CompileConfig,
    cancellation: &Cancellation,
) -> CompileOutput {
    let mut diagnostics = Diagnostics::new();
    let mut states = initial_states(call_graph);

    let Some(platform) = PlatformConfig::for_target(config.target) else {
        diagnostics.error(
            Code::ConfigUnknownTarget,
            format!("target {:?} has no platform memory map yet", config.target),
        );
        fail_all(&mut states);
        if config.strict {
            diagnostics.promote_warnings_to_errors();
        }
        return CompileOutput::failed(states, diagnostics);
    };

    // Phase A: frame allocation.
    let frames = frame::allocate(program, call_graph, &platform, &mut diagnostics);
    match &frames {
        Some(_) => advance_all(&mut states, FunctionState::Unstarted, FunctionState::Framed),
        None => fail_all(&mut states),
    }
    let Some(frames) = frames else {
        if config.strict {
            diagnostics.promote_warnings_to_errors();
        }
        return CompileOutput::failed(states, diagnostics);
    };

    // Phase B (IL generation) already happened upstream of this call;
    // every function that survived framing is considered ILED.
    advance_all(&mut states, FunctionState::Framed, FunctionState::Iled);

    if cancellation.is_cancelled() {
        return CompileOutput {
            frames: Some(frames),
            asm: None,
            emitted: None,
            function_states: states,
            diagnostics,
        };
    }

    // Phase C: IL optimizer, fixed point.
    middle::optimize(&mut il_module, config.optimization.optimizer_enabled(), &mut diagnostics);
    advance_all(&mut states, FunctionState::Iled, FunctionState::Optimized);

    if cancellation.is_cancelled() {
        return CompileOutput {
            frames: Some(frames),
            asm: None,
            emitted: None,
            function_states: states,
            diagnostics,
        };
    }

    // Phase D: code generation.
    let asm = back::generate(&il_module, &frames, &platform, config, &mut diagnostics);
    match &asm {
        Some(_) => advance_all(&mut states, FunctionState::Optimized, FunctionState::Lowered),
        None => fail_all(&mut states),
    }
    let Some(mut asm) = asm else {
        if config.strict {
            diagnostics.promote_warnings_to_errors();
        }
        return CompileOutput {
            frames: Some(frames),
            asm: None,
            emitted: None,
            function_states: states,
            diagnostics,
        };
    };

    // Phase E: ASM optimizer, fixed point.
    if config.optimization.optimizer_enabled() {
        back::asm_opt::optimize(&mut asm, &platform);
    }

    // Phase F: ACME emitter.
    let emitted = back::emitter::emit(&asm, &platform, &output_base_name(config), config.load_address, &mut diagnostics);
    match &emitted {
        Some(_) => advance_all(&mut states, FunctionState::Lowered, FunctionState::Emitted),
        None => fail_all(&mut states),
    }

    if config.strict {
        diagnostics.promote_warnings_to_errors();
    }

    CompileOutput {
        frames: Some(frames),
        asm: Some(asm),
        emitted,
        function_states: states,
        diagnostics,
    }
}

fn output_base_name(config: &CompileConfig) -> String {
    match config.target {
        config::Target::C64 => "out".to_string(),
        config::Target::C128 => "out128".to_string(),
        config::Target::X16 => "outx16".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::front::ast::{FunctionDecl, Module, Type};
    use crate::middle::il::{BasicBlock, Function, Terminator};

    fn trivial_program() -> Program {
        let main = FunctionDecl {
            name: intern("main"),
            exported: true,
            is_callback: false,
            params: Vec::new(),
            return_type: Type::Void,
            body: Vec::new(),
            span: crate::common::Span::synthetic(),
        };
        Program {
            modules: vec![Module {
                qualified_name: intern("main_module"),
                imports: Vec::new(),
                exports: vec![intern("main")],
                globals: Vec::new(),
                functions: vec![main],
            }],
        }
    }

    fn trivial_il() -> ILModule {
        let mut module = ILModule::new();
        let mut function = Function::new(intern("main"), Vec::new(), Type::Void);
        function.blocks.push(BasicBlock::new(intern("main"), Terminator::Return(None)));
        module.functions.insert(intern("main"), function);
        module.entry = Some(intern("main"));
        module
    }

    #[test]
    fn compiles_a_trivial_program_end_to_end() {
        let program = trivial_program();
        let call_graph = CallGraph::from_program(&program);
        let il = trivial_il();
        let config = CompileConfig::default();

        let output = compile(&program, &call_graph, il, &config, &Cancellation::new());

        assert!(output.success(), "diagnostics: {}", output.diagnostics);
        assert!(output.frames.is_some());
        assert!(output.asm.is_some());
        let emitted = output.emitted.expect("emitter should have produced output");
        assert!(emitted.text.contains("main"));
        assert_eq!(output.function_states[&intern("main")], FunctionState::Emitted);
    }

    #[test]
    fn missing_main_fails_at_frame_allocation() {
        let program = Program { modules: Vec::new() };
        let call_graph = CallGraph::from_program(&program);
        let il = ILModule::new();
        let config = CompileConfig::default();

        let output = compile(&program, &call_graph, il, &config, &Cancellation::new());

        assert!(!output.success());
        assert!(output.frames.is_none());
    }

    #[test]
    fn unknown_target_fails_before_framing() {
        let program = trivial_program();
        let call_graph = CallGraph::from_program(&program);
        let il = trivial_il();
        let mut config = CompileConfig::default();
        config.target = config::Target::C128;

        let output = compile(&program, &call_graph, il, &config, &Cancellation::new());

        assert!(!output.success());
        assert!(output.diagnostics.iter().any(|d| d.code == Code::ConfigUnknownTarget));
    }

    #[test]
    fn cancellation_short_circuits_after_framing() {
        let program = trivial_program();
        let call_graph = CallGraph::from_program(&program);
        let il = trivial_il();
        let config = CompileConfig::default();
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let output = compile(&program, &call_graph, il, &config, &cancellation);

        assert!(output.frames.is_some());
        assert!(output.asm.is_none());
    }
}
