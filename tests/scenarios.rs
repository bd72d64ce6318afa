//! End-to-end scenarios exercising the pipeline's externally observable
//! behavior: what a caller building `Program`/`CallGraph`/`ILModule` values
//! by hand (as any front end would) actually gets back from `compile()`,
//! `frame::allocate()`, and the ASM optimizer.

use blend65::back::asm::{AddressingMode, AsmElement, AsmInstruction, AsmModule, AsmSection, Opcode, Operand};
use blend65::back::asm_opt;
use blend65::common::{intern, Span};
use blend65::config::{CompileConfig, PlatformConfig};
use blend65::diagnostics::{Code, Diagnostics};
use blend65::front::ast::{Expr, FunctionDecl, GlobalDecl, Module, Program, Stmt, StorageDirective, Type, VarDecl};
use blend65::middle::{BasicBlock, CallGraph, Function, ILInstruction, ILModule, Operand as IlOperand, Terminator};
use blend65::{compile, Cancellation};

fn span() -> Span {
    Span::synthetic()
}

fn program_with(functions: Vec<FunctionDecl>, globals: Vec<GlobalDecl>) -> Program {
    Program {
        modules: vec![Module {
            qualified_name: intern("root"),
            imports: vec![],
            exports: vec![],
            globals,
            functions,
        }],
    }
}

fn empty_main() -> FunctionDecl {
    FunctionDecl {
        name: intern("main"),
        exported: true,
        is_callback: false,
        params: vec![],
        return_type: Type::Void,
        body: vec![],
        span: span(),
    }
}

/// `poke(0xD020, 5)` in `main` compiles end to end into a load-and-store
/// against the VIC-II border color register, with a hardware-access
/// diagnostic and no leftover frame usage (the built-in takes no frame
/// slots).
#[test]
fn border_color_set_compiles_to_a_load_and_store() {
    let main = FunctionDecl {
        body: vec![Stmt::ExprStmt(Expr::Call(
            intern("poke"),
            vec![Expr::Const(0xD020), Expr::Const(5)],
        ))],
        ..empty_main()
    };
    let program = program_with(vec![main], vec![]);
    let call_graph = CallGraph::from_program(&program);

    let mut function = Function::new(intern("main"), Vec::new(), Type::Void);
    let mut block = BasicBlock::new(intern("main"), Terminator::Return(None));
    block.instructions.push(ILInstruction::Poke {
        addr: IlOperand::Const(0xD020),
        value: IlOperand::Const(5),
        span: span(),
    });
    function.blocks.push(block);
    let mut il = ILModule::new();
    il.functions.insert(intern("main"), function);
    il.entry = Some(intern("main"));

    let output = compile(&program, &call_graph, il, &CompileConfig::default(), &Cancellation::new());

    assert!(output.success(), "diagnostics: {}", output.diagnostics);
    let asm = output.asm.expect("code generation should have produced asm");
    let opcodes: Vec<Opcode> = asm.instructions().map(|i| i.opcode).collect();
    assert!(opcodes.contains(&Opcode::LDA));
    assert!(opcodes.contains(&Opcode::STA));
    assert!(
        asm.instructions().any(|i| i.address() == Some(0xD020)),
        "should store directly to the border color register"
    );

    let frame = &output.frames.unwrap().frames[&intern("main")];
    assert!(frame.slots.is_empty(), "poke takes no frame slots of its own");
}

/// A store to a non-volatile zero-page address immediately followed by a
/// load of the same address is redundant — the load's value is already in
/// the accumulator. A store to a hardware register, though, is never
/// eliminated even if a matching load follows, since it's observable to
/// the outside world.
#[test]
fn redundant_load_after_store_is_eliminated_but_hardware_store_is_not() {
    let mut section = AsmSection::new("code");
    section.elements.push(AsmElement::Instruction(AsmInstruction::new(
        Opcode::LDA,
        AddressingMode::Immediate,
        Operand::Immediate(5),
        span(),
    )));
    section.elements.push(AsmElement::Instruction(AsmInstruction::new(
        Opcode::STA,
        AddressingMode::ZeroPage,
        Operand::Immediate(0x0050),
        span(),
    )));
    section.elements.push(AsmElement::Instruction(AsmInstruction::new(
        Opcode::LDA,
        AddressingMode::ZeroPage,
        Operand::Immediate(0x0050),
        span(),
    )));
    section.elements.push(AsmElement::Instruction(AsmInstruction::new(
        Opcode::STA,
        AddressingMode::Absolute,
        Operand::Immediate(0xD020),
        span(),
    )));
    let mut module = AsmModule::new();
    module.sections.push(section);

    let platform = PlatformConfig::c64();
    let changed = asm_opt::optimize(&mut module, &platform);
    assert!(changed);

    let opcodes: Vec<(Opcode, Operand)> = module
        .instructions()
        .map(|i| (i.opcode, i.operand.clone()))
        .collect();
    assert_eq!(
        opcodes,
        vec![
            (Opcode::LDA, Operand::Immediate(5)),
            (Opcode::STA, Operand::Immediate(0x0050)),
            (Opcode::STA, Operand::Immediate(0xD020)),
        ]
    );
}

/// Three mutually unrelated functions, each with one array local, never
/// call each other and share no thread-context conflict, so they coalesce
/// into a single group sized to the largest of the three rather than the
/// sum of all three.
#[test]
fn unrelated_functions_coalesce_their_array_locals() {
    fn step(name: &str, array_len: u32) -> FunctionDecl {
        FunctionDecl {
            name: intern(name),
            exported: false,
            is_callback: false,
            params: vec![],
            return_type: Type::Void,
            body: vec![Stmt::Let(
                VarDecl {
                    name: intern(&format!("{name}_buf")),
                    ty: Type::Array(Box::new(Type::Byte), array_len),
                    directive: StorageDirective::None,
                    span: span(),
                },
                None,
            )],
            span: span(),
        }
    }

    let program = program_with(
        vec![empty_main(), step("step_a", 10), step("step_b", 6), step("step_c", 4)],
        vec![],
    );
    let call_graph = CallGraph::from_program(&program);
    let platform = PlatformConfig::c64();
    let mut diags = Diagnostics::new();

    let map = blend65::frame::allocate(&program, &call_graph, &platform, &mut diags).expect("allocation should succeed");
    assert!(!diags.has_errors());

    let a = map.frames[&intern("step_a")].coalesce_group;
    let b = map.frames[&intern("step_b")].coalesce_group;
    let c = map.frames[&intern("step_c")].coalesce_group;
    assert!(a.is_some() && a == b && b == c, "all three should share one group");

    let group = &map.coalesce_groups[a.unwrap()];
    assert_eq!(group.size, 10, "group size is the largest member's frame size");
    assert!(map.coalescing_savings() > 0.0);
}

/// A recursive call cycle is rejected outright, before any frame is
/// allocated — this statically-allocated model has no notion of a call
/// stack to support recursion.
#[test]
fn recursive_call_cycle_is_rejected() {
    let mut ping = empty_main();
    ping.name = intern("ping");
    ping.body = vec![Stmt::ExprStmt(Expr::Call(intern("pong"), vec![]))];
    let mut pong = empty_main();
    pong.name = intern("pong");
    pong.body = vec![Stmt::ExprStmt(Expr::Call(intern("ping"), vec![]))];
    let mut main = empty_main();
    main.body = vec![Stmt::ExprStmt(Expr::Call(intern("ping"), vec![]))];

    let program = program_with(vec![main, ping, pong], vec![]);
    let call_graph = CallGraph::from_program(&program);
    let platform = PlatformConfig::c64();
    let mut diags = Diagnostics::new();

    assert!(blend65::frame::allocate(&program, &call_graph, &platform, &mut diags).is_none());
    assert!(diags.iter().any(|d| d.code == Code::SfaRecursion));
}

/// A `callback` (ISR) and `main`'s own call tree never coalesce, even when
/// neither calls the other, because both could be live at the same
/// instant — an interrupt can fire mid-frame.
#[test]
fn callback_and_main_thread_frames_never_coalesce() {
    let mut irq = empty_main();
    irq.name = intern("irq_handler");
    irq.exported = false;
    irq.is_callback = true;
    irq.body = vec![Stmt::Let(
        VarDecl {
            name: intern("irq_local"),
            ty: Type::Byte,
            directive: StorageDirective::None,
            span: span(),
        },
        None,
    )];

    let mut main = empty_main();
    main.body = vec![Stmt::Let(
        VarDecl {
            name: intern("main_local"),
            ty: Type::Byte,
            directive: StorageDirective::None,
            span: span(),
        },
        None,
    )];

    let program = program_with(vec![main, irq], vec![]);
    let call_graph = CallGraph::from_program(&program);
    let platform = PlatformConfig::c64();
    let mut diags = Diagnostics::new();

    let map = blend65::frame::allocate(&program, &call_graph, &platform, &mut diags).expect("allocation should succeed");

    let main_group = map.frames[&intern("main")].coalesce_group;
    let irq_group = map.frames[&intern("irq_handler")].coalesce_group;
    assert_ne!(main_group, irq_group, "main and an ISR must never share a coalesce group");
}

/// A function declares far more `@zp`-required bytes than the C64's
/// 142-byte zero page pool can hold. Allocation fails outright rather
/// than silently spilling a `@zp` slot elsewhere.
#[test]
fn zero_page_overflow_is_rejected() {
    let mut overflow = empty_main();
    overflow.name = intern("needs_too_much_zp");
    overflow.body = (0..200)
        .map(|i| {
            Stmt::Let(
                VarDecl {
                    name: intern(&format!("zp_{i}")),
                    ty: Type::Byte,
                    directive: StorageDirective::RequireZp,
                    span: span(),
                },
                None,
            )
        })
        .collect();

    let program = program_with(vec![empty_main(), overflow], vec![]);
    let call_graph = CallGraph::from_program(&program);
    let platform = PlatformConfig::c64();
    let mut diags = Diagnostics::new();

    assert!(blend65::frame::allocate(&program, &call_graph, &platform, &mut diags).is_none());
    assert!(diags.iter().any(|d| d.code == Code::SfaZpOverflow));
}

/// Two independently-unfit `@zp` slots each produce their own diagnostic:
/// the allocator doesn't stop reporting after the first one it sees.
#[test]
fn every_unfit_zp_slot_is_reported() {
    let mut first = empty_main();
    first.name = intern("first_huge_zp_user");
    first.body = vec![Stmt::Let(
        VarDecl {
            name: intern("big_a"),
            ty: Type::Array(Box::new(Type::Byte), 200),
            directive: StorageDirective::RequireZp,
            span: span(),
        },
        None,
    )];

    let mut second = empty_main();
    second.name = intern("second_huge_zp_user");
    second.body = vec![Stmt::Let(
        VarDecl {
            name: intern("big_b"),
            ty: Type::Array(Box::new(Type::Byte), 200),
            directive: StorageDirective::RequireZp,
            span: span(),
        },
        None,
    )];

    let program = program_with(vec![empty_main(), first, second], vec![]);
    let call_graph = CallGraph::from_program(&program);
    let platform = PlatformConfig::c64();
    let mut diags = Diagnostics::new();

    assert!(blend65::frame::allocate(&program, &call_graph, &platform, &mut diags).is_none());
    let overflow_count = diags.iter().filter(|d| d.code == Code::SfaZpOverflow).count();
    assert_eq!(overflow_count, 2);
}
