//! Lowers an optimized IL module into ASM-IL: an ordered sequence of phases
//! producing one `AsmModule` from a `FrameMap` and the register allocations
//! computed per function. Distinct numbered phases are run in order and
//! merged into one result, the way the frame allocator runs its own phases
//! over the call graph.

use std::collections::BTreeSet;

use crate::back::builder::AsmBuilder;
use crate::back::regalloc::{self, Allocation, Register, TempLocation};
use crate::common::{intern, Id, Span};
use crate::config::{CompileConfig, PlatformConfig};
use crate::diagnostics::{Code, Diagnostic, Diagnostics};
use crate::frame::{Frame, FrameMap, SlotKind};
use crate::front::ast::Type;
use crate::middle::il::{
    BinOp, Condition, Function, ILInstruction, ILModule, Operand, StorageClass, Temp, Terminator, UnOp,
};

/// Length in bytes of the fixed BASIC loader stub.
pub const BASIC_STUB_LEN: u16 = 12;

/// Builds the 12-byte `10 SYS <addr>` BASIC program.
/// `addr` is the decimal-ASCII target, `load_address + BASIC_STUB_LEN`.
fn basic_stub_bytes(load_address: u16) -> Vec<u8> {
    let start = load_address.wrapping_add(BASIC_STUB_LEN);
    let next_line = load_address.wrapping_add(BASIC_STUB_LEN - 2); // one past this line, before the end marker
    let digits = start.to_string();

    let mut stub = vec![0u8; BASIC_STUB_LEN as usize];
    stub[0..2].copy_from_slice(&next_line.to_le_bytes());
    stub[2] = 0x0A;
    stub[3] = 0x00;
    stub[4] = 0x9E;
    for (i, byte) in digits.bytes().enumerate().take(4) {
        stub[5 + i] = byte;
    }
    // offset 9 (end-of-line) and 10-11 (end-of-program) are already zero.
    stub
}

/// Lowers every function in `module` into one `AsmModule`, emitting the
/// BASIC stub, global declarations, and the code section in that order.
/// Returns `None` only on a fatal diagnostic (spill overflow); every
/// function that *can* be lowered still is, so non-fatal diagnostics
/// (hardware-range warnings) accumulate across the whole module.
pub fn generate(
    module: &ILModule,
    frames: &FrameMap,
    platform: &PlatformConfig,
    config: &CompileConfig,
    diagnostics: &mut Diagnostics,
) -> Option<crate::back::asm::AsmModule> {
    let mut builder = AsmBuilder::new(diagnostics);

    builder.start_section("prelude");
    builder.output_header(config_output_name(config), "cbm");
    let code_start = if config.basic_stub {
        builder.bytes(None, basic_stub_bytes(config.load_address));
        config.load_address.wrapping_add(BASIC_STUB_LEN)
    } else {
        config.load_address
    };
    let entry = module.entry.unwrap_or_else(|| intern("main"));
    builder.jmp_abs(entry, Span::synthetic());

    builder.start_section("globals");
    for (name, global) in &module.globals {
        emit_global(&mut builder, *name, global, frames, code_start);
    }
    builder.origin(code_start);

    builder.start_section("code");
    let mut ok = true;
    for (name, function) in &module.functions {
        let Some(frame) = frames.frames.get(name) else {
            continue;
        };
        if !lower_function(&mut builder, function, frame, frames, platform) {
            ok = false;
        }
    }

    builder.comment("end of program");

    if !ok {
        return None;
    }
    Some(builder.finish())
}

fn config_output_name(config: &CompileConfig) -> String {
    match config.target {
        crate::config::Target::C64 => "out".to_string(),
        crate::config::Target::C128 => "out128".to_string(),
        crate::config::Target::X16 => "outx16".to_string(),
    }
}

fn emit_global(
    builder: &mut AsmBuilder,
    name: Id,
    global: &crate::middle::il::Global,
    frames: &FrameMap,
    _code_start: u16,
) {
    let Some(slot) = frames.globals.get(&name) else {
        return;
    };
    let Some(address) = slot.address else {
        return;
    };
    match &global.initial_value {
        Some(bytes) => {
            builder.origin(address);
            match global.storage {
                StorageClass::ZeroPage => builder.comment(format!("{name} @ ${address:02X} (zero page)")),
                _ => {}
            }
            if global.ty.size_bytes() == 2 {
                let words: Vec<u16> = bytes.chunks(2).map(|c| c[0] as u16 | ((*c.get(1).unwrap_or(&0) as u16) << 8)).collect();
                builder.words(Some(name), words);
            } else {
                builder.bytes(Some(name), bytes.clone());
            }
        }
        None => {
            builder.comment(format!("{name} reserved at ${address:04X}"));
        }
    }
}

/// Lowers one function's basic blocks into the builder's current section.
/// Returns `false` on a fatal diagnostic (register allocation spill
/// overflow); the caller still processes the rest of the module.
fn lower_function(builder: &mut AsmBuilder, function: &Function, frame: &Frame, frames: &FrameMap, platform: &PlatformConfig) -> bool {
    let word_temps = infer_word_temps(function, frame, frames);
    let Some(alloc) = regalloc::allocate(function, &word_temps, platform, builder.diagnostics_mut()) else {
        return false;
    };

    let mut ctx = Ctx {
        frames,
        frame,
        platform,
        alloc: &alloc,
        word_temps: &word_temps,
        function,
        next_label: 0,
    };

    for (index, block) in function.blocks.iter().enumerate() {
        builder.attach_label(block_label(function, index));
        for instr in &block.instructions {
            lower_instruction(builder, &mut ctx, instr);
        }
        lower_terminator(builder, &mut ctx, function, &block.terminator);
    }
    true
}

fn block_label(function: &Function, index: usize) -> Id {
    if index == 0 {
        function.name
    } else {
        function.blocks[index].label
    }
}

/// Per-function lowering state: everything the instruction-level helpers
/// need threaded through without re-deriving it per call.
struct Ctx<'a> {
    frames: &'a FrameMap,
    frame: &'a Frame,
    platform: &'a PlatformConfig,
    alloc: &'a Allocation,
    word_temps: &'a BTreeSet<Temp>,
    function: &'a Function,
    next_label: u32,
}

impl Ctx<'_> {
    fn is_word(&self, temp: Temp) -> bool {
        self.word_temps.contains(&temp)
    }

    fn fresh_label(&mut self, tag: &str) -> Id {
        let id = intern(&format!("{}${}{}", self.function.name, tag, self.next_label));
        self.next_label += 1;
        id
    }

    /// Resolves a named variable (local, parameter, or global) to its
    /// placed address. Zero-page vs. absolute addressing is chosen by the
    /// caller from the returned address.
    fn var_address(&self, name: Id) -> Option<u16> {
        self.frame
            .slot(name)
            .or_else(|| self.frames.globals.get(&name))
            .and_then(|slot| slot.address)
    }

    fn var_is_word(&self, name: Id) -> bool {
        self.frame
            .slot(name)
            .or_else(|| self.frames.globals.get(&name))
            .map(|slot| slot.size == 2)
            .unwrap_or(false)
    }

    fn array_element_size(&self, base: Id) -> u32 {
        let ty = self
            .frame
            .slot(base)
            .or_else(|| self.frames.globals.get(&base))
            .map(|s| &s.ty);
        match ty {
            Some(Type::Array(elem, _)) => elem.size_bytes().max(1),
            _ => 1,
        }
    }
}

/// Where a byte-wide value currently lives for reading/writing purposes.
enum Place {
    ZeroPage(u16),
    Absolute(u16),
}

fn place_for(ctx: &Ctx, address: u16) -> Place {
    if ctx.platform.zero_page.contains(address) {
        Place::ZeroPage(address)
    } else {
        Place::Absolute(address)
    }
}

fn lda_place(b: &mut AsmBuilder, place: Place, span: Span) {
    match place {
        Place::ZeroPage(a) => b.lda_zp(a, span),
        Place::Absolute(a) => b.lda_abs(a, span),
    }
}

fn sta_place(b: &mut AsmBuilder, place: Place, span: Span) {
    match place {
        Place::ZeroPage(a) => b.sta_zp(a, span),
        Place::Absolute(a) => b.sta_abs(a, span),
    }
}

/// Loads the low byte of `op` into A. For a `Temp` already resident in a
/// register other than A, transfers it in; for one spilled to scratch,
/// loads from its zero-page slot.
fn load_operand_to_a(b: &mut AsmBuilder, ctx: &Ctx, op: Operand, span: Span) {
    match op {
        Operand::Const(c) => b.lda_imm((c as i64 & 0xFF) as u8, span),
        Operand::Temp(t) => match ctx.alloc.location(t) {
            Some(TempLocation::Register(Register::A)) | None => {}
            Some(TempLocation::Register(Register::X)) => b.txa(span),
            Some(TempLocation::Register(Register::Y)) => b.tya(span),
            Some(TempLocation::Scratch(addr)) => b.lda_zp(addr, span),
        },
    }
}

/// Loads the high byte of a word-valued `op` into A.
fn load_operand_high_to_a(b: &mut AsmBuilder, ctx: &Ctx, op: Operand, span: Span) {
    match op {
        Operand::Const(c) => b.lda_imm(((c as i64 >> 8) & 0xFF) as u8, span),
        Operand::Temp(t) => match ctx.alloc.location(t) {
            Some(TempLocation::Scratch(addr)) => b.lda_zp(addr + 1, span),
            // Word temps are always spilled (regalloc never colors one into a
            // single 8-bit register), so any other location is unreachable.
            _ => b.lda_imm(0, span),
        },
    }
}

/// Stores A into `dst`'s location (no-op if `dst` is already colored A).
fn store_a_to_dest(b: &mut AsmBuilder, ctx: &Ctx, dst: Temp, span: Span) {
    match ctx.alloc.location(dst) {
        Some(TempLocation::Register(Register::A)) | None => {}
        Some(TempLocation::Register(Register::X)) => b.tax(span),
        Some(TempLocation::Register(Register::Y)) => b.tay(span),
        Some(TempLocation::Scratch(addr)) => b.sta_zp(addr, span),
    }
}

fn store_a_to_dest_high(b: &mut AsmBuilder, ctx: &Ctx, dst: Temp, span: Span) {
    if let Some(TempLocation::Scratch(addr)) = ctx.alloc.location(dst) {
        b.sta_zp(addr + 1, span);
    }
}

/// Puts a byte-valued operand into X (used for array indices and loop
/// counters; index operands are pre-colored X/Y by the allocator, so this
/// usually collapses to a no-op transfer).
fn load_operand_to_x(b: &mut AsmBuilder, ctx: &Ctx, op: Operand, span: Span) {
    match op {
        Operand::Const(c) => b.ldx_imm((c as i64 & 0xFF) as u8, span),
        Operand::Temp(t) => match ctx.alloc.location(t) {
            Some(TempLocation::Register(Register::X)) | None => {}
            Some(TempLocation::Register(Register::A)) => b.tax(span),
            Some(TempLocation::Register(Register::Y)) => {
                b.tya(span);
                b.tax(span);
            }
            Some(TempLocation::Scratch(addr)) => b.ldx_zp(addr, span),
        },
    }
}

fn lower_instruction(b: &mut AsmBuilder, ctx: &mut Ctx, instr: &ILInstruction) {
    let span = instr.span();
    match instr {
        ILInstruction::Const { dst, value, .. } => {
            if ctx.is_word(*dst) {
                b.lda_imm((*value & 0xFF) as u8, span);
                store_a_to_dest(b, ctx, *dst, span);
                b.lda_imm(((*value >> 8) & 0xFF) as u8, span);
                store_a_to_dest_high(b, ctx, *dst, span);
            } else {
                b.lda_imm((*value & 0xFF) as u8, span);
                store_a_to_dest(b, ctx, *dst, span);
            }
        }
        ILInstruction::Copy { dst, src, .. } => {
            load_operand_to_a(b, ctx, *src, span);
            store_a_to_dest(b, ctx, *dst, span);
            if ctx.is_word(*dst) {
                load_operand_high_to_a(b, ctx, *src, span);
                store_a_to_dest_high(b, ctx, *dst, span);
            }
        }
        ILInstruction::Unary { dst, op, src, .. } => {
            load_operand_to_a(b, ctx, *src, span);
            match op {
                UnOp::Neg => {
                    b.eor_imm(0xFF, span);
                    b.clc(span);
                    b.adc_imm(1, span);
                }
                UnOp::Not => b.eor_imm(0xFF, span),
            }
            store_a_to_dest(b, ctx, *dst, span);
        }
        ILInstruction::Binary { dst, op, lhs, rhs, .. } => lower_binary(b, ctx, *dst, *op, *lhs, *rhs, span),
        ILInstruction::Load { dst, var, .. } => {
            let Some(addr) = ctx.var_address(*var) else { return };
            lda_place(b, place_for(ctx, addr), span);
            store_a_to_dest(b, ctx, *dst, span);
            if ctx.var_is_word(*var) {
                lda_place(b, place_for(ctx, addr + 1), span);
                store_a_to_dest_high(b, ctx, *dst, span);
            }
        }
        ILInstruction::Store { var, value, .. } => {
            let Some(addr) = ctx.var_address(*var) else { return };
            load_operand_to_a(b, ctx, *value, span);
            sta_place(b, place_for(ctx, addr), span);
            if ctx.var_is_word(*var) {
                load_operand_high_to_a(b, ctx, *value, span);
                sta_place(b, place_for(ctx, addr + 1), span);
            }
        }
        ILInstruction::LoadIndexed { dst, base, index, .. } => {
            let Some(base_addr) = ctx.var_address(*base) else { return };
            let scale = ctx.array_element_size(*base) >= 2;
            load_indexed_x(b, ctx, *index, scale, span);
            b.lda_abs_x(base_addr, span);
            store_a_to_dest(b, ctx, *dst, span);
            if scale {
                b.lda_abs_x(base_addr + 1, span);
                store_a_to_dest_high(b, ctx, *dst, span);
            }
        }
        ILInstruction::StoreIndexed { base, index, value, .. } => {
            let Some(base_addr) = ctx.var_address(*base) else { return };
            let scale = ctx.array_element_size(*base) >= 2;
            load_indexed_x(b, ctx, *index, scale, span);
            load_operand_to_a(b, ctx, *value, span);
            b.sta_abs_x(base_addr, span);
            if scale {
                load_operand_high_to_a(b, ctx, *value, span);
                b.sta_abs_x(base_addr + 1, span);
            }
        }
        ILInstruction::Peek { dst, addr, .. } => {
            lower_volatile_read(b, ctx, *dst, *addr, span);
        }
        ILInstruction::Poke { addr, value, .. } => {
            lower_volatile_write(b, ctx, *addr, *value, span);
        }
        ILInstruction::HwRead { dst, addr, .. } => {
            check_hardware_access(b, ctx, *addr, span);
            lda_place(b, place_for(ctx, *addr), span);
            store_a_to_dest(b, ctx, *dst, span);
        }
        ILInstruction::HwWrite { addr, value, .. } => {
            check_hardware_access(b, ctx, *addr, span);
            load_operand_to_a(b, ctx, *value, span);
            sta_place(b, place_for(ctx, *addr), span);
        }
        ILInstruction::Sys { addr, .. } => match addr {
            Operand::Const(c) => b.jsr_addr(*c as u16, span),
            Operand::Temp(_) => {
                // A runtime-computed routine address has no static label;
                // the IL generator is expected to have already rejected
                // this combination, since `sys`'s address argument must be
                // a compile-time constant.
            }
        },
        ILInstruction::Call { dst, callee, args, .. } => lower_call(b, ctx, *dst, *callee, args, span),
        ILInstruction::Phi { .. } => {
            // Phis are resolved by copies the optimizer inserts at the end
            // of each predecessor block before this pass runs; by lowering
            // time no Phi should still be reachable with live operands.
        }
    }
}

fn load_indexed_x(b: &mut AsmBuilder, ctx: &Ctx, index: Operand, scale_by_two: bool, span: Span) {
    if scale_by_two {
        load_operand_to_a(b, ctx, index, span);
        b.asl_acc(span);
        b.tax(span);
    } else {
        load_operand_to_x(b, ctx, index, span);
    }
}

fn lower_binary(b: &mut AsmBuilder, ctx: &mut Ctx, dst: Temp, op: BinOp, lhs: Operand, rhs: Operand, span: Span) {
    if ctx.is_word(dst) && matches!(op, BinOp::Add | BinOp::Sub) {
        load_operand_to_a(b, ctx, lhs, span);
        if op == BinOp::Add {
            b.clc(span);
        } else {
            b.sec(span);
        }
        apply_rhs_byte(b, ctx, op, rhs, span);
        store_a_to_dest(b, ctx, dst, span);

        load_operand_high_to_a(b, ctx, lhs, span);
        apply_rhs_high_byte(b, ctx, op, rhs, span);
        store_a_to_dest_high(b, ctx, dst, span);
        return;
    }

    match op {
        BinOp::Add => {
            load_operand_to_a(b, ctx, lhs, span);
            b.clc(span);
            apply_rhs_byte(b, ctx, op, rhs, span);
            store_a_to_dest(b, ctx, dst, span);
        }
        BinOp::Sub => {
            load_operand_to_a(b, ctx, lhs, span);
            b.sec(span);
            apply_rhs_byte(b, ctx, op, rhs, span);
            store_a_to_dest(b, ctx, dst, span);
        }
        BinOp::And | BinOp::Or | BinOp::Xor => {
            load_operand_to_a(b, ctx, lhs, span);
            apply_rhs_byte(b, ctx, op, rhs, span);
            store_a_to_dest(b, ctx, dst, span);
        }
        BinOp::Shl => {
            load_operand_to_a(b, ctx, lhs, span);
            b.asl_acc(span);
            store_a_to_dest(b, ctx, dst, span);
        }
        BinOp::Shr => {
            load_operand_to_a(b, ctx, lhs, span);
            b.lsr_acc(span);
            store_a_to_dest(b, ctx, dst, span);
        }
        BinOp::Lt => lower_comparison(b, ctx, dst, lhs, rhs, "lt", span, true),
        BinOp::Eq => lower_comparison(b, ctx, dst, lhs, rhs, "eq", span, false),
    }
}

/// Applies `op` against `rhs`'s low byte, A already holding `lhs`'s low
/// byte with the carry flag set for the operation.
fn apply_rhs_byte(b: &mut AsmBuilder, ctx: &Ctx, op: BinOp, rhs: Operand, span: Span) {
    match (op, rhs) {
        (BinOp::Add, Operand::Const(c)) => b.adc_imm((c & 0xFF) as u8, span),
        (BinOp::Add, Operand::Temp(t)) => apply_temp_byte(b, ctx, t, span, AsmBuilder::adc_imm, AsmBuilder::adc_zp),
        (BinOp::Sub, Operand::Const(c)) => b.sbc_imm((c & 0xFF) as u8, span),
        (BinOp::Sub, Operand::Temp(t)) => apply_temp_byte(b, ctx, t, span, AsmBuilder::sbc_imm, AsmBuilder::sbc_zp),
        (BinOp::And, Operand::Const(c)) => b.and_imm((c & 0xFF) as u8, span),
        (BinOp::And, Operand::Temp(t)) => apply_temp_byte(b, ctx, t, span, AsmBuilder::and_imm, AsmBuilder::and_zp),
        (BinOp::Or, Operand::Const(c)) => b.ora_imm((c & 0xFF) as u8, span),
        (BinOp::Or, Operand::Temp(t)) => apply_temp_byte(b, ctx, t, span, AsmBuilder::ora_imm, AsmBuilder::ora_zp),
        (BinOp::Xor, Operand::Const(c)) => b.eor_imm((c & 0xFF) as u8, span),
        (BinOp::Xor, Operand::Temp(t)) => apply_temp_byte(b, ctx, t, span, AsmBuilder::eor_imm, AsmBuilder::eor_zp),
        (BinOp::Shl | BinOp::Shr | BinOp::Lt | BinOp::Eq, _) => {}
    }
}

fn apply_rhs_high_byte(b: &mut AsmBuilder, ctx: &Ctx, op: BinOp, rhs: Operand, span: Span) {
    match (op, rhs) {
        (BinOp::Add, Operand::Const(c)) => b.adc_imm(((c >> 8) & 0xFF) as u8, span),
        (BinOp::Add, Operand::Temp(t)) => apply_temp_high_byte(b, ctx, t, span, AsmBuilder::adc_zp, true),
        (BinOp::Sub, Operand::Const(c)) => b.sbc_imm(((c >> 8) & 0xFF) as u8, span),
        (BinOp::Sub, Operand::Temp(t)) => apply_temp_high_byte(b, ctx, t, span, AsmBuilder::sbc_zp, true),
        _ => {}
    }
}

/// A spilled `Temp` operand can be folded directly into the accumulator op
/// via its zero-page address; a register-resident one must first be moved
/// to a scratch location the accumulator op can address, since none of
/// `ADC`/`SBC`/`AND`/`ORA`/`EOR` accept X or Y as a source.
fn apply_temp_byte(
    b: &mut AsmBuilder,
    ctx: &Ctx,
    t: Temp,
    span: Span,
    imm: fn(&mut AsmBuilder, u8, Span),
    zp: fn(&mut AsmBuilder, u16, Span),
) {
    match ctx.alloc.location(t) {
        Some(TempLocation::Scratch(addr)) => zp(b, addr, span),
        Some(TempLocation::Register(Register::X)) => {
            b.stx_zp(ctx.platform.zero_page_scratch.start, span);
            zp(b, ctx.platform.zero_page_scratch.start, span);
        }
        Some(TempLocation::Register(Register::Y)) => {
            b.sty_zp(ctx.platform.zero_page_scratch.start, span);
            zp(b, ctx.platform.zero_page_scratch.start, span);
        }
        Some(TempLocation::Register(Register::A)) | None => {
            b.sta_zp(ctx.platform.zero_page_scratch.start, span);
            zp(b, ctx.platform.zero_page_scratch.start, span);
            imm(b, 0, span);
        }
    }
}

fn apply_temp_high_byte(b: &mut AsmBuilder, ctx: &Ctx, t: Temp, span: Span, zp: fn(&mut AsmBuilder, u16, Span), _word: bool) {
    if let Some(TempLocation::Scratch(addr)) = ctx.alloc.location(t) {
        zp(b, addr + 1, span);
    }
}

/// `Lt`/`Eq` produce a 0/1 boolean via the standard compare-then-branch
/// idiom: the flag to test after `CMP` depends on which predicate we want.
fn lower_comparison(b: &mut AsmBuilder, ctx: &mut Ctx, dst: Temp, lhs: Operand, rhs: Operand, tag: &str, span: Span, unsigned_less: bool) {
    load_operand_to_a(b, ctx, lhs, span);
    match rhs {
        Operand::Const(c) => b.cmp_imm((c & 0xFF) as u8, span),
        Operand::Temp(t) => apply_temp_byte(b, ctx, t, span, AsmBuilder::cmp_imm, AsmBuilder::cmp_zp),
    }

    let true_label = ctx.fresh_label(&format!("{tag}_t"));
    let end_label = ctx.fresh_label(&format!("{tag}_e"));

    if unsigned_less {
        // carry clear after CMP means lhs < rhs (unsigned).
        b.bcc(true_label, span);
    } else {
        b.beq(true_label, span);
    }
    b.lda_imm(0, span);
    b.jmp_abs(end_label, span);
    b.attach_label(true_label);
    b.lda_imm(1, span);
    b.attach_label(end_label);
    store_a_to_dest(b, ctx, dst, span);
}

fn lower_volatile_read(b: &mut AsmBuilder, ctx: &Ctx, dst: Temp, addr: Operand, span: Span) {
    match addr {
        Operand::Const(c) => {
            let address = c as u16;
            check_hardware_access(b, ctx, address, span);
            lda_place(b, place_for(ctx, address), span);
            store_a_to_dest(b, ctx, dst, span);
        }
        Operand::Temp(t) => {
            // Runtime-computed address: treated as a zero-page pointer pair
            // and read through `(zp),y`.
            if let Some(TempLocation::Scratch(ptr)) = ctx.alloc.location(t) {
                b.ldy_imm(0, span);
                b.lda_ind_y(ptr, span);
                store_a_to_dest(b, ctx, dst, span);
            }
        }
    }
}

fn lower_volatile_write(b: &mut AsmBuilder, ctx: &Ctx, addr: Operand, value: Operand, span: Span) {
    match addr {
        Operand::Const(c) => {
            let address = c as u16;
            check_hardware_access(b, ctx, address, span);
            if ctx.platform.is_rom(address) {
                b.diagnostics_mut().warning(
                    Code::BuiltinRomWrite,
                    format!("write to ${address:04X} targets a ROM range"),
                );
            }
            if let Operand::Const(v) = value {
                if !(0..=255).contains(&v) {
                    b.diagnostics_mut().error(
                        Code::BuiltinArgumentOutOfRange,
                        format!("poke value {v} does not fit in a byte"),
                    );
                }
            }
            load_operand_to_a(b, ctx, value, span);
            sta_place(b, place_for(ctx, address), span);
        }
        Operand::Temp(t) => {
            if let Some(TempLocation::Scratch(ptr)) = ctx.alloc.location(t) {
                load_operand_to_a(b, ctx, value, span);
                b.ldy_imm(0, span);
                b.sta_ind_y(ptr, span);
            }
        }
    }
}

fn check_hardware_access(b: &mut AsmBuilder, ctx: &Ctx, address: u16, span: Span) {
    if let Some(hw) = ctx.platform.hardware_range_containing(address) {
        b.diagnostics_mut().push(
            Diagnostic::warning(Code::BuiltinHardwareAccess, format!("address ${address:04X} is in {} hardware range", hw.name)).at(span),
        );
    }
}

fn lower_call(b: &mut AsmBuilder, ctx: &Ctx, dst: Option<Temp>, callee: Id, args: &[Operand], span: Span) {
    if let Some(callee_frame) = ctx.frames.frames.get(&callee) {
        let params: Vec<_> = callee_frame.slots.iter().filter(|s| s.kind == SlotKind::Parameter).collect();
        for (param, arg) in params.iter().zip(args) {
            let Some(addr) = param.address else { continue };
            load_operand_to_a(b, ctx, *arg, span);
            sta_place(b, place_for(ctx, addr), span);
            if param.size == 2 {
                load_operand_high_to_a(b, ctx, *arg, span);
                sta_place(b, place_for(ctx, addr + 1), span);
            }
        }
    }

    b.jsr(callee, span);

    if let Some(dst) = dst {
        store_a_to_dest(b, ctx, dst, span);
        if ctx.is_word(dst) {
            if let Some(callee_frame) = ctx.frames.frames.get(&callee) {
                if let Some(ret_slot) = callee_frame.slots.iter().find(|s| s.kind == SlotKind::ReturnValue) {
                    if let Some(addr) = ret_slot.address {
                        lda_place(b, place_for(ctx, addr + 1), span);
                        store_a_to_dest_high(b, ctx, dst, span);
                    }
                }
            }
        }
    }
}

fn lower_terminator(b: &mut AsmBuilder, ctx: &mut Ctx, function: &Function, term: &Terminator) {
    let span = Span::synthetic();
    match term {
        Terminator::Jump(target) => {
            b.jmp_abs(block_label(function, *target), span);
        }
        Terminator::Branch {
            cond,
            value,
            if_true,
            if_false,
        } => {
            let true_label = block_label(function, *if_true);
            let false_label = block_label(function, *if_false);
            match cond {
                Condition::True => b.jmp_abs(true_label, span),
                Condition::Zero | Condition::NotZero => {
                    load_operand_to_a(b, ctx, *value, span);
                    match cond {
                        Condition::Zero => b.beq(true_label, span),
                        Condition::NotZero => b.bne(true_label, span),
                        Condition::True => unreachable!(),
                    }
                    b.jmp_abs(false_label, span);
                }
            }
        }
        Terminator::Return(value) => {
            lower_return(b, ctx, function, *value, span);
            b.rts(span);
        }
    }
}

fn lower_return(b: &mut AsmBuilder, ctx: &Ctx, function: &Function, value: Option<Operand>, span: Span) {
    let Some(value) = value else { return };
    if function.return_type.size_bytes() <= 1 {
        load_operand_to_a(b, ctx, value, span);
        return;
    }
    let Some(ret_slot) = ctx.frame.slots.iter().find(|s| s.kind == SlotKind::ReturnValue) else {
        return;
    };
    let Some(addr) = ret_slot.address else { return };
    load_operand_to_a(b, ctx, value, span);
    sta_place(b, place_for(ctx, addr), span);
    load_operand_high_to_a(b, ctx, value, span);
    sta_place(b, place_for(ctx, addr + 1), span);
    lda_place(b, place_for(ctx, addr), span);
}

/// A temp is word-width if it's ever defined from a word-sized source
/// (a 2-byte variable load, an out-of-byte-range constant, or another word
/// temp) — the IL itself carries no per-temp type (`middle::il`'s module
/// doc), so this is inferred here by forward fixed-point propagation.
fn infer_word_temps(function: &Function, frame: &Frame, frames: &FrameMap) -> BTreeSet<Temp> {
    let mut word = BTreeSet::new();
    let var_is_word = |name: Id| -> bool {
        frame
            .slot(name)
            .or_else(|| frames.globals.get(&name))
            .map(|s| s.size == 2)
            .unwrap_or(false)
    };
    let op_is_word = |op: &Operand, word: &BTreeSet<Temp>| -> bool {
        match op {
            Operand::Const(c) => !(0..=255).contains(c),
            Operand::Temp(t) => word.contains(t),
        }
    };

    loop {
        let mut changed = false;
        for block in &function.blocks {
            for instr in &block.instructions {
                let becomes_word = match instr {
                    ILInstruction::Const { value, .. } => !(0..=255).contains(value),
                    ILInstruction::Load { var, .. } => var_is_word(*var),
                    ILInstruction::Copy { src, .. } => op_is_word(src, &word),
                    ILInstruction::Binary { op: BinOp::Add | BinOp::Sub, lhs, rhs, .. } => {
                        op_is_word(lhs, &word) || op_is_word(rhs, &word)
                    }
                    ILInstruction::LoadIndexed { base, .. } => {
                        matches!(frame.slot(*base).or_else(|| frames.globals.get(base)).map(|s| &s.ty), Some(Type::Array(e, _)) if e.size_bytes() == 2)
                    }
                    ILInstruction::Call { callee, .. } => frames
                        .frames
                        .get(callee)
                        .map(|f| f.slots.iter().any(|s| s.kind == SlotKind::ReturnValue && s.size == 2))
                        .unwrap_or(false),
                    _ => false,
                };
                if becomes_word {
                    if let Some(dst) = instr.dest() {
                        if word.insert(dst) {
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameSlot, Location};
    use crate::front::ast::StorageDirective;
    use crate::middle::il::{BasicBlock, Global};

    fn span() -> Span {
        Span::synthetic()
    }

    fn empty_frame(name: &str) -> Frame {
        Frame {
            function: intern(name),
            slots: vec![],
            total_size: 0,
            thread_context: crate::middle::call_graph::ThreadContext::MainThread,
            coalesce_group: None,
            base_address: Some(0x0820),
        }
    }

    #[test]
    fn border_color_scenario_matches_expected_asm() {
        // poke(0xD020, 5) inside an exported `main` with an empty frame.
        let mut main = Function::new(intern("main"), vec![], Type::Void);
        let mut block = BasicBlock::new(intern("main"), Terminator::Return(None));
        block.instructions.push(ILInstruction::Poke {
            addr: Operand::Const(0xD020),
            value: Operand::Const(5),
            span: span(),
        });
        main.blocks.push(block);

        let mut module = ILModule::new();
        module.functions.insert(intern("main"), main);
        module.entry = Some(intern("main"));

        let mut frames = FrameMap::default();
        frames.frames.insert(intern("main"), empty_frame("main"));

        let platform = PlatformConfig::c64();
        let config = CompileConfig::default();
        let mut diagnostics = Diagnostics::new();
        let asm = generate(&module, &frames, &platform, &config, &mut diagnostics).expect("codegen should succeed");

        let mnemonics: Vec<_> = asm.instructions().map(|i| i.opcode).collect();
        use crate::back::asm::Opcode::*;
        assert!(mnemonics.windows(2).any(|w| w[0] == LDA && w[1] == STA));
        assert!(asm.has_label(intern("main")));
        assert!(diagnostics.iter().any(|d| d.code == Code::BuiltinHardwareAccess));
    }

    #[test]
    fn store_load_pair_round_trips_through_a_variable() {
        let mut main = Function::new(intern("main"), vec![], Type::Void);
        let mut block = BasicBlock::new(intern("main"), Terminator::Return(None));
        let t0 = Temp(0);
        let t1 = Temp(1);
        block.instructions.push(ILInstruction::Const { dst: t0, value: 5, span: span() });
        block.instructions.push(ILInstruction::Store { var: intern("len"), value: Operand::Temp(t0), span: span() });
        block.instructions.push(ILInstruction::Load { dst: t1, var: intern("len"), span: span() });
        block.instructions.push(ILInstruction::Poke {
            addr: Operand::Const(0xD020),
            value: Operand::Temp(t1),
            span: span(),
        });
        main.blocks.push(block);
        main.next_temp = 2;

        let mut module = ILModule::new();
        module.functions.insert(intern("main"), main);
        module.entry = Some(intern("main"));

        let mut frames = FrameMap::default();
        let mut frame = empty_frame("main");
        frame.slots.push(FrameSlot {
            name: intern("len"),
            size: 1,
            kind: SlotKind::Local,
            directive: StorageDirective::None,
            ty: Type::Byte,
            hotness: 0,
            location: Some(Location::GeneralRam),
            address: Some(0x0050),
        });
        frames.frames.insert(intern("main"), frame);

        let platform = PlatformConfig::c64();
        let config = CompileConfig::default();
        let mut diagnostics = Diagnostics::new();
        let asm = generate(&module, &frames, &platform, &config, &mut diagnostics).expect("codegen should succeed");
        assert!(asm.instructions().count() > 0);
    }

    #[test]
    fn basic_stub_encodes_sys_line() {
        let stub = basic_stub_bytes(0x0801);
        assert_eq!(stub.len(), BASIC_STUB_LEN as usize);
        assert_eq!(stub[2], 0x0A);
        assert_eq!(stub[4], 0x9E);
        assert_eq!(&stub[5..9], b"2061");
    }

    #[test]
    fn globals_section_emits_initialized_ram_data() {
        let mut module = ILModule::new();
        module.functions.insert(
            intern("main"),
            Function::new(intern("main"), vec![], Type::Void),
        );
        let main_block = BasicBlock::new(intern("main"), Terminator::Return(None));
        module.functions.get_mut(&intern("main")).unwrap().blocks.push(main_block);
        module.globals.insert(
            intern("greeting"),
            Global {
                name: intern("greeting"),
                ty: Type::Byte,
                storage: StorageClass::Data,
                initial_value: Some(vec![42]),
            },
        );
        module.entry = Some(intern("main"));

        let mut frames = FrameMap::default();
        frames.frames.insert(intern("main"), empty_frame("main"));
        frames.globals.insert(
            intern("greeting"),
            FrameSlot {
                name: intern("greeting"),
                size: 1,
                kind: SlotKind::Global,
                directive: StorageDirective::Data,
                ty: Type::Byte,
                hotness: 0,
                location: Some(Location::GeneralRam),
                address: Some(0x2000),
            },
        );

        let platform = PlatformConfig::c64();
        let config = CompileConfig::default();
        let mut diagnostics = Diagnostics::new();
        let asm = generate(&module, &frames, &platform, &config, &mut diagnostics).expect("codegen should succeed");
        assert!(asm.sections.iter().any(|s| s.name == "globals" && !s.elements.is_empty()));
    }
}
