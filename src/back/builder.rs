//! Incremental `AsmModule` construction: a mnemonic-per-mode method for
//! every opcode/addressing-mode combination the code generator needs, so
//! callers never construct an `AsmInstruction` by hand.

use crate::common::{Id, Span};
use crate::diagnostics::{Code, Diagnostics};

use super::asm::{
    AddressingMode, AsmData, AsmDirective, AsmElement, AsmInstruction, AsmLabel, AsmModule, AsmSection, DataKind,
    Opcode, Operand,
};

/// Builds one `AsmModule`, one section at a time.
pub struct AsmBuilder<'d> {
    module: AsmModule,
    current: usize,
    pending_label: Option<Id>,
    diagnostics: &'d mut Diagnostics,
}

/// Generates `{mnemonic}_{mode}(operand)` convenience methods that build
/// and push one instruction, validating the operand range at call time.
/// Each arm corresponds to one opcode/addressing-mode combination.
macro_rules! mnemonic_mode {
    ($name:ident, $opcode:expr, $mode:expr, byte) => {
        pub fn $name(&mut self, value: u8, span: Span) {
            self.push_checked($opcode, $mode, Operand::Immediate(value as u16), 0xFF, span);
        }
    };
    ($name:ident, $opcode:expr, $mode:expr, addr) => {
        pub fn $name(&mut self, address: u16, span: Span) {
            self.push($opcode, $mode, Operand::Immediate(address), span);
        }
    };
    ($name:ident, $opcode:expr, $mode:expr, label) => {
        pub fn $name(&mut self, label: Id, span: Span) {
            self.push($opcode, $mode, Operand::Label(label), span);
        }
    };
    ($name:ident, $opcode:expr, $mode:expr, implied) => {
        pub fn $name(&mut self, span: Span) {
            self.push($opcode, $mode, Operand::None, span);
        }
    };
}

impl<'d> AsmBuilder<'d> {
    pub fn new(diagnostics: &'d mut Diagnostics) -> Self {
        AsmBuilder {
            module: AsmModule::new(),
            current: usize::MAX,
            pending_label: None,
            diagnostics,
        }
    }

    pub fn finish(self) -> AsmModule {
        self.module
    }

    /// Exposes the diagnostics sink for callers that need to report an
    /// out-of-band condition (hardware-range access, ROM writes) while
    /// lowering an instruction.
    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        self.diagnostics
    }

    // ---- section / header / footer --------------------------------------

    pub fn start_section(&mut self, name: impl Into<String>) {
        self.module.sections.push(AsmSection::new(name));
        self.current = self.module.sections.len() - 1;
    }

    pub fn origin(&mut self, address: u16) {
        self.section_mut().elements.push(AsmElement::Directive(AsmDirective::Origin(address)));
    }

    pub fn output_header(&mut self, name: impl Into<String>, format: &'static str) {
        self.section_mut()
            .elements
            .push(AsmElement::Directive(AsmDirective::OutputHeader { name: name.into(), format }));
    }

    pub fn label(&mut self, name: Id, exported: bool) {
        self.section_mut().elements.push(AsmElement::Label(AsmLabel { name, exported }));
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.section_mut().elements.push(AsmElement::Comment(text.into()));
    }

    pub fn bytes(&mut self, label: Option<Id>, data: Vec<u8>) {
        self.section_mut().elements.push(AsmElement::Data(AsmData {
            kind: DataKind::Byte,
            bytes: data,
            text: None,
            label,
        }));
    }

    pub fn words(&mut self, label: Option<Id>, data: Vec<u16>) {
        let bytes = data.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.section_mut().elements.push(AsmElement::Data(AsmData {
            kind: DataKind::Word,
            bytes,
            text: None,
            label,
        }));
    }

    pub fn text(&mut self, label: Option<Id>, text: String) {
        self.section_mut().elements.push(AsmElement::Data(AsmData {
            kind: DataKind::Text,
            bytes: Vec::new(),
            text: Some(text),
            label,
        }));
    }

    /// Attaches a label to the next emitted instruction rather than
    /// inserting a standalone `AsmElement::Label` (used for branch targets
    /// mid-block, since each emitted element records its own position).
    pub fn attach_label(&mut self, name: Id) {
        self.pending_label = Some(name);
    }

    fn section_mut(&mut self) -> &mut AsmSection {
        &mut self.module.sections[self.current]
    }

    fn push(&mut self, opcode: Opcode, mode: AddressingMode, operand: Operand, span: Span) {
        let mut instr = AsmInstruction::new(opcode, mode, operand, span);
        if let Some(label) = self.pending_label.take() {
            instr = instr.with_label(label);
        }
        self.section_mut().elements.push(AsmElement::Instruction(instr));
    }

    fn push_checked(&mut self, opcode: Opcode, mode: AddressingMode, operand: Operand, max: u16, span: Span) {
        if let Operand::Immediate(v) = operand {
            if v > max {
                self.diagnostics.error(
                    Code::AsmImmediateOutOfRange,
                    format!("{opcode} operand {v:#x} exceeds {max:#x}"),
                );
                return;
            }
        }
        self.push(opcode, mode, operand, span);
    }

    // ---- load/store ------------------------------------------------------

    mnemonic_mode!(lda_imm, Opcode::LDA, AddressingMode::Immediate, byte);
    mnemonic_mode!(lda_zp, Opcode::LDA, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(lda_zp_x, Opcode::LDA, AddressingMode::ZeroPageX, addr);
    mnemonic_mode!(lda_abs, Opcode::LDA, AddressingMode::Absolute, addr);
    mnemonic_mode!(lda_abs_x, Opcode::LDA, AddressingMode::AbsoluteX, addr);
    mnemonic_mode!(lda_abs_y, Opcode::LDA, AddressingMode::AbsoluteY, addr);
    mnemonic_mode!(lda_ind_x, Opcode::LDA, AddressingMode::IndexedIndirect, addr);
    mnemonic_mode!(lda_ind_y, Opcode::LDA, AddressingMode::IndirectIndexed, addr);

    mnemonic_mode!(ldx_imm, Opcode::LDX, AddressingMode::Immediate, byte);
    mnemonic_mode!(ldx_zp, Opcode::LDX, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(ldx_zp_y, Opcode::LDX, AddressingMode::ZeroPageY, addr);
    mnemonic_mode!(ldx_abs, Opcode::LDX, AddressingMode::Absolute, addr);
    mnemonic_mode!(ldx_abs_y, Opcode::LDX, AddressingMode::AbsoluteY, addr);

    mnemonic_mode!(ldy_imm, Opcode::LDY, AddressingMode::Immediate, byte);
    mnemonic_mode!(ldy_zp, Opcode::LDY, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(ldy_zp_x, Opcode::LDY, AddressingMode::ZeroPageX, addr);
    mnemonic_mode!(ldy_abs, Opcode::LDY, AddressingMode::Absolute, addr);
    mnemonic_mode!(ldy_abs_x, Opcode::LDY, AddressingMode::AbsoluteX, addr);

    mnemonic_mode!(sta_zp, Opcode::STA, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(sta_zp_x, Opcode::STA, AddressingMode::ZeroPageX, addr);
    mnemonic_mode!(sta_abs, Opcode::STA, AddressingMode::Absolute, addr);
    mnemonic_mode!(sta_abs_x, Opcode::STA, AddressingMode::AbsoluteX, addr);
    mnemonic_mode!(sta_abs_y, Opcode::STA, AddressingMode::AbsoluteY, addr);
    mnemonic_mode!(sta_ind_x, Opcode::STA, AddressingMode::IndexedIndirect, addr);
    mnemonic_mode!(sta_ind_y, Opcode::STA, AddressingMode::IndirectIndexed, addr);

    mnemonic_mode!(stx_zp, Opcode::STX, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(stx_zp_y, Opcode::STX, AddressingMode::ZeroPageY, addr);
    mnemonic_mode!(stx_abs, Opcode::STX, AddressingMode::Absolute, addr);

    mnemonic_mode!(sty_zp, Opcode::STY, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(sty_zp_x, Opcode::STY, AddressingMode::ZeroPageX, addr);
    mnemonic_mode!(sty_abs, Opcode::STY, AddressingMode::Absolute, addr);

    // ---- arithmetic / logic -----------------------------------------------

    mnemonic_mode!(adc_imm, Opcode::ADC, AddressingMode::Immediate, byte);
    mnemonic_mode!(adc_zp, Opcode::ADC, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(adc_abs, Opcode::ADC, AddressingMode::Absolute, addr);
    mnemonic_mode!(sbc_imm, Opcode::SBC, AddressingMode::Immediate, byte);
    mnemonic_mode!(sbc_zp, Opcode::SBC, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(sbc_abs, Opcode::SBC, AddressingMode::Absolute, addr);
    mnemonic_mode!(cmp_imm, Opcode::CMP, AddressingMode::Immediate, byte);
    mnemonic_mode!(cmp_zp, Opcode::CMP, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(cmp_abs, Opcode::CMP, AddressingMode::Absolute, addr);
    mnemonic_mode!(cpx_imm, Opcode::CPX, AddressingMode::Immediate, byte);
    mnemonic_mode!(cpx_zp, Opcode::CPX, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(cpy_imm, Opcode::CPY, AddressingMode::Immediate, byte);
    mnemonic_mode!(cpy_zp, Opcode::CPY, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(inc_zp, Opcode::INC, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(inc_abs, Opcode::INC, AddressingMode::Absolute, addr);
    mnemonic_mode!(dec_zp, Opcode::DEC, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(dec_abs, Opcode::DEC, AddressingMode::Absolute, addr);
    mnemonic_mode!(inx, Opcode::INX, AddressingMode::Implied, implied);
    mnemonic_mode!(iny, Opcode::INY, AddressingMode::Implied, implied);
    mnemonic_mode!(dex, Opcode::DEX, AddressingMode::Implied, implied);
    mnemonic_mode!(dey, Opcode::DEY, AddressingMode::Implied, implied);

    mnemonic_mode!(and_imm, Opcode::AND, AddressingMode::Immediate, byte);
    mnemonic_mode!(and_zp, Opcode::AND, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(and_abs, Opcode::AND, AddressingMode::Absolute, addr);
    mnemonic_mode!(ora_imm, Opcode::ORA, AddressingMode::Immediate, byte);
    mnemonic_mode!(ora_zp, Opcode::ORA, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(ora_abs, Opcode::ORA, AddressingMode::Absolute, addr);
    mnemonic_mode!(eor_imm, Opcode::EOR, AddressingMode::Immediate, byte);
    mnemonic_mode!(eor_zp, Opcode::EOR, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(eor_abs, Opcode::EOR, AddressingMode::Absolute, addr);

    pub fn asl_acc(&mut self, span: Span) {
        self.push(Opcode::ASL, AddressingMode::Accumulator, Operand::None, span);
    }
    mnemonic_mode!(asl_zp, Opcode::ASL, AddressingMode::ZeroPage, addr);
    pub fn lsr_acc(&mut self, span: Span) {
        self.push(Opcode::LSR, AddressingMode::Accumulator, Operand::None, span);
    }
    mnemonic_mode!(lsr_zp, Opcode::LSR, AddressingMode::ZeroPage, addr);
    pub fn rol_acc(&mut self, span: Span) {
        self.push(Opcode::ROL, AddressingMode::Accumulator, Operand::None, span);
    }
    mnemonic_mode!(rol_zp, Opcode::ROL, AddressingMode::ZeroPage, addr);
    pub fn ror_acc(&mut self, span: Span) {
        self.push(Opcode::ROR, AddressingMode::Accumulator, Operand::None, span);
    }
    mnemonic_mode!(ror_zp, Opcode::ROR, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(bit_zp, Opcode::BIT, AddressingMode::ZeroPage, addr);
    mnemonic_mode!(bit_abs, Opcode::BIT, AddressingMode::Absolute, addr);

    // ---- control flow ------------------------------------------------------

    mnemonic_mode!(jmp_abs, Opcode::JMP, AddressingMode::Absolute, label);
    mnemonic_mode!(jmp_ind, Opcode::JMP, AddressingMode::Indirect, label);
    mnemonic_mode!(jsr, Opcode::JSR, AddressingMode::Absolute, label);
    /// `JSR` to a raw numeric machine-language address rather than a
    /// symbolic function label (the `sys` builtin).
    mnemonic_mode!(jsr_addr, Opcode::JSR, AddressingMode::Absolute, addr);
    mnemonic_mode!(rts, Opcode::RTS, AddressingMode::Implied, implied);
    mnemonic_mode!(rti, Opcode::RTI, AddressingMode::Implied, implied);
    mnemonic_mode!(brk, Opcode::BRK, AddressingMode::Implied, implied);

    mnemonic_mode!(bcc, Opcode::BCC, AddressingMode::Relative, label);
    mnemonic_mode!(bcs, Opcode::BCS, AddressingMode::Relative, label);
    mnemonic_mode!(beq, Opcode::BEQ, AddressingMode::Relative, label);
    mnemonic_mode!(bne, Opcode::BNE, AddressingMode::Relative, label);
    mnemonic_mode!(bmi, Opcode::BMI, AddressingMode::Relative, label);
    mnemonic_mode!(bpl, Opcode::BPL, AddressingMode::Relative, label);
    mnemonic_mode!(bvc, Opcode::BVC, AddressingMode::Relative, label);
    mnemonic_mode!(bvs, Opcode::BVS, AddressingMode::Relative, label);

    // ---- flags / transfer / stack ------------------------------------------

    mnemonic_mode!(clc, Opcode::CLC, AddressingMode::Implied, implied);
    mnemonic_mode!(sec, Opcode::SEC, AddressingMode::Implied, implied);
    mnemonic_mode!(cld, Opcode::CLD, AddressingMode::Implied, implied);
    mnemonic_mode!(sed, Opcode::SED, AddressingMode::Implied, implied);
    mnemonic_mode!(cli, Opcode::CLI, AddressingMode::Implied, implied);
    mnemonic_mode!(sei, Opcode::SEI, AddressingMode::Implied, implied);
    mnemonic_mode!(clv, Opcode::CLV, AddressingMode::Implied, implied);

    mnemonic_mode!(tax, Opcode::TAX, AddressingMode::Implied, implied);
    mnemonic_mode!(tay, Opcode::TAY, AddressingMode::Implied, implied);
    mnemonic_mode!(txa, Opcode::TXA, AddressingMode::Implied, implied);
    mnemonic_mode!(tya, Opcode::TYA, AddressingMode::Implied, implied);
    mnemonic_mode!(tsx, Opcode::TSX, AddressingMode::Implied, implied);
    mnemonic_mode!(txs, Opcode::TXS, AddressingMode::Implied, implied);
    mnemonic_mode!(pha, Opcode::PHA, AddressingMode::Implied, implied);
    mnemonic_mode!(pla, Opcode::PLA, AddressingMode::Implied, implied);
    mnemonic_mode!(php, Opcode::PHP, AddressingMode::Implied, implied);
    mnemonic_mode!(plp, Opcode::PLP, AddressingMode::Implied, implied);
    mnemonic_mode!(nop, Opcode::NOP, AddressingMode::Implied, implied);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_immediate_out_of_byte_range() {
        let mut diags = Diagnostics::new();
        let mut b = AsmBuilder::new(&mut diags);
        b.start_section("code");
        b.lda_imm(0xFF, Span::synthetic());
        assert!(!diags.has_errors());
        let module = b.finish();
        assert_eq!(module.instructions().count(), 1);
    }

    #[test]
    fn attached_label_lands_on_next_instruction() {
        let mut diags = Diagnostics::new();
        let mut b = AsmBuilder::new(&mut diags);
        b.start_section("code");
        b.attach_label(crate::common::intern("loop"));
        b.lda_zp(0x10, Span::synthetic());
        let module = b.finish();
        let instr = module.instructions().next().unwrap();
        assert_eq!(instr.label, Some(crate::common::intern("loop")));
    }
}
