//! The ACME textual emitter: serializes an `AsmModule` into ACME-dialect
//! assembly text, validating branch ranges and label resolution along the
//! way. Follows the usual 8-space mnemonic indent, one instruction per
//! line, retargeted to ACME's directive and addressing-mode syntax.

use std::fmt::Write as _;

use crate::common::Id;
use crate::config::PlatformConfig;
use crate::diagnostics::{Code, Diagnostic, Diagnostics};

use super::asm::{AddressingMode, AsmDirective, AsmElement, AsmInstruction, AsmModule, DataKind, Opcode, Operand};

/// The text and accounting the emitter produces.
pub struct EmitResult {
    pub text: String,
    pub byte_count: u32,
    pub line_count: u32,
    /// `(label, resolved address)` pairs, in label-definition order, for
    /// the VICE `.labels` file.
    pub labels: Vec<(Id, u16)>,
}

struct LabelTable {
    addresses: std::collections::BTreeMap<Id, u16>,
}

/// Walks the module once, laying out every element's size to resolve every
/// label to a concrete address before any text is emitted: labels resolve
/// in a pre-pass, so the textual pass never forward-references an
/// unresolved symbol.
fn resolve_labels(module: &AsmModule, origin: u16) -> LabelTable {
    let mut addresses = std::collections::BTreeMap::new();
    let mut cursor = u32::from(origin);

    for section in &module.sections {
        for element in &section.elements {
            match element {
                AsmElement::Directive(AsmDirective::Origin(addr)) => cursor = u32::from(*addr),
                AsmElement::Directive(AsmDirective::OutputHeader { .. }) => {}
                AsmElement::Label(label) => {
                    addresses.insert(label.name, cursor as u16);
                }
                AsmElement::Instruction(instr) => {
                    if let Some(label) = instr.label {
                        addresses.insert(label, cursor as u16);
                    }
                    cursor += instr.mode.encoded_length();
                }
                AsmElement::Data(data) => {
                    if let Some(label) = data.label {
                        addresses.insert(label, cursor as u16);
                    }
                    cursor += data_byte_len(data);
                }
                AsmElement::Comment(_) => {}
            }
        }
    }

    LabelTable { addresses }
}

fn data_byte_len(data: &super::asm::AsmData) -> u32 {
    match data.kind {
        DataKind::Byte => data.bytes.len() as u32,
        DataKind::Word => data.bytes.len() as u32 * 2,
        DataKind::Text => data.text.as_ref().map(|t| t.len() as u32 + 1).unwrap_or(0),
    }
}

fn operand_text(mode: AddressingMode, operand: &Operand, labels: &LabelTable) -> String {
    let value = |labels: &LabelTable| -> i64 {
        match operand {
            Operand::Immediate(v) => *v as i64,
            Operand::Label(l) => labels.addresses.get(l).copied().unwrap_or(0) as i64,
            Operand::None => 0,
        }
    };

    match mode {
        AddressingMode::Implied | AddressingMode::Relative => String::new(),
        AddressingMode::Accumulator => "a".to_string(),
        AddressingMode::Immediate => format!("#${:02X}", value(labels)),
        AddressingMode::ZeroPage => format!("${:02X}", value(labels)),
        AddressingMode::ZeroPageX => format!("${:02X},x", value(labels)),
        AddressingMode::ZeroPageY => format!("${:02X},y", value(labels)),
        AddressingMode::Absolute => symbolic_or_hex(operand, labels, 4),
        AddressingMode::AbsoluteX => format!("{},x", symbolic_or_hex(operand, labels, 4)),
        AddressingMode::AbsoluteY => format!("{},y", symbolic_or_hex(operand, labels, 4)),
        AddressingMode::Indirect => format!("({})", symbolic_or_hex(operand, labels, 4)),
        AddressingMode::IndexedIndirect => format!("(${:02X},x)", value(labels)),
        AddressingMode::IndirectIndexed => format!("(${:02X}),y", value(labels)),
    }
}

/// Prefer the symbolic label text over its resolved hex value when the
/// operand is a label — keeps branch targets and call targets readable in
/// the emitted source, matching ACME idiom.
fn symbolic_or_hex(operand: &Operand, labels: &LabelTable, hex_digits: usize) -> String {
    match operand {
        Operand::Label(l) => l.to_string(),
        Operand::Immediate(v) => format!("${:0width$X}", v, width = hex_digits),
        Operand::None => String::new(),
    }
}

fn mnemonic_line(instr: &AsmInstruction, labels: &LabelTable) -> String {
    let operand = operand_text(instr.mode, &instr.operand, labels);
    let mut line = format!("        {}", instr.opcode);
    if !operand.is_empty() {
        let _ = write!(line, " {operand}");
    }
    if let Some(comment) = &instr.comment {
        let _ = write!(line, "  ; {comment}");
    }
    line
}

fn branch_target_address(instr: &AsmInstruction, labels: &LabelTable) -> Option<u16> {
    match &instr.operand {
        Operand::Label(l) => labels.addresses.get(l).copied(),
        _ => None,
    }
}

/// Validates every branch instruction's displacement fits a signed byte:
/// `target - (branch_address + 2)` must lie in `-128..=127`.
fn check_branch_range(instr: &AsmInstruction, here: u16, labels: &LabelTable, diagnostics: &mut Diagnostics) {
    if !instr.opcode.is_branch() {
        return;
    }
    let Some(target) = branch_target_address(instr, labels) else {
        return;
    };
    let next = here as i32 + 2;
    let displacement = target as i32 - next;
    if !(-128..=127).contains(&displacement) {
        diagnostics.push(
            Diagnostic::error(
                Code::AsmBranchOutOfRange,
                format!(
                    "{} at ${here:04X} branches {displacement} bytes past its target ${target:04X}; range is -128..127",
                    instr.opcode
                ),
            )
            .at(instr.span)
            .suggest("rewrite as an inverted branch over an unconditional JMP (branch-inversion already does this where legal)"),
        );
    }
}

fn check_undefined_labels(module: &AsmModule, labels: &LabelTable, diagnostics: &mut Diagnostics) {
    for instr in module.instructions() {
        if let Operand::Label(l) = &instr.operand {
            if !labels.addresses.contains_key(l) {
                diagnostics.push(Diagnostic::error(Code::AsmUndefinedLabel, format!("undefined label `{l}`")).at(instr.span));
            }
        }
    }
}

/// Serializes `module` to ACME source text. `origin` is the module's base
/// address (the configured load address, or the BASIC stub's end address
/// when one is emitted). Returns `None` if validation fails; diagnostics
/// explain why.
pub fn emit(module: &AsmModule, platform: &PlatformConfig, output_name: &str, origin: u16, diagnostics: &mut Diagnostics) -> Option<EmitResult> {
    let labels = resolve_labels(module, origin);
    check_undefined_labels(module, &labels, diagnostics);

    let mut cursor = u32::from(origin);
    for section in &module.sections {
        for element in &section.elements {
            match element {
                AsmElement::Directive(AsmDirective::Origin(addr)) => cursor = u32::from(*addr),
                AsmElement::Instruction(instr) => {
                    check_branch_range(instr, cursor as u16, &labels, diagnostics);
                    cursor += instr.mode.encoded_length();
                }
                AsmElement::Data(data) => cursor += data_byte_len(data),
                _ => {}
            }
        }
    }

    if diagnostics.has_errors() {
        return None;
    }

    let mut text = String::new();
    let _ = writeln!(text, "!to \"{output_name}.prg\", cbm");
    let _ = writeln!(text, "* = ${origin:04X}");
    let mut line_count = 2u32;

    for section in &module.sections {
        let _ = writeln!(text, "; --- {} ---", section.name);
        line_count += 1;
        for element in &section.elements {
            match element {
                AsmElement::Directive(AsmDirective::Origin(addr)) => {
                    let _ = writeln!(text, "* = ${addr:04X}");
                    line_count += 1;
                }
                AsmElement::Directive(AsmDirective::OutputHeader { .. }) => {}
                AsmElement::Label(label) => {
                    let _ = writeln!(text, "{}", label_text(label.name, &platform.target));
                    line_count += 1;
                }
                AsmElement::Instruction(instr) => {
                    if let Some(label) = instr.label {
                        let _ = writeln!(text, "{}", label_text(label, &platform.target));
                        line_count += 1;
                    }
                    let _ = writeln!(text, "{}", mnemonic_line(instr, &labels));
                    line_count += 1;
                }
                AsmElement::Data(data) => {
                    if let Some(label) = data.label {
                        let _ = writeln!(text, "{}", label_text(label, &platform.target));
                        line_count += 1;
                    }
                    let _ = writeln!(text, "{}", data_line(data));
                    line_count += 1;
                }
                AsmElement::Comment(comment) => {
                    let _ = writeln!(text, "        ; {comment}");
                    line_count += 1;
                }
            }
        }
    }

    Some(EmitResult {
        text,
        byte_count: cursor - u32::from(origin),
        line_count,
        labels: labels.addresses.into_iter().collect(),
    })
}

fn label_text(name: Id, _target: &crate::config::Target) -> String {
    format!("{name}:")
}

fn data_line(data: &super::asm::AsmData) -> String {
    match data.kind {
        DataKind::Byte => {
            let values: Vec<String> = data.bytes.iter().map(|b| format!("${b:02X}")).collect();
            format!("        !byte {}", values.join(", "))
        }
        DataKind::Word => {
            let values: Vec<String> = data
                .bytes
                .chunks(2)
                .map(|pair| {
                    let lo = pair.first().copied().unwrap_or(0) as u16;
                    let hi = pair.get(1).copied().unwrap_or(0) as u16;
                    format!("${:04X}", lo | (hi << 8))
                })
                .collect();
            format!("        !word {}", values.join(", "))
        }
        DataKind::Text => format!("        !text \"{}\"", data.text.clone().unwrap_or_default()),
    }
}

/// Produces the VICE-format `.labels` file: one
/// `al C:<hex address> .<label>` line per resolved label.
pub fn emit_vice_labels(result: &EmitResult) -> String {
    let mut text = String::new();
    for (name, address) in &result.labels {
        let _ = writeln!(text, "al C:{address:04X} .{name}");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{intern, Span};
    use crate::back::asm::{AsmLabel, AsmModule, AsmSection};

    fn instr(opcode: Opcode, mode: AddressingMode, operand: Operand) -> AsmInstruction {
        AsmInstruction::new(opcode, mode, operand, Span::synthetic())
    }

    #[test]
    fn emits_border_color_scenario() {
        let mut section = AsmSection::new("code");
        section.elements.push(AsmElement::Label(AsmLabel {
            name: intern("main"),
            exported: true,
        }));
        section
            .elements
            .push(AsmElement::Instruction(instr(Opcode::LDA, AddressingMode::Immediate, Operand::Immediate(5))));
        section
            .elements
            .push(AsmElement::Instruction(instr(Opcode::STA, AddressingMode::Absolute, Operand::Immediate(0xD020))));
        section.elements.push(AsmElement::Instruction(instr(Opcode::RTS, AddressingMode::Implied, Operand::None)));
        let module = AsmModule { sections: vec![section] };
        let platform = PlatformConfig::c64();
        let mut diagnostics = Diagnostics::new();
        let result = emit(&module, &platform, "border", 0x0810, &mut diagnostics).unwrap();
        assert!(result.text.contains("LDA #$05"));
        assert!(result.text.contains("STA $D020"));
        assert!(result.text.contains("main:"));
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn rejects_undefined_label() {
        let mut section = AsmSection::new("code");
        section.elements.push(AsmElement::Instruction(instr(
            Opcode::JMP,
            AddressingMode::Absolute,
            Operand::Label(intern("nowhere")),
        )));
        let module = AsmModule { sections: vec![section] };
        let platform = PlatformConfig::c64();
        let mut diagnostics = Diagnostics::new();
        let result = emit(&module, &platform, "out", 0x0810, &mut diagnostics);
        assert!(result.is_none());
        assert!(diagnostics.iter().any(|d| d.code == Code::AsmUndefinedLabel));
    }

    #[test]
    fn rejects_branch_out_of_range() {
        let mut section = AsmSection::new("code");
        section.elements.push(AsmElement::Instruction(instr(
            Opcode::BEQ,
            AddressingMode::Relative,
            Operand::Label(intern("far")),
        )));
        for i in 0..200 {
            section
                .elements
                .push(AsmElement::Instruction(instr(Opcode::NOP, AddressingMode::Implied, Operand::None)));
            let _ = i;
        }
        let mut far = instr(Opcode::RTS, AddressingMode::Implied, Operand::None);
        far.label = Some(intern("far"));
        section.elements.push(AsmElement::Instruction(far));
        let module = AsmModule { sections: vec![section] };
        let platform = PlatformConfig::c64();
        let mut diagnostics = Diagnostics::new();
        let result = emit(&module, &platform, "out", 0x0810, &mut diagnostics);
        assert!(result.is_none());
        assert!(diagnostics.iter().any(|d| d.code == Code::AsmBranchOutOfRange));
    }
}
