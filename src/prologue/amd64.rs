//! x86-64 prologue patterns

use super::{Prologue, PrologueKind};
use crate::decoder::{InstructionStream, Step};
use crate::{Address, Decoder, Insn, Operand};

/// Registers the System V and Windows x64 ABIs both treat as callee-saved.
const CALLEE_SAVED: [&str; 6] = ["rbx", "rbp", "r12", "r13", "r14", "r15"];

fn is_callee_saved(reg: &str) -> bool {
    CALLEE_SAVED.contains(&reg)
}

/// `push rbp`
fn is_push_rbp(insn: &Insn) -> bool {
    insn.is("push") && insn.reg(0) == Some("rbp")
}

/// `mov rbp, rsp`
fn is_mov_rbp_rsp(insn: &Insn) -> bool {
    insn.is("mov") && insn.reg(0) == Some("rbp") && insn.reg(1) == Some("rsp")
}

/// `lea rsp, [rsp - N]`
fn is_lea_rsp_down(insn: &Insn) -> bool {
    if !insn.is("lea") || insn.reg(0) != Some("rsp") {
        return false;
    }
    matches!(
        insn.operands.get(1),
        Some(Operand::Mem { base: Some(base), index: None, disp }) if base == "rsp" && *disp < 0
    )
}

/// Start of stream or right after a return.
fn at_boundary(prev: Option<&Insn>) -> bool {
    prev.map_or(true, Insn::is_return)
}

/// Single linear pass over x86-64 code.
///
/// One slot of look-behind: the previously decoded instruction, dropped on
/// every decode failure. CET markers leave it untouched.
pub fn scan<D: Decoder + ?Sized>(decoder: &D, code: &[u8], base: Address) -> Vec<Prologue> {
    log::debug!("Scanning {} bytes of x86-64 code at 0x{:x} for prologues", code.len(), base);

    let mut result = Vec::new();
    let mut prev: Option<Insn> = None;

    for step in InstructionStream::new(decoder, code, base) {
        let insn = match step {
            Step::Insn(insn) => insn,
            Step::Marker { .. } => continue,
            Step::Invalid { .. } => {
                prev = None;
                continue;
            }
        };

        // Pattern 1: push rbp; mov rbp, rsp
        if let Some(p) = prev.as_ref() {
            if is_push_rbp(p) && is_mov_rbp_rsp(&insn) {
                result.push(Prologue::new(p.addr, PrologueKind::Classic, "push rbp; mov rbp, rsp"));
            }
        }

        // Pattern 2: sub rsp, imm (may follow pushes of callee-saved registers)
        if insn.is("sub") && insn.reg(0) == Some("rsp") {
            if let Some(imm) = insn.imm(1).filter(|imm| *imm > 0) {
                if at_boundary(prev.as_ref()) || prev.as_ref().is_some_and(|p| p.is("push")) {
                    result.push(Prologue::new(
                        insn.addr,
                        PrologueKind::NoFramePointer,
                        format!("sub rsp, 0x{:x}", imm),
                    ));
                }
            }
        }

        // Pattern 3: push <callee-saved> at a boundary, never after another push
        if insn.is("push") {
            if let Some(reg) = insn.reg(0).filter(|r| is_callee_saved(r)) {
                if at_boundary(prev.as_ref()) {
                    result.push(Prologue::new(insn.addr, PrologueKind::PushOnly, format!("push {}", reg)));
                }
            }
        }

        // Pattern 4: lea rsp, [rsp - N]
        if is_lea_rsp_down(&insn) && at_boundary(prev.as_ref()) {
            result.push(Prologue::new(insn.addr, PrologueKind::LeaBased, "lea rsp, [rsp-offset]"));
        }

        prev = Some(insn);
    }

    log::debug!("Found {} x86-64 prologues", result.len());
    result
}
