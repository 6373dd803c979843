//! AArch64 prologue patterns

use super::{Prologue, PrologueKind};
use crate::decoder::{InstructionStream, Step};
use crate::{Address, Decoder, Insn, Operand};

// Capstone may render the frame and link registers by their aliases.
fn is_fp(reg: Option<&str>) -> bool {
    matches!(reg, Some("x29") | Some("fp"))
}

fn is_lr(reg: Option<&str>) -> bool {
    matches!(reg, Some("x30") | Some("lr"))
}

fn is_sp(reg: Option<&str>) -> bool {
    matches!(reg, Some("sp"))
}

fn mem_base(insn: &Insn, idx: usize) -> Option<&str> {
    match insn.operands.get(idx) {
        Some(Operand::Mem { base, .. }) => base.as_deref(),
        _ => None,
    }
}

/// `stp x29, x30, [sp, #-N]!`
fn is_stp_fp_lr_preindex(insn: &Insn) -> bool {
    insn.is("stp")
        && is_fp(insn.reg(0))
        && is_lr(insn.reg(1))
        && is_sp(mem_base(insn, 2))
        && insn.is_pre_indexed()
}

/// `mov x29, sp`
fn is_mov_fp_sp(insn: &Insn) -> bool {
    insn.is("mov") && is_fp(insn.reg(0)) && is_sp(insn.reg(1))
}

/// `str x30, [sp, #-N]!`
fn is_str_lr_preindex(insn: &Insn) -> bool {
    insn.is("str") && is_lr(insn.reg(0)) && mem_base(insn, 1).is_some() && insn.is_pre_indexed()
}

/// `sub sp, sp, #N`
fn is_sub_sp_sp(insn: &Insn) -> bool {
    insn.is("sub") && is_sp(insn.reg(0)) && is_sp(insn.reg(1))
}

fn at_boundary(prev: Option<&Insn>) -> bool {
    prev.map_or(true, Insn::is_return)
}

/// Render the memory operand of a pre-indexed store, `[sp, #-0x20]!`
fn mem_text(insn: &Insn) -> &str {
    insn.op_str
        .find('[')
        .map(|idx| &insn.op_str[idx..])
        .unwrap_or("[sp, #-N]!")
}

/// Single linear pass over AArch64 code, one 4-byte word at a time.
pub fn scan<D: Decoder + ?Sized>(decoder: &D, code: &[u8], base: Address) -> Vec<Prologue> {
    log::debug!("Scanning {} bytes of AArch64 code at 0x{:x} for prologues", code.len(), base);

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

        // stp x29, x30, [sp, #-N]! is classified by what follows it
        if let Some(p) = prev.as_ref().filter(|p| is_stp_fp_lr_preindex(p)) {
            if is_mov_fp_sp(&insn) {
                result.push(Prologue::new(
                    p.addr,
                    PrologueKind::StpFramePair,
                    "stp x29, x30, [sp, #-N]!; mov x29, sp",
                ));
            } else {
                result.push(Prologue::new(p.addr, PrologueKind::StpOnly, "stp x29, x30, [sp, #-N]!"));
            }
        }

        // str x30, [sp, #-N]! (Go-style prologue)
        if is_str_lr_preindex(&insn) && at_boundary(prev.as_ref()) {
            result.push(Prologue::new(
                insn.addr,
                PrologueKind::StrLrPreindex,
                format!("str x30, {}", mem_text(&insn)),
            ));
        }

        // sub sp, sp, #N
        if is_sub_sp_sp(&insn) && at_boundary(prev.as_ref()) {
            let amount = insn
                .operands
                .get(2)
                .and_then(Operand::imm)
                .map(|imm| format!("#0x{:x}", imm))
                .unwrap_or_else(|| insn.op_str.rsplit(", ").next().unwrap_or("#N").to_string());
            result.push(Prologue::new(insn.addr, PrologueKind::SubSp, format!("sub sp, sp, {}", amount)));
        }

        prev = Some(insn);
    }

    log::debug!("Found {} AArch64 prologues", result.len());
    result
}
