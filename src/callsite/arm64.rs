//! AArch64 branch classification

use super::{AddressingMode, Branch, CallSite};
use crate::{Address, Insn, Operand};

/// Register-target branches, including the pointer-authenticated forms
const INDIRECT_CALLS: [&str; 5] = ["blr", "blraa", "blrab", "blraaz", "blrabz"];
const INDIRECT_JUMPS: [&str; 5] = ["br", "braa", "brab", "braaz", "brabz"];

/// Compare-and-branch and test-and-branch
const COMPARE_BRANCHES: [&str; 4] = ["cbz", "cbnz", "tbz", "tbnz"];

/// Returns the branch shape and whether its target is an immediate.
fn branch_kind(mnemonic: &str) -> Option<(Branch, bool)> {
    match mnemonic {
        "bl" => Some((Branch::Call, true)),
        "b" => Some((Branch::Jump, true)),
        m if INDIRECT_CALLS.contains(&m) => Some((Branch::Call, false)),
        m if INDIRECT_JUMPS.contains(&m) => Some((Branch::Jump, false)),
        m if COMPARE_BRANCHES.contains(&m) => Some((Branch::ConditionalJump, true)),
        // b.eq, b.ne, ... and the hinted bc.<cond>
        m if m.starts_with("b.") || m.starts_with("bc.") => Some((Branch::ConditionalJump, true)),
        _ => None,
    }
}

/// The label is always the last operand (`cbz x0, #t`, `tbz w0, #3, #t`).
fn label(insn: &Insn) -> Option<Address> {
    match insn.operands.last() {
        Some(Operand::Imm(target)) => Some(*target as Address),
        _ => None,
    }
}

/// Classify one instruction. Direct branches encode a word displacement from
/// the instruction's own address; capstone reports the resolved label.
pub fn classify(insn: &Insn) -> Option<CallSite> {
    let (branch, direct) = branch_kind(&insn.mnemonic)?;
    let target = if direct { label(insn) } else { None };
    Some(CallSite::from_branch(insn, branch, target, AddressingMode::PcRelative))
}
