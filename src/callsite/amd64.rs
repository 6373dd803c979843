//! x86-64 branch classification

use super::{AddressingMode, Branch, CallSite};
use crate::{Address, Insn};

/// Conditional jumps on flags
const JCC: [&str; 16] = [
    "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge", "jle", "jg",
];

/// Counter-based conditional jumps
const COUNTER_JUMPS: [&str; 6] = ["jcxz", "jecxz", "jrcxz", "loop", "loope", "loopne"];

fn branch_kind(mnemonic: &str) -> Option<Branch> {
    match mnemonic {
        "call" => Some(Branch::Call),
        "jmp" => Some(Branch::Jump),
        m if JCC.contains(&m) || COUNTER_JUMPS.contains(&m) => Some(Branch::ConditionalJump),
        _ => None,
    }
}

/// Classify one instruction. Direct branches on x86-64 are always rel8/rel32
/// displacements; capstone reports them already resolved against the end of
/// the instruction.
pub fn classify(insn: &Insn) -> Option<CallSite> {
    let branch = branch_kind(&insn.mnemonic)?;
    let target = insn.imm(0).map(|t| t as Address);
    Some(CallSite::from_branch(insn, branch, target, AddressingMode::PcRelative))
}
