//! Call and jump site extraction
//!
//! A single forward pass with no pattern state: every recognised branch
//! produces exactly one [`CallSite`] edge, in scan order. Targets that cannot
//! be resolved statically (register or memory operands) are kept with
//! `target: None` so callers can still count them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decoder::{CapstoneDecoder, InstructionStream, Step};
use crate::{Address, AnalysisError, Architecture, Decoder, Insn};

pub mod amd64;
pub mod arm64;

/// Control-flow edge kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// Direct or indirect call
    Call,
    /// Conditional or unconditional jump
    Jump,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Call => "call",
            EdgeKind::Jump => "jump",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How the branch target is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingMode {
    /// Displacement from the instruction; resolved statically
    PcRelative,
    /// Absolute address encoded in the instruction
    Absolute,
    /// Target held in a register or loaded from memory
    RegisterIndirect,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::PcRelative => "pc-relative",
            AddressingMode::Absolute => "absolute",
            AddressingMode::RegisterIndirect => "register-indirect",
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Ordinal trust level. Not a probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Confidence::None),
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            _ => Err(format!("Unknown confidence level: {}", s)),
        }
    }
}

/// A call or jump instruction and, when statically known, its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Address of the branch instruction
    pub source: Address,
    /// Resolved target, `None` for indirect branches
    pub target: Option<Address>,
    pub kind: EdgeKind,
    pub mode: AddressingMode,
    pub confidence: Confidence,
}

/// Branch shapes shared by both ISAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Branch {
    Call,
    Jump,
    ConditionalJump,
}

impl CallSite {
    /// Build an edge from a recognised branch and its (optional) target.
    ///
    /// `target` is `Some` only for immediate operands; everything else is
    /// register-indirect with no trust.
    pub(crate) fn from_branch(insn: &Insn, branch: Branch, target: Option<Address>, mode: AddressingMode) -> Self {
        let kind = match branch {
            Branch::Call => EdgeKind::Call,
            Branch::Jump | Branch::ConditionalJump => EdgeKind::Jump,
        };
        let (mode, confidence) = match (target, branch) {
            (None, _) => (AddressingMode::RegisterIndirect, Confidence::None),
            (Some(_), Branch::Call) => (mode, Confidence::High),
            (Some(_), Branch::Jump) => (mode, Confidence::Medium),
            (Some(_), Branch::ConditionalJump) => (mode, Confidence::Low),
        };
        CallSite {
            source: insn.addr,
            target,
            kind,
            mode,
            confidence,
        }
    }

    /// Returns true if the target was resolved
    pub fn is_resolved(&self) -> bool {
        self.target.is_some()
    }
}

/// Shared linear loop; `classify` sees every decoded instruction once.
fn scan<D, F>(decoder: &D, code: &[u8], base: Address, classify: F) -> Vec<CallSite>
where
    D: Decoder + ?Sized,
    F: Fn(&Insn) -> Option<CallSite>,
{
    log::debug!(
        "Scanning {} bytes of {} code at 0x{:x} for call sites",
        code.len(),
        decoder.architecture(),
        base
    );

    let edges: Vec<CallSite> = InstructionStream::new(decoder, code, base)
        .filter_map(|step| match step {
            Step::Insn(insn) => classify(&insn),
            Step::Marker { .. } | Step::Invalid { .. } => None,
        })
        .collect();

    log::debug!(
        "Found {} call sites ({} resolved)",
        edges.len(),
        edges.iter().filter(|e| e.is_resolved()).count()
    );
    edges
}

/// Extract call and jump edges from raw machine code.
///
/// `base` is the virtual address of `code[0]`. Unsupported architectures are
/// an error; undecodable bytes are skipped.
pub fn detect_call_sites(code: &[u8], base: Address, arch: Architecture) -> Result<Vec<CallSite>, AnalysisError> {
    match arch {
        Architecture::X86_64 => {
            let decoder = CapstoneDecoder::for_architecture(arch)?;
            Ok(scan(&decoder, code, base, amd64::classify))
        }
        Architecture::AArch64 => {
            let decoder = CapstoneDecoder::for_architecture(arch)?;
            Ok(scan(&decoder, code, base, arm64::classify))
        }
        Architecture::X86_32
        | Architecture::Arm
        | Architecture::Mips32
        | Architecture::RiscV64
        | Architecture::Ppc32
        | Architecture::Unknown => Err(AnalysisError::UnsupportedArchitecture(arch)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::None < Confidence::Low);
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
        assert_eq!("HIGH".parse::<Confidence>().unwrap(), Confidence::High);
    }

    #[rstest]
    #[case(Architecture::X86_64)]
    #[case(Architecture::AArch64)]
    fn test_empty_input(#[case] arch: Architecture) {
        assert!(detect_call_sites(&[], 0x1000, arch).unwrap().is_empty());
    }

    #[rstest]
    #[case(Architecture::Arm)]
    #[case(Architecture::RiscV64)]
    #[case(Architecture::Unknown)]
    fn test_unsupported_architecture(#[case] arch: Architecture) {
        assert!(matches!(
            detect_call_sites(&[0xe8, 0, 0, 0, 0], 0, arch),
            Err(AnalysisError::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn test_serialized_tags() {
        let edge = CallSite {
            source: 0x1000,
            target: None,
            kind: EdgeKind::Call,
            mode: AddressingMode::RegisterIndirect,
            confidence: Confidence::None,
        };
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["kind"], "call");
        assert_eq!(json["mode"], "register-indirect");
        assert_eq!(json["confidence"], "none");
        assert!(json["target"].is_null());
    }
}
