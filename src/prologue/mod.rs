//! Function prologue detection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::decoder::CapstoneDecoder;
use crate::{Address, AnalysisError, Architecture};

pub mod amd64;
pub mod arm64;

/// Prologue pattern classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrologueKind {
    /// `push rbp; mov rbp, rsp`
    Classic,
    /// `sub rsp, imm` at a function boundary
    NoFramePointer,
    /// `push <callee-saved>` at a function boundary
    PushOnly,
    /// `lea rsp, [rsp-N]` at a function boundary
    LeaBased,
    /// `stp x29, x30, [sp, #-N]!; mov x29, sp`
    StpFramePair,
    /// `stp x29, x30, [sp, #-N]!` without the frame pointer copy
    StpOnly,
    /// `str x30, [sp, #-N]!` at a function boundary
    StrLrPreindex,
    /// `sub sp, sp, #N` at a function boundary
    SubSp,
}

impl PrologueKind {
    /// Tag used in serialized output
    pub fn as_str(&self) -> &'static str {
        match self {
            PrologueKind::Classic => "classic",
            PrologueKind::NoFramePointer => "no-frame-pointer",
            PrologueKind::PushOnly => "push-only",
            PrologueKind::LeaBased => "lea-based",
            PrologueKind::StpFramePair => "stp-frame-pair",
            PrologueKind::StpOnly => "stp-only",
            PrologueKind::StrLrPreindex => "str-lr-preindex",
            PrologueKind::SubSp => "sub-sp",
        }
    }

    /// Patterns that establish a full frame chain are trusted more than bare
    /// register saves and stack decrements.
    pub fn establishes_frame(&self) -> bool {
        matches!(self, PrologueKind::Classic | PrologueKind::StpFramePair)
    }

    /// All kinds, x86-64 first
    pub fn all() -> &'static [PrologueKind] {
        &[
            PrologueKind::Classic,
            PrologueKind::NoFramePointer,
            PrologueKind::PushOnly,
            PrologueKind::LeaBased,
            PrologueKind::StpFramePair,
            PrologueKind::StpOnly,
            PrologueKind::StrLrPreindex,
            PrologueKind::SubSp,
        ]
    }
}

impl fmt::Display for PrologueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PrologueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrologueKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown prologue kind: {}", s))
    }
}

/// A detected function prologue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prologue {
    /// Address of the pattern's first instruction
    pub address: Address,
    /// Pattern classification
    #[serde(rename = "type")]
    pub kind: PrologueKind,
    /// Rendered instruction text
    pub instructions: String,
}

impl Prologue {
    pub(crate) fn new(address: Address, kind: PrologueKind, instructions: impl Into<String>) -> Self {
        Self {
            address,
            kind,
            instructions: instructions.into(),
        }
    }
}

/// Analyze raw machine code and return the detected function prologues.
///
/// `base` is the virtual address of `code[0]`. This performs no I/O and works
/// with bytes from any container format. Undecodable bytes are skipped; only an
/// unsupported architecture is an error.
pub fn detect_prologues(code: &[u8], base: Address, arch: Architecture) -> Result<Vec<Prologue>, AnalysisError> {
    match arch {
        Architecture::X86_64 => {
            let decoder = CapstoneDecoder::for_architecture(arch)?;
            Ok(amd64::scan(&decoder, code, base))
        }
        Architecture::AArch64 => {
            let decoder = CapstoneDecoder::for_architecture(arch)?;
            Ok(arm64::scan(&decoder, code, base))
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

    #[rstest]
    #[case(Architecture::X86_64)]
    #[case(Architecture::AArch64)]
    fn test_empty_input(#[case] arch: Architecture) {
        assert!(detect_prologues(&[], 0, arch).unwrap().is_empty());
        let empty: Vec<u8> = Vec::new();
        assert!(detect_prologues(&empty, 0x1000, arch).unwrap().is_empty());
    }

    #[rstest]
    #[case(Architecture::Mips32)]
    #[case(Architecture::X86_32)]
    #[case(Architecture::Unknown)]
    fn test_unsupported_architecture(#[case] arch: Architecture) {
        let err = detect_prologues(&[0x00], 0, arch).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedArchitecture(a) if a == arch));
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in PrologueKind::all() {
            assert_eq!(kind.as_str().parse::<PrologueKind>().unwrap(), *kind);
            assert_eq!(
                serde_json::to_string(kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert!("frameless".parse::<PrologueKind>().is_err());
    }

    #[test]
    fn test_kind_establishes_frame() {
        assert!(PrologueKind::Classic.establishes_frame());
        assert!(!PrologueKind::StpOnly.establishes_frame());
    }

    #[test]
    fn test_prologue_serializes_with_type_tag() {
        let p = Prologue::new(0x1001, PrologueKind::Classic, "push rbp; mov rbp, rsp");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["address"], 0x1001);
        assert_eq!(json["type"], "classic");
        assert_eq!(json["instructions"], "push rbp; mov rbp, rsp");
    }
}
