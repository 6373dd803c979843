//! Core IR, traits, and dispatch for the resurgo function-boundary detector.
//!
//! resurgo recovers function entry points from raw machine code without symbol
//! tables or debug information. Two independent linear passes run over the code:
//! one recognises function prologues, the other extracts call and jump sites with
//! statically resolved targets. A merge step fuses both signals into ranked
//! [`FunctionCandidate`]s.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use resurgo::{detect_functions, detect_prologues, Architecture};
//!
//! // x86-64 machine code: nop; push rbp; mov rbp, rsp
//! let code = [0x90, 0x55, 0x48, 0x89, 0xe5];
//! let prologues = detect_prologues(&code, 0x1000, Architecture::X86_64).unwrap();
//! for p in &prologues {
//!     println!("[{}] 0x{:x}: {}", p.kind, p.address, p.instructions);
//! }
//!
//! // Whole binaries go through the container adapter.
//! let analysis = resurgo::analyze_file("/usr/bin/ls", &Default::default()).unwrap();
//! println!("{} function candidates", analysis.functions.len());
//!
//! let functions = detect_functions(&code, 0x1000, Architecture::X86_64).unwrap();
//! assert_eq!(functions.len(), 1);
//! ```

pub mod analysis;
pub mod callsite;
pub mod decoder;
pub mod format;
pub mod merge;
pub mod parser;
pub mod prologue;
#[cfg(feature = "extension-module")]
pub mod python;

pub use analysis::{analyze, analyze_file, analyze_reader, analyze_regions, Analysis, AnalysisOptions};
pub use callsite::{detect_call_sites, AddressingMode, CallSite, Confidence, EdgeKind};
pub use decoder::{CapstoneDecoder, InstructionStream, Step};
pub use merge::{
    detect_functions, filter_edges_to_region, merge_candidates, DetectionKind, FunctionCandidate,
    FunctionCandidates,
};
pub use parser::{
    detect_prologues_from_reader, BinaryMetadata, BinaryParser, CodeRegion, ContainerFormat, GoblinParser, Section,
};
pub use prologue::{detect_prologues, Prologue, PrologueKind};

/// Represents an address in memory
pub type Address = u64;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// One decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Register, by its lowercase assembler name (`rbp`, `x29`, `sp`)
    Reg(String),
    /// Immediate value. For direct branches this is the resolved target.
    Imm(i64),
    /// Memory reference `[base + index + disp]`
    Mem {
        base: Option<String>,
        index: Option<String>,
        disp: i64,
    },
    /// Anything the detectors never look at (system registers, barriers, ...)
    Other,
}

impl Operand {
    /// Register name, if this is a register operand
    pub fn reg(&self) -> Option<&str> {
        match self {
            Operand::Reg(name) => Some(name),
            _ => None,
        }
    }

    /// Immediate value, if this is an immediate operand
    pub fn imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(value) => Some(*value),
            _ => None,
        }
    }
}

/// One decoded instruction.
///
/// Owned and cheap to clone, so a detector can keep the previous instruction
/// around without borrowing decoder state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "stp"), with x86 `bnd`/`notrack` prefixes stripped
    pub mnemonic: String,
    /// Operands as rendered by the disassembler
    pub op_str: String,
    /// Structured operands
    pub operands: Vec<Operand>,
    /// Base-register writeback as reported by the decoder; `None` without instruction detail
    pub writeback: Option<bool>,
}

impl Insn {
    /// Returns true if the mnemonic equals `mnemonic`
    pub fn is(&self, mnemonic: &str) -> bool {
        self.mnemonic == mnemonic
    }

    /// Register name of operand `idx`
    pub fn reg(&self, idx: usize) -> Option<&str> {
        self.operands.get(idx).and_then(Operand::reg)
    }

    /// Immediate value of operand `idx`
    pub fn imm(&self, idx: usize) -> Option<i64> {
        self.operands.get(idx).and_then(Operand::imm)
    }

    /// Returns true for a plain return instruction
    pub fn is_return(&self) -> bool {
        self.mnemonic == "ret"
    }

    /// Returns true when a memory operand updates its base register before the
    /// access (AArch64 pre-index form, `[sp, #-16]!`)
    pub fn is_pre_indexed(&self) -> bool {
        match self.writeback {
            // post-index forms carry the offset as a trailing immediate
            Some(writeback) => writeback && matches!(self.operands.last(), Some(Operand::Mem { .. })),
            None => self.op_str.trim_end().ends_with("]!"),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op_str.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.op_str)
        }
    }
}

/// Decoder trait: architecture-specific single-instruction disassembler.
pub trait Decoder: Send + Sync {
    /// Architecture this decoder understands
    fn architecture(&self) -> Architecture;

    /// Decode a single instruction at `offset` into `code`.
    ///
    /// # Arguments
    /// * `code` - The code bytes being scanned
    /// * `offset` - Byte offset of the instruction inside `code`
    /// * `address` - Virtual address of `code[offset]`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise.
    /// Implementations never look past the end of `code`.
    fn decode(&self, code: &[u8], offset: usize, address: Address) -> Option<Insn>;
}

/// Architectures a container can report.
///
/// Only [`Architecture::X86_64`] and [`Architecture::AArch64`] are analysable;
/// every other tag is rejected with [`AnalysisError::UnsupportedArchitecture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    #[serde(rename = "amd64")]
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    #[serde(rename = "arm64")]
    AArch64,
    /// MIPS 32-bit
    Mips32,
    /// RISC-V 64-bit
    RiscV64,
    /// PowerPC 32-bit
    Ppc32,
    /// Unknown architecture
    Unknown,
}

impl Architecture {
    /// Width every instruction has on a fixed-width ISA, `None` for variable-length ones
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Architecture::AArch64 | Architecture::Arm | Architecture::Mips32 | Architecture::RiscV64 | Architecture::Ppc32 => Some(4),
            Architecture::X86_32 | Architecture::X86_64 | Architecture::Unknown => None,
        }
    }

    /// Returns true if the detectors can analyse this architecture
    pub fn is_supported(&self) -> bool {
        matches!(self, Architecture::X86_64 | Architecture::AArch64)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Mips32 => write!(f, "MIPS32"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
            Architecture::Ppc32 => write!(f, "PowerPC 32"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amd64" | "x86_64" | "x86-64" | "x64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::AArch64),
            "x86" | "i386" | "386" | "x86-32" => Ok(Architecture::X86_32),
            "arm" | "armv7" => Ok(Architecture::Arm),
            "mips" | "mips32" => Ok(Architecture::Mips32),
            "riscv64" | "riscv" => Ok(Architecture::RiscV64),
            "ppc" | "ppc32" | "powerpc" => Ok(Architecture::Ppc32),
            _ => Err(format!("Unknown architecture: {}", s)),
        }
    }
}

/// Error type for analysis operations
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The detectors have no pattern tables for this architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// Capstone could not be initialised
    #[error("Decoder error: {0}")]
    DecoderError(String),

    /// The container header or tables could not be parsed
    #[error("Failed to parse binary format: {0}")]
    MalformedContainer(String),

    /// The container parsed but is not one we extract code from
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// No code-bearing section in the container
    #[error("No {0} section found")]
    SectionNotFound(String),

    /// The code section exists but its bytes cannot be read
    #[error("Failed to read {name} section: {reason}")]
    SectionUnreadable { name: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization of results failed
    #[error("Output formatting error: {0}")]
    Format(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(mnemonic: &str, op_str: &str, operands: Vec<Operand>) -> Insn {
        Insn {
            addr: 0x1000,
            size: 4,
            mnemonic: mnemonic.to_string(),
            op_str: op_str.to_string(),
            operands,
            writeback: None,
        }
    }

    #[test]
    fn test_insn_accessors() {
        let i = insn(
            "sub",
            "rsp, 0x20",
            vec![Operand::Reg("rsp".into()), Operand::Imm(0x20)],
        );
        assert!(i.is("sub"));
        assert_eq!(i.reg(0), Some("rsp"));
        assert_eq!(i.imm(1), Some(0x20));
        assert_eq!(i.reg(1), None);
        assert_eq!(i.to_string(), "sub rsp, 0x20");
    }

    #[test]
    fn test_pre_indexed() {
        let stp = insn("stp", "x29, x30, [sp, #-0x10]!", vec![]);
        let ldp = insn("ldp", "x29, x30, [sp], #0x10", vec![]);
        assert!(stp.is_pre_indexed());
        assert!(!ldp.is_pre_indexed());
    }

    #[test]
    fn test_pre_indexed_prefers_writeback_flag() {
        let sp_mem = || Operand::Mem {
            base: Some("sp".into()),
            index: None,
            disp: -16,
        };
        let regs = || vec![Operand::Reg("x29".into()), Operand::Reg("x30".into())];

        let mut stp = insn("stp", "x29, x30, [sp, #-0x10]", [regs(), vec![sp_mem()]].concat());
        stp.writeback = Some(true);
        assert!(stp.is_pre_indexed());

        // the decoder's flag wins over the rendered text
        stp.writeback = Some(false);
        stp.op_str.push('!');
        assert!(!stp.is_pre_indexed());

        let mut ldp = insn("ldp", "x29, x30, [sp], #0x10", [regs(), vec![sp_mem(), Operand::Imm(0x10)]].concat());
        ldp.writeback = Some(true);
        assert!(!ldp.is_pre_indexed());
    }

    #[test]
    fn test_architecture_parsing() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("AArch64".parse::<Architecture>().unwrap(), Architecture::AArch64);
        assert_eq!("mips".parse::<Architecture>().unwrap(), Architecture::Mips32);
        assert!("vax".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_architecture_support() {
        assert!(Architecture::X86_64.is_supported());
        assert!(Architecture::AArch64.is_supported());
        assert!(!Architecture::Mips32.is_supported());
        assert!(!Architecture::Unknown.is_supported());
        assert_eq!(Architecture::AArch64.fixed_width(), Some(4));
        assert_eq!(Architecture::X86_64.fixed_width(), None);
    }

    #[test]
    fn test_architecture_serde_tags() {
        assert_eq!(serde_json::to_string(&Architecture::X86_64).unwrap(), "\"amd64\"");
        assert_eq!(serde_json::to_string(&Architecture::AArch64).unwrap(), "\"arm64\"");
    }
}
