//! Capstone-based instruction decoding and the resynchronizing instruction stream.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use capstone::arch::arm64::{Arm64OperandType, ArchMode as Arm64Mode};
use capstone::arch::x86::{ArchMode as X86Mode, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Capstone, RegId};

use crate::{Address, AnalysisError, Architecture, Decoder, Insn, Operand, MAX_INSTRUCTION_SIZE};

/// Encoded width of a CET marker (`endbr64`/`endbr32`).
const CET_MARKER_LEN: usize = 4;

thread_local! {
    // Capstone handles are not thread-safe, so every thread builds its own.
    static CS_POOL: RefCell<HashMap<Architecture, Capstone>> = RefCell::new(HashMap::new());
}

/// A Capstone-based decoder for the analysable ISAs.
///
/// The decoder itself only carries the architecture tag; the Capstone handle
/// lives in a per-thread pool, which keeps the decoder `Send + Sync` without
/// sharing a handle between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapstoneDecoder {
    arch: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Result<Self, AnalysisError> {
        match arch {
            Architecture::X86_64 | Architecture::AArch64 => {
                // initialisation failures surface here, not as decode misses
                CS_POOL.with(|cell| -> Result<(), AnalysisError> {
                    let mut pool = cell.borrow_mut();
                    if !pool.contains_key(&arch) {
                        pool.insert(arch, Self::build(arch)?);
                    }
                    Ok(())
                })?;
                Ok(CapstoneDecoder { arch })
            }
            Architecture::X86_32
            | Architecture::Arm
            | Architecture::Mips32
            | Architecture::RiscV64
            | Architecture::Ppc32
            | Architecture::Unknown => Err(AnalysisError::UnsupportedArchitecture(arch)),
        }
    }

    /// Build a detail-enabled Capstone handle
    fn build(arch: Architecture) -> Result<Capstone, AnalysisError> {
        let cs = match arch {
            Architecture::X86_64 => Capstone::new()
                .x86()
                .mode(X86Mode::Mode64)
                .detail(true)
                .build(),
            Architecture::AArch64 => Capstone::new()
                .arm64()
                .mode(Arm64Mode::Arm)
                .detail(true)
                .build(),
            other => return Err(AnalysisError::UnsupportedArchitecture(other)),
        };
        cs.map_err(|e| AnalysisError::DecoderError(format!("capstone init failed for {}: {}", arch, e)))
    }

    /// Decode with an already-built handle
    fn decode_with(cs: &Capstone, code: &[u8], address: Address) -> Option<Insn> {
        let insns = cs.disasm_count(code, address, 1).ok()?;
        let i = insns.iter().next()?;
        let size = i.bytes().len();
        if size == 0 || size > code.len() {
            return None;
        }

        let (mnemonic, prefixed) = normalize_mnemonic(i.mnemonic().unwrap_or(""));
        let op_str = i.op_str().unwrap_or("").to_string();

        let (mut operands, writeback) = match cs.insn_detail(i) {
            Ok(detail) => {
                let arch_detail = detail.arch_detail();
                let writeback = match &arch_detail {
                    ArchDetail::Arm64Detail(arm64) => Some(arm64.writeback()),
                    _ => None,
                };
                let operands: Vec<Operand> = arch_detail
                    .operands()
                    .into_iter()
                    .map(|op| convert_operand(cs, op))
                    .collect();
                (operands, writeback)
            }
            Err(_) => (Vec::new(), None),
        };
        if operands.is_empty() && !op_str.is_empty() {
            log::trace!("0x{:x}: no operand detail for '{} {}', parsing text", address, mnemonic, op_str);
            operands = parse_operands(&op_str);
        }
        if prefixed {
            log::trace!("0x{:x}: stripped prefix from '{}'", address, i.mnemonic().unwrap_or(""));
        }

        Some(Insn {
            addr: address,
            size: size as u8,
            mnemonic,
            op_str,
            operands,
            writeback,
        })
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

impl Decoder for CapstoneDecoder {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn decode(&self, code: &[u8], offset: usize, address: Address) -> Option<Insn> {
        if offset >= code.len() {
            return None;
        }

        // Only look at a small slice; a fixed-width ISA gets exactly one word.
        let window = self.arch.fixed_width().unwrap_or(MAX_INSTRUCTION_SIZE);
        let end = std::cmp::min(offset + window, code.len());
        let slice = &code[offset..end];

        CS_POOL.with(|cell| {
            let mut pool = cell.borrow_mut();
            if !pool.contains_key(&self.arch) {
                match Self::build(self.arch) {
                    Ok(cs) => {
                        pool.insert(self.arch, cs);
                    }
                    Err(e) => {
                        log::warn!("{}", e);
                        return None;
                    }
                }
            }
            let cs = pool.get(&self.arch)?;
            Self::decode_with(cs, slice, address)
        })
    }
}

/// Strip x86 branch prefixes capstone folds into the mnemonic.
fn normalize_mnemonic(raw: &str) -> (String, bool) {
    let mut m = raw.trim();
    let mut prefixed = false;
    for prefix in ["bnd ", "notrack "] {
        if let Some(rest) = m.strip_prefix(prefix) {
            m = rest.trim_start();
            prefixed = true;
        }
    }
    (m.to_lowercase(), prefixed)
}

fn reg_name(cs: &Capstone, reg: RegId) -> Option<String> {
    if reg.0 == 0 {
        return None;
    }
    cs.reg_name(reg).map(|name| name.to_lowercase())
}

fn convert_operand(cs: &Capstone, op: ArchOperand) -> Operand {
    match op {
        ArchOperand::X86Operand(op) => match op.op_type {
            X86OperandType::Reg(r) => reg_name(cs, r).map(Operand::Reg).unwrap_or(Operand::Other),
            X86OperandType::Imm(i) => Operand::Imm(i),
            X86OperandType::Mem(m) => Operand::Mem {
                base: reg_name(cs, m.base()),
                index: reg_name(cs, m.index()),
                disp: m.disp(),
            },
            _ => Operand::Other,
        },
        ArchOperand::Arm64Operand(op) => match op.op_type {
            Arm64OperandType::Reg(r) => reg_name(cs, r).map(Operand::Reg).unwrap_or(Operand::Other),
            Arm64OperandType::Imm(i) => Operand::Imm(i),
            Arm64OperandType::Mem(m) => Operand::Mem {
                base: reg_name(cs, m.base()),
                index: reg_name(cs, m.index()),
                disp: m.disp() as i64,
            },
            _ => Operand::Other,
        },
        _ => Operand::Other,
    }
}

/// Fallback operand parser over capstone's rendered operand string.
pub(crate) fn parse_operands(op_str: &str) -> Vec<Operand> {
    split_top_level(op_str)
        .into_iter()
        .map(|tok| parse_operand(tok.trim()))
        .collect()
}

/// Split on commas that are not inside brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(&s[start..]);
    }
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

fn parse_int(tok: &str) -> Option<i64> {
    let tok = tok.trim().trim_start_matches('#');
    let (neg, digits) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, tok),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if neg { value.wrapping_neg() } else { value })
}

fn parse_operand(tok: &str) -> Operand {
    if let (Some(l), Some(r)) = (tok.find('['), tok.rfind(']')) {
        let inside = &tok[l + 1..r];
        let mut base = None;
        let mut index = None;
        let mut disp = 0i64;
        // "rsp - 8", "rip + 0x2000", "sp, #-0x10", "rbx + rcx*8 + 0x10"
        let normalized = inside.replace(" - ", " + -").replace(',', " + ");
        for part in normalized.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(v) = parse_int(part) {
                disp = disp.wrapping_add(v);
            } else if base.is_none() {
                base = Some(part.to_lowercase());
            } else if index.is_none() {
                let reg = part.split('*').next().unwrap_or(part).trim();
                index = Some(reg.to_lowercase());
            }
        }
        return Operand::Mem { base, index, disp };
    }
    if let Some(v) = parse_int(tok) {
        return Operand::Imm(v);
    }
    if !tok.is_empty() && tok.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Operand::Reg(tok.to_lowercase());
    }
    Operand::Other
}

/// One step of a linear scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A successfully decoded instruction
    Insn(Insn),
    /// A CET marker (`endbr64`/`endbr32`) skipped as a unit. Transparent to
    /// pattern continuity.
    Marker { address: Address },
    /// A decode failure at `address`; the stream has already resynchronized.
    /// Callers drop any look-behind they were keeping.
    Invalid { address: Address },
}

/// Linear, resynchronizing walk over a code buffer.
///
/// Variable-length code resynchronizes one byte past a failure, fixed-width
/// code one instruction word past it. A trailing partial word on a
/// fixed-width ISA ends the stream.
pub struct InstructionStream<'a, D: Decoder + ?Sized> {
    decoder: &'a D,
    code: &'a [u8],
    base: Address,
    offset: usize,
}

impl<'a, D: Decoder + ?Sized> InstructionStream<'a, D> {
    /// Start a scan of `code` mapped at `base`
    pub fn new(decoder: &'a D, code: &'a [u8], base: Address) -> Self {
        Self {
            decoder,
            code,
            base,
            offset: 0,
        }
    }

    fn address(&self) -> Address {
        self.base.wrapping_add(self.offset as Address)
    }

    fn at_cet_marker(&self) -> bool {
        matches!(
            self.code.get(self.offset..self.offset + CET_MARKER_LEN),
            Some([0xf3, 0x0f, 0x1e, 0xfa]) | Some([0xf3, 0x0f, 0x1e, 0xfb])
        )
    }
}

impl<'a, D: Decoder + ?Sized> Iterator for InstructionStream<'a, D> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        let arch = self.decoder.architecture();
        let width = arch.fixed_width();
        let remaining = self.code.len().saturating_sub(self.offset);
        match width {
            Some(w) if remaining < w => return None,
            None if remaining == 0 => return None,
            _ => {}
        }

        let address = self.address();
        if width.is_none() && self.at_cet_marker() {
            self.offset += CET_MARKER_LEN;
            return Some(Step::Marker { address });
        }

        match self.decoder.decode(self.code, self.offset, address) {
            Some(insn) => {
                let advance = match width {
                    Some(w) => w,
                    None => insn.size as usize,
                };
                self.offset += advance.max(1);
                Some(Step::Insn(insn))
            }
            None => {
                let advance = width.unwrap_or(1);
                log::trace!("decode failure at 0x{:x}, resyncing {} byte(s)", address, advance);
                self.offset += advance;
                Some(Step::Invalid { address })
            }
        }
    }
}
