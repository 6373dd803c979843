//! Goblin-based container adapter: locates the code section of an ELF, PE, or
//! Mach-O image and hands its bytes to the detectors.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};
use serde::Serialize;

use crate::prologue::{detect_prologues, Prologue};
use crate::{Address, AnalysisError, Architecture};

// Mach-O section flag bits
const SECTION_TYPE: u32 = 0x0000_00ff;
const S_ZEROFILL: u32 = 0x1;
const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

/// Container formats the adapter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerFormat {
    Elf,
    Pe,
    MachO,
}

impl ContainerFormat {
    /// Name of the section compilers put code in
    pub fn code_section_name(&self) -> &'static str {
        match self {
            ContainerFormat::Elf | ContainerFormat::Pe => ".text",
            ContainerFormat::MachO => "__text",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Elf => write!(f, "ELF"),
            ContainerFormat::Pe => write!(f, "PE"),
            ContainerFormat::MachO => write!(f, "Mach-O"),
        }
    }
}

/// A section header, reduced to what the adapter needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Virtual address the section is mapped at
    pub address: Address,
    /// File offset of the section's bytes
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Whether the section holds executable code
    pub executable: bool,
    /// False for sections that occupy no file space (`SHT_NOBITS`, zerofill)
    pub has_file_data: bool,
}

/// Metadata extracted from a binary container.
#[derive(Debug, Clone, Serialize)]
pub struct BinaryMetadata {
    /// Container format
    pub format: ContainerFormat,
    /// Target architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// All sections in header order
    pub sections: Vec<Section>,
}

impl BinaryMetadata {
    /// Find the section to analyse.
    ///
    /// The conventional code section wins; otherwise the first executable
    /// section with file data is used.
    pub fn code_section(&self) -> Result<&Section, AnalysisError> {
        let wanted = self.format.code_section_name();
        if let Some(section) = self.sections.iter().find(|s| s.name == wanted) {
            return Ok(section);
        }
        match self.sections.iter().find(|s| s.executable && s.has_file_data && s.size > 0) {
            Some(section) => {
                log::warn!(
                    "No {} section in {} image, falling back to executable section {}",
                    wanted,
                    self.format,
                    section.name
                );
                Ok(section)
            }
            None => Err(AnalysisError::SectionNotFound(wanted.to_string())),
        }
    }
}

/// A contiguous run of machine code and where it is mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion<'a> {
    pub architecture: Architecture,
    /// Virtual address of `code[0]`
    pub base_address: Address,
    /// Section the bytes came from, if any
    pub section: Option<String>,
    pub code: &'a [u8],
}

impl<'a> CodeRegion<'a> {
    /// A region over raw bytes with no container around them
    pub fn raw(code: &'a [u8], base_address: Address, architecture: Architecture) -> Self {
        Self {
            architecture,
            base_address,
            section: None,
            code,
        }
    }

    /// Slice `data` to the code section named by `meta`.
    pub fn from_metadata(meta: &BinaryMetadata, data: &'a [u8]) -> Result<Self, AnalysisError> {
        let section = meta.code_section()?;
        let unreadable = |reason: String| AnalysisError::SectionUnreadable {
            name: section.name.clone(),
            reason,
        };

        if !section.has_file_data {
            return Err(unreadable("section occupies no file space".into()));
        }
        let start = usize::try_from(section.offset).map_err(|_| unreadable("offset out of range".into()))?;
        let end = section
            .offset
            .checked_add(section.size)
            .and_then(|end| usize::try_from(end).ok())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                unreadable(format!(
                    "range 0x{:x}+0x{:x} exceeds file size 0x{:x}",
                    section.offset,
                    section.size,
                    data.len()
                ))
            })?;

        Ok(Self {
            architecture: meta.architecture,
            base_address: section.address,
            section: Some(section.name.clone()),
            code: &data[start..end],
        })
    }
}

/// Common interface for container parsers.
pub trait BinaryParser {
    /// Parse the container headers
    fn metadata(&self, data: &[u8]) -> Result<BinaryMetadata, AnalysisError>;
}

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: elf::Elf) -> BinaryMetadata {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            elf::header::EM_MIPS => Architecture::Mips32,
            elf::header::EM_PPC => Architecture::Ppc32,
            elf::header::EM_RISCV if elf.is_64 => Architecture::RiscV64,
            _ => Architecture::Unknown,
        };

        let sections = elf
            .section_headers
            .iter()
            .map(|sh| Section {
                name: elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string(),
                address: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
                executable: sh.is_executable(),
                has_file_data: sh.sh_type != elf::section_header::SHT_NOBITS,
            })
            .collect();

        BinaryMetadata {
            format: ContainerFormat::Elf,
            architecture: arch,
            entry_point: Some(elf.entry),
            sections,
        }
    }

    /// Parse a PE image. Section addresses are rebased onto the image base.
    fn parse_pe(&self, pe: pe::PE<'_>) -> Result<BinaryMetadata, AnalysisError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };
        let image_base = pe.image_base as u64;
        let rebase = |rva: u64| {
            image_base.checked_add(rva).ok_or_else(|| {
                AnalysisError::MalformedContainer(format!(
                    "RVA 0x{:x} overflows image base 0x{:x}",
                    rva, image_base
                ))
            })
        };

        let sections = pe
            .sections
            .iter()
            .map(|sect| {
                // Raw data is padded to the file alignment; the virtual size is exact.
                let size = match sect.virtual_size {
                    0 => sect.size_of_raw_data,
                    vs => vs.min(sect.size_of_raw_data),
                };
                Ok(Section {
                    name: sect.name().unwrap_or("").to_string(),
                    address: rebase(sect.virtual_address as u64)?,
                    offset: sect.pointer_to_raw_data as u64,
                    size: size as u64,
                    executable: (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0,
                    has_file_data: sect.size_of_raw_data > 0,
                })
            })
            .collect::<Result<Vec<_>, AnalysisError>>()?;

        Ok(BinaryMetadata {
            format: ContainerFormat::Pe,
            architecture: arch,
            entry_point: Some(rebase(pe.entry as u64)?),
            sections,
        })
    }

    /// Parse a single-architecture Mach-O binary
    fn parse_macho(&self, macho: &MachO) -> BinaryMetadata {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let sections = macho
            .segments
            .sections()
            .flatten()
            .filter_map(|res| res.ok())
            .map(|(sec, _)| Section {
                name: sec.name().unwrap_or("").to_string(),
                address: sec.addr,
                offset: sec.offset as u64,
                size: sec.size,
                executable: sec.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0,
                has_file_data: sec.flags & SECTION_TYPE != S_ZEROFILL,
            })
            .collect();

        BinaryMetadata {
            format: ContainerFormat::MachO,
            architecture: arch,
            entry_point: Some(macho.entry),
            sections,
        }
    }

    /// Parse the container and slice out its code section.
    pub fn parse<'a>(&self, data: &'a [u8]) -> Result<CodeRegion<'a>, AnalysisError> {
        let meta = self.metadata(data)?;
        let region = CodeRegion::from_metadata(&meta, data)?;
        log::debug!(
            "{} {} image: {} at 0x{:x}, {} bytes",
            meta.format,
            meta.architecture,
            region.section.as_deref().unwrap_or("?"),
            region.base_address,
            region.code.len()
        );
        Ok(region)
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn metadata(&self, data: &[u8]) -> Result<BinaryMetadata, AnalysisError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => Ok(self.parse_elf(elf)),
            Ok(Object::PE(pe)) => self.parse_pe(pe),
            Ok(Object::Mach(Mach::Binary(macho))) => Ok(self.parse_macho(&macho)),
            Ok(Object::Mach(Mach::Fat(_))) => Err(AnalysisError::UnsupportedFormat(
                "fat Mach-O (extract a single architecture first)".into(),
            )),
            Ok(_) => Err(AnalysisError::UnsupportedFormat("not an ELF, PE, or Mach-O image".into())),
            Err(e) => Err(AnalysisError::MalformedContainer(e.to_string())),
        }
    }
}

/// Rewind `reader` and read the whole image.
pub(crate) fn read_image<R: Read + Seek>(mut reader: R) -> Result<Vec<u8>, AnalysisError> {
    reader.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

/// Parse a container from `reader`, extract its code section, and detect
/// prologues in it. The architecture comes from the container header.
pub fn detect_prologues_from_reader<R: Read + Seek>(reader: R) -> Result<Vec<Prologue>, AnalysisError> {
    let data = read_image(reader)?;
    let region = GoblinParser::new().parse(&data)?;
    detect_prologues(region.code, region.base_address, region.architecture)
}
