//! Whole-region analysis: both detector passes plus the merge, over raw bytes
//! or a parsed container.

use std::io::{Read, Seek};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::callsite::{detect_call_sites, CallSite};
use crate::merge::{filter_edges_to_region, merge_candidates, FunctionCandidates};
use crate::parser::{read_image, CodeRegion, GoblinParser};
use crate::prologue::{detect_prologues, Prologue};
use crate::{Address, AnalysisError, Architecture};

/// Knobs for [`analyze`] and the container entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Only let edges whose target lies inside the analysed region feed the
    /// merger. Calls into PLT stubs or other sections then produce no
    /// candidates. The returned `call_sites` list is never filtered.
    pub restrict_to_region: bool,
    /// Run the prologue and call-site passes on separate rayon workers
    pub parallel: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            restrict_to_region: true,
            parallel: true,
        }
    }
}

/// Everything the detectors found in one code region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub architecture: Architecture,
    pub base_address: Address,
    pub code_size: usize,
    /// Container section the code came from
    pub section: Option<String>,
    pub prologues: Vec<Prologue>,
    pub call_sites: Vec<CallSite>,
    pub functions: FunctionCandidates,
}

impl Analysis {
    /// Returns true if `address` lies inside the analysed bytes
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base_address && address - self.base_address < self.code_size as Address
    }
}

fn analyze_region(region: &CodeRegion<'_>, options: &AnalysisOptions) -> Result<Analysis, AnalysisError> {
    let CodeRegion {
        architecture,
        base_address,
        code,
        ..
    } = *region;
    let start = Instant::now();

    let (prologues, call_sites) = if options.parallel {
        rayon::join(
            || detect_prologues(code, base_address, architecture),
            || detect_call_sites(code, base_address, architecture),
        )
    } else {
        (
            detect_prologues(code, base_address, architecture),
            detect_call_sites(code, base_address, architecture),
        )
    };
    let prologues = prologues?;
    let call_sites = call_sites?;

    let functions = if options.restrict_to_region {
        let internal = filter_edges_to_region(&call_sites, base_address, code.len());
        merge_candidates(&prologues, &internal)
    } else {
        merge_candidates(&prologues, &call_sites)
    };

    log::debug!(
        "Analysed {} bytes at 0x{:x} in {:?}: {} prologues, {} call sites, {} candidates",
        code.len(),
        base_address,
        start.elapsed(),
        prologues.len(),
        call_sites.len(),
        functions.len()
    );

    Ok(Analysis {
        architecture,
        base_address,
        code_size: code.len(),
        section: region.section.clone(),
        prologues,
        call_sites,
        functions: functions.into(),
    })
}

/// Run both detectors over raw machine code and merge their output.
///
/// Results are identical whether or not `options.parallel` is set.
pub fn analyze(
    code: &[u8],
    base: Address,
    arch: Architecture,
    options: &AnalysisOptions,
) -> Result<Analysis, AnalysisError> {
    analyze_region(&CodeRegion::raw(code, base, arch), options)
}

/// Analyse independent regions in parallel. Results come back in input order,
/// one per region; a failing region does not affect the others.
pub fn analyze_regions(regions: &[CodeRegion<'_>], options: &AnalysisOptions) -> Vec<Result<Analysis, AnalysisError>> {
    regions
        .par_iter()
        .map(|region| analyze_region(region, options))
        .collect()
}

/// Parse a container from `reader` and analyse its code section.
pub fn analyze_reader<R: Read + Seek>(reader: R, options: &AnalysisOptions) -> Result<Analysis, AnalysisError> {
    let data = read_image(reader)?;
    let region = GoblinParser::new().parse(&data)?;
    analyze_region(&region, options)
}

/// Read a binary from disk and analyse its code section.
pub fn analyze_file<P: AsRef<Path>>(path: P, options: &AnalysisOptions) -> Result<Analysis, AnalysisError> {
    let data = std::fs::read(path.as_ref())?;
    log::debug!("Read {} bytes from {}", data.len(), path.as_ref().display());
    let region = GoblinParser::new().parse(&data)?;
    analyze_region(&region, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::DetectionKind;
    use crate::Confidence;
    use rstest::rstest;

    // 0x1000: call 0x1006        e8 01 00 00 00
    // 0x1005: ret                c3
    // 0x1006: push rbp           55
    // 0x1007: mov rbp, rsp       48 89 e5
    // 0x100a: call 0x9000        e8 f1 7f 00 00
    // 0x100f: ret                c3
    const PROGRAM: [u8; 16] = [
        0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x55, 0x48, 0x89, 0xe5, 0xe8, 0xf1, 0x7f, 0x00, 0x00, 0xc3,
    ];

    fn options(restrict_to_region: bool, parallel: bool) -> AnalysisOptions {
        AnalysisOptions {
            restrict_to_region,
            parallel,
        }
    }

    #[test]
    fn test_default_options() {
        let opts = AnalysisOptions::default();
        assert!(opts.restrict_to_region);
        assert!(opts.parallel);
        let parsed: AnalysisOptions = serde_json::from_str(r#"{"parallel": false}"#).unwrap();
        assert_eq!(parsed, options(true, false));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let parallel = analyze(&PROGRAM, 0x1000, Architecture::X86_64, &options(true, true)).unwrap();
        let sequential = analyze(&PROGRAM, 0x1000, Architecture::X86_64, &options(true, false)).unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_region_restriction() {
        let analysis = analyze(&PROGRAM, 0x1000, Architecture::X86_64, &AnalysisOptions::default()).unwrap();
        assert_eq!(analysis.call_sites.len(), 2);
        assert_eq!(analysis.call_sites[1].target, Some(0x9000));
        assert!(analysis.functions.at(0x9000).is_none());
        assert!(analysis.functions.iter().all(|c| analysis.contains(c.address)));

        let f = analysis.functions.at(0x1006).unwrap();
        assert_eq!(f.detection, DetectionKind::Both);
        assert_eq!(f.confidence, Confidence::High);
    }

    #[test]
    fn test_keep_external_targets() {
        let analysis = analyze(&PROGRAM, 0x1000, Architecture::X86_64, &options(false, true)).unwrap();
        let external = analysis.functions.at(0x9000).unwrap();
        assert_eq!(external.detection, DetectionKind::CallTarget);
        assert_eq!(external.called_from.iter().copied().collect::<Vec<_>>(), vec![0x100a]);
    }

    #[rstest]
    #[case(Architecture::Mips32)]
    #[case(Architecture::Unknown)]
    fn test_unsupported_architecture(#[case] arch: Architecture) {
        let err = analyze(&PROGRAM, 0, arch, &AnalysisOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn test_analyze_regions_keeps_order() {
        let arm = [0xfd, 0x7b, 0xbf, 0xa9, 0xfd, 0x03, 0x00, 0x91]; // stp x29, x30, [sp, #-16]!; mov x29, sp
        let regions = vec![
            CodeRegion::raw(&PROGRAM, 0x1000, Architecture::X86_64),
            CodeRegion::raw(&arm, 0x2000, Architecture::Ppc32),
            CodeRegion::raw(&arm, 0x3000, Architecture::AArch64),
        ];
        let results = analyze_regions(&regions, &AnalysisOptions::default());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().base_address, 0x1000);
        assert!(results[1].is_err());
        let arm_analysis = results[2].as_ref().unwrap();
        assert_eq!(arm_analysis.functions.len(), 1);
        assert_eq!(arm_analysis.functions[0].address, 0x3000);
    }

    #[test]
    fn test_empty_code() {
        let analysis = analyze(&[], 0x1000, Architecture::AArch64, &AnalysisOptions::default()).unwrap();
        assert!(analysis.prologues.is_empty());
        assert!(analysis.call_sites.is_empty());
        assert!(analysis.functions.is_empty());
        assert_eq!(analysis.code_size, 0);
    }

    #[test]
    fn test_missing_file() {
        let err = analyze_file("/nonexistent/resurgo/binary", &AnalysisOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::IoError(_)));
    }
}
