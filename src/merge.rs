//! Fusion of prologue and call-site evidence into function candidates

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::callsite::{detect_call_sites, CallSite, Confidence, EdgeKind};
use crate::prologue::{detect_prologues, Prologue, PrologueKind};
use crate::{Address, AnalysisError, Architecture};

/// Which signals point at a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionKind {
    /// A prologue matched and nothing branches here
    PrologueOnly,
    /// Target of at least one resolved call, no prologue
    CallTarget,
    /// Target of resolved jumps only, no prologue
    JumpTarget,
    /// A prologue matched and resolved edges land here
    Both,
}

impl DetectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::PrologueOnly => "prologue-only",
            DetectionKind::CallTarget => "call-target",
            DetectionKind::JumpTarget => "jump-target",
            DetectionKind::Both => "both",
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A hypothesised function entry point with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCandidate {
    pub address: Address,
    pub detection: DetectionKind,
    /// Prologue pattern at this address, if any
    pub prologue: Option<PrologueKind>,
    /// Sources of resolved calls targeting this address
    pub called_from: BTreeSet<Address>,
    /// Sources of resolved jumps targeting this address
    pub jumped_from: BTreeSet<Address>,
    pub confidence: Confidence,
}

/// Ordered, address-unique candidate list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionCandidates(Vec<FunctionCandidate>);

impl FunctionCandidates {
    /// Candidate at exactly `address`
    pub fn at(&self, address: Address) -> Option<&FunctionCandidate> {
        self.0
            .binary_search_by_key(&address, |c| c.address)
            .ok()
            .map(|idx| &self.0[idx])
    }

    /// Candidates whose confidence is at least `level`, in address order
    pub fn with_min_confidence(&self, level: Confidence) -> impl Iterator<Item = &FunctionCandidate> + '_ {
        self.0.iter().filter(move |c| c.confidence >= level)
    }

    /// Number of candidates with the given detection kind
    pub fn count(&self, detection: DetectionKind) -> usize {
        self.0.iter().filter(|c| c.detection == detection).count()
    }
}

impl From<Vec<FunctionCandidate>> for FunctionCandidates {
    fn from(mut candidates: Vec<FunctionCandidate>) -> Self {
        candidates.sort_by_key(|c| c.address);
        candidates.dedup_by_key(|c| c.address);
        FunctionCandidates(candidates)
    }
}

impl Deref for FunctionCandidates {
    type Target = [FunctionCandidate];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for FunctionCandidates {
    type Item = FunctionCandidate;
    type IntoIter = std::vec::IntoIter<FunctionCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FunctionCandidates {
    type Item = &'a FunctionCandidate;
    type IntoIter = std::slice::Iter<'a, FunctionCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Default)]
struct Evidence {
    prologue: Option<PrologueKind>,
    called_from: BTreeSet<Address>,
    jumped_from: BTreeSet<Address>,
}

fn trust(kind: PrologueKind) -> u8 {
    if kind.establishes_frame() {
        2
    } else {
        1
    }
}

impl Evidence {
    fn add_prologue(&mut self, kind: PrologueKind) {
        match self.prologue {
            Some(existing) if trust(existing) >= trust(kind) => {}
            _ => self.prologue = Some(kind),
        }
    }

    fn into_candidate(self, address: Address) -> FunctionCandidate {
        let has_edges = !self.called_from.is_empty() || !self.jumped_from.is_empty();
        let (detection, confidence) = match self.prologue {
            Some(_) if has_edges => (DetectionKind::Both, Confidence::High),
            Some(kind) if kind.establishes_frame() => (DetectionKind::PrologueOnly, Confidence::High),
            Some(_) => (DetectionKind::PrologueOnly, Confidence::Medium),
            None if !self.called_from.is_empty() => (DetectionKind::CallTarget, Confidence::Medium),
            None => (DetectionKind::JumpTarget, Confidence::Low),
        };
        FunctionCandidate {
            address,
            detection,
            prologue: self.prologue,
            called_from: self.called_from,
            jumped_from: self.jumped_from,
            confidence,
        }
    }
}

/// Fuse prologues and edges from one run into ranked candidates.
///
/// Every address that carries a prologue or is the resolved target of an edge
/// appears exactly once, in ascending order. Unresolved edges are ignored.
/// No region filtering happens here; see [`filter_edges_to_region`].
pub fn merge_candidates(prologues: &[Prologue], edges: &[CallSite]) -> Vec<FunctionCandidate> {
    let mut evidence: BTreeMap<Address, Evidence> = BTreeMap::new();

    for p in prologues {
        evidence.entry(p.address).or_default().add_prologue(p.kind);
    }

    for edge in edges {
        let Some(target) = edge.target else { continue };
        let entry = evidence.entry(target).or_default();
        match edge.kind {
            EdgeKind::Call => entry.called_from.insert(edge.source),
            EdgeKind::Jump => entry.jumped_from.insert(edge.source),
        };
    }

    let candidates: Vec<FunctionCandidate> = evidence
        .into_iter()
        .map(|(address, ev)| ev.into_candidate(address))
        .collect();
    log::debug!(
        "Merged {} prologues and {} edges into {} candidates",
        prologues.len(),
        edges.len(),
        candidates.len()
    );
    candidates
}

/// Keep edges whose target lies inside `[base, base + len)`.
///
/// Unresolved edges carry no target and are kept.
pub fn filter_edges_to_region(edges: &[CallSite], base: Address, len: usize) -> Vec<CallSite> {
    let end = base.saturating_add(len as Address);
    edges
        .iter()
        .filter(|e| e.target.map_or(true, |t| t >= base && t < end))
        .cloned()
        .collect()
}

/// Run both detectors over `code` and merge their output.
pub fn detect_functions(code: &[u8], base: Address, arch: Architecture) -> Result<Vec<FunctionCandidate>, AnalysisError> {
    let prologues = detect_prologues(code, base, arch)?;
    let edges = detect_call_sites(code, base, arch)?;
    Ok(merge_candidates(&prologues, &edges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsite::AddressingMode;
    use rstest::rstest;

    fn prologue(address: Address, kind: PrologueKind) -> Prologue {
        Prologue::new(address, kind, kind.as_str())
    }

    fn edge(source: Address, target: Option<Address>, kind: EdgeKind, confidence: Confidence) -> CallSite {
        CallSite {
            source,
            target,
            kind,
            mode: if target.is_some() {
                AddressingMode::PcRelative
            } else {
                AddressingMode::RegisterIndirect
            },
            confidence,
        }
    }

    fn call(source: Address, target: Address) -> CallSite {
        edge(source, Some(target), EdgeKind::Call, Confidence::High)
    }

    fn jump(source: Address, target: Address) -> CallSite {
        edge(source, Some(target), EdgeKind::Jump, Confidence::Medium)
    }

    #[test]
    fn test_prologue_and_call_merge_to_both() {
        let candidates = merge_candidates(&[prologue(0x1000, PrologueKind::Classic)], &[call(0x2000, 0x1000)]);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.address, 0x1000);
        assert_eq!(c.detection, DetectionKind::Both);
        assert_eq!(c.confidence, Confidence::High);
        assert_eq!(c.prologue, Some(PrologueKind::Classic));
        assert!(c.called_from.contains(&0x2000));
    }

    #[rstest]
    #[case::classic(PrologueKind::Classic, Confidence::High)]
    #[case::stp_frame_pair(PrologueKind::StpFramePair, Confidence::High)]
    #[case::push_only(PrologueKind::PushOnly, Confidence::Medium)]
    #[case::no_frame_pointer(PrologueKind::NoFramePointer, Confidence::Medium)]
    #[case::sub_sp(PrologueKind::SubSp, Confidence::Medium)]
    #[case::stp_only(PrologueKind::StpOnly, Confidence::Medium)]
    fn test_prologue_only_confidence(#[case] kind: PrologueKind, #[case] confidence: Confidence) {
        let candidates = merge_candidates(&[prologue(0x40, kind)], &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].detection, DetectionKind::PrologueOnly);
        assert_eq!(candidates[0].confidence, confidence);
    }

    #[test]
    fn test_edge_only_candidates() {
        let candidates = merge_candidates(&[], &[call(0x10, 0x100), jump(0x20, 0x200), jump(0x30, 0x100)]);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].detection, DetectionKind::CallTarget);
        assert_eq!(candidates[0].confidence, Confidence::Medium);
        assert_eq!(candidates[0].jumped_from.iter().copied().collect::<Vec<_>>(), vec![0x30]);
        assert_eq!(candidates[1].detection, DetectionKind::JumpTarget);
        assert_eq!(candidates[1].confidence, Confidence::Low);
    }

    #[test]
    fn test_jump_into_prologue_is_both() {
        let candidates = merge_candidates(&[prologue(0x100, PrologueKind::SubSp)], &[jump(0x80, 0x100)]);
        assert_eq!(candidates[0].detection, DetectionKind::Both);
        assert_eq!(candidates[0].confidence, Confidence::High);
    }

    #[test]
    fn test_unresolved_edges_ignored() {
        let edges = [edge(0x10, None, EdgeKind::Call, Confidence::None)];
        assert!(merge_candidates(&[], &edges).is_empty());
    }

    #[test]
    fn test_duplicate_prologues_keep_trusted_kind() {
        // push rbp; mov rbp, rsp at the start of a buffer fires push-only and classic
        let prologues = [
            prologue(0, PrologueKind::PushOnly),
            prologue(0, PrologueKind::Classic),
            prologue(0x20, PrologueKind::StpFramePair),
            prologue(0x20, PrologueKind::StpOnly),
        ];
        let candidates = merge_candidates(&prologues, &[]);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].prologue, Some(PrologueKind::Classic));
        assert_eq!(candidates[1].prologue, Some(PrologueKind::StpFramePair));
    }

    #[test]
    fn test_unique_ascending_addresses() {
        let prologues = [
            prologue(0x300, PrologueKind::Classic),
            prologue(0x100, PrologueKind::PushOnly),
            prologue(0x100, PrologueKind::Classic),
        ];
        let edges = [
            call(0x500, 0x300),
            call(0x510, 0x300),
            jump(0x520, 0x200),
            call(0x530, 0x100),
            jump(0x540, 0x100),
        ];
        let candidates = merge_candidates(&prologues, &edges);
        let addresses: Vec<_> = candidates.iter().map(|c| c.address).collect();
        assert_eq!(addresses, vec![0x100, 0x200, 0x300]);
        assert_eq!(candidates[2].called_from.len(), 2);
    }

    #[test]
    fn test_filter_edges_to_region() {
        let edges = [
            call(0x1000, 0x1010),
            call(0x1004, 0x9000),
            jump(0x1008, 0x0fff),
            edge(0x100c, None, EdgeKind::Call, Confidence::None),
            call(0x1010, 0x1100),
        ];
        let kept = filter_edges_to_region(&edges, 0x1000, 0x100);
        let sources: Vec<_> = kept.iter().map(|e| e.source).collect();
        assert_eq!(sources, vec![0x1000, 0x100c]);
    }

    #[test]
    fn test_candidate_queries() {
        let candidates: FunctionCandidates = merge_candidates(
            &[prologue(0x10, PrologueKind::Classic), prologue(0x40, PrologueKind::PushOnly)],
            &[jump(0x0, 0x80)],
        )
        .into();
        assert_eq!(candidates.at(0x40).map(|c| c.detection), Some(DetectionKind::PrologueOnly));
        assert!(candidates.at(0x41).is_none());
        let strong: Vec<_> = candidates.with_min_confidence(Confidence::Medium).map(|c| c.address).collect();
        assert_eq!(strong, vec![0x10, 0x40]);
        assert_eq!(candidates.count(DetectionKind::PrologueOnly), 2);
        assert_eq!(candidates.count(DetectionKind::JumpTarget), 1);
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_detect_functions_end_to_end() {
        // 0x1000: call 0x1006; ret
        // 0x1006: push rbp; mov rbp, rsp; ret
        let code = [
            0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x55, 0x48, 0x89, 0xe5, 0xc3,
        ];
        let functions = detect_functions(&code, 0x1000, Architecture::X86_64).unwrap();
        let c = functions.iter().find(|c| c.address == 0x1006).unwrap();
        assert_eq!(c.detection, DetectionKind::Both);
        assert_eq!(c.confidence, Confidence::High);
        assert_eq!(c.prologue, Some(PrologueKind::Classic));
    }

    #[test]
    fn test_detect_functions_unsupported() {
        assert!(detect_functions(&[0x90], 0, Architecture::Ppc32).is_err());
    }
}
