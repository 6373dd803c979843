//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use super::{hex, Report, ResultFormatter};
use crate::{Analysis, AnalysisError, CallSite, FunctionCandidate, Prologue};

/// Serializable prologue with a hex address
#[derive(Serialize)]
struct PrologueJson<'a> {
    address: String,
    #[serde(rename = "type")]
    kind: &'static str,
    instructions: &'a str,
}

/// Serializable call site with hex addresses
#[derive(Serialize)]
struct CallSiteJson {
    source: String,
    target: Option<String>,
    kind: &'static str,
    mode: &'static str,
    confidence: &'static str,
}

/// Serializable function candidate with hex addresses
#[derive(Serialize)]
struct FunctionJson {
    address: String,
    detection: &'static str,
    prologue: Option<&'static str>,
    called_from: Vec<String>,
    jumped_from: Vec<String>,
    confidence: &'static str,
}

/// Top-level JSON document
#[derive(Serialize)]
struct AnalysisJson<'a> {
    architecture: String,
    base_address: String,
    code_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    section: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prologues: Option<Vec<PrologueJson<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_sites: Option<Vec<CallSiteJson>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<Vec<FunctionJson>>,
}

fn prologue_to_json(p: &Prologue) -> PrologueJson<'_> {
    PrologueJson {
        address: hex(p.address),
        kind: p.kind.as_str(),
        instructions: &p.instructions,
    }
}

fn call_site_to_json(e: &CallSite) -> CallSiteJson {
    CallSiteJson {
        source: hex(e.source),
        target: e.target.map(hex),
        kind: e.kind.as_str(),
        mode: e.mode.as_str(),
        confidence: e.confidence.as_str(),
    }
}

fn function_to_json(c: &FunctionCandidate) -> FunctionJson {
    FunctionJson {
        address: hex(c.address),
        detection: c.detection.as_str(),
        prologue: c.prologue.map(|k| k.as_str()),
        called_from: c.called_from.iter().copied().map(hex).collect(),
        jumped_from: c.jumped_from.iter().copied().map(hex).collect(),
        confidence: c.confidence.as_str(),
    }
}

fn json_error(e: serde_json::Error) -> AnalysisError {
    AnalysisError::Format(format!("JSON serialization error: {}", e))
}

impl ResultFormatter for super::JsonFormatter {
    fn format(&self, analysis: &Analysis, report: Report) -> Result<String, AnalysisError> {
        let doc = AnalysisJson {
            architecture: analysis.architecture.to_string(),
            base_address: hex(analysis.base_address),
            code_size: analysis.code_size,
            section: analysis.section.as_deref(),
            prologues: report
                .prologues()
                .then(|| analysis.prologues.iter().map(prologue_to_json).collect()),
            call_sites: report
                .calls()
                .then(|| analysis.call_sites.iter().map(call_site_to_json).collect()),
            functions: report
                .functions()
                .then(|| analysis.functions.iter().map(function_to_json).collect()),
        };

        serde_json::to_string_pretty(&doc).map_err(json_error)
    }
}

impl ResultFormatter for super::JsonLinesFormatter {
    fn format(&self, analysis: &Analysis, report: Report) -> Result<String, AnalysisError> {
        let mut output = String::new();
        let base_addr_str = hex(analysis.base_address);
        let mut push = |value: serde_json::Value| -> Result<(), AnalysisError> {
            output.push_str(&serde_json::to_string(&value).map_err(json_error)?);
            output.push('\n');
            Ok(())
        };

        if report.prologues() {
            for p in &analysis.prologues {
                push(json!({
                    "type": "prologue",
                    "base_address": base_addr_str,
                    "address": hex(p.address),
                    "kind": p.kind.as_str(),
                    "instructions": p.instructions,
                }))?;
            }
        }

        if report.calls() {
            for e in &analysis.call_sites {
                push(json!({
                    "type": "call_site",
                    "base_address": base_addr_str,
                    "source": hex(e.source),
                    "target": e.target.map(hex),
                    "kind": e.kind.as_str(),
                    "mode": e.mode.as_str(),
                    "confidence": e.confidence.as_str(),
                }))?;
            }
        }

        if report.functions() {
            for c in &analysis.functions {
                let mut value = serde_json::to_value(function_to_json(c)).map_err(json_error)?;
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("type".into(), json!("function"));
                    obj.insert("base_address".into(), json!(base_addr_str));
                }
                push(value)?;
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::sample_analysis;
    use crate::format::{JsonFormatter, JsonLinesFormatter};
    use serde_json::Value;

    #[test]
    fn test_json_document() {
        let out = JsonFormatter.format(&sample_analysis(), Report::All).unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["architecture"], "x86-64");
        assert_eq!(doc["base_address"], "0x1000");
        assert_eq!(doc["prologues"][1]["type"], "classic");
        assert_eq!(doc["prologues"][1]["address"], "0x1006");
        assert_eq!(doc["call_sites"][0]["target"], "0x1006");
        assert!(doc["call_sites"][1]["target"].is_null());
        assert_eq!(doc["call_sites"][1]["mode"], "register-indirect");
        assert_eq!(doc["functions"][0]["detection"], "both");
        assert_eq!(doc["functions"][0]["called_from"][0], "0x1000");
        assert!(doc.get("section").is_none());
    }

    #[test]
    fn test_json_report_selection() {
        let out = JsonFormatter.format(&sample_analysis(), Report::Prologues).unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert!(doc.get("prologues").is_some());
        assert!(doc.get("call_sites").is_none());
        assert!(doc.get("functions").is_none());
    }

    #[test]
    fn test_json_lines() {
        let out = JsonLinesFormatter.format(&sample_analysis(), Report::All).unwrap();
        let records: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        // 2 prologues, 2 call sites, 1 function
        assert_eq!(records.len(), 5);
        let types: Vec<_> = records.iter().map(|r| r["type"].as_str().unwrap().to_string()).collect();
        assert_eq!(types, vec!["prologue", "prologue", "call_site", "call_site", "function"]);
        assert!(records.iter().all(|r| r["base_address"] == "0x1000"));
        assert_eq!(records[4]["confidence"], "high");
    }
}
