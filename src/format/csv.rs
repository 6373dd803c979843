//! CSV output formatter
//!
//! Each record kind gets its own table with a header row; tables are separated
//! by a blank line.

use ::csv::{Writer, WriterBuilder};

use super::{hex, Report, ResultFormatter};
use crate::{Analysis, AnalysisError};

fn csv_error(e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::Format(format!("CSV serialization error: {}", e))
}

fn new_writer() -> Writer<Vec<u8>> {
    WriterBuilder::new().from_writer(Vec::new())
}

fn finish(writer: Writer<Vec<u8>>) -> Result<String, AnalysisError> {
    let bytes = writer.into_inner().map_err(csv_error)?;
    String::from_utf8(bytes).map_err(csv_error)
}

fn prologue_table(analysis: &Analysis) -> Result<String, AnalysisError> {
    let base = hex(analysis.base_address);
    let mut w = new_writer();
    w.write_record(["base_address", "address", "type", "instructions"])
        .map_err(csv_error)?;
    for p in &analysis.prologues {
        w.write_record([base.as_str(), hex(p.address).as_str(), p.kind.as_str(), p.instructions.as_str()])
            .map_err(csv_error)?;
    }
    finish(w)
}

fn call_site_table(analysis: &Analysis) -> Result<String, AnalysisError> {
    let base = hex(analysis.base_address);
    let mut w = new_writer();
    w.write_record(["base_address", "source", "target", "kind", "mode", "confidence"])
        .map_err(csv_error)?;
    for e in &analysis.call_sites {
        let target = e.target.map(hex).unwrap_or_default();
        w.write_record([
            base.as_str(),
            hex(e.source).as_str(),
            target.as_str(),
            e.kind.as_str(),
            e.mode.as_str(),
            e.confidence.as_str(),
        ])
        .map_err(csv_error)?;
    }
    finish(w)
}

fn function_table(analysis: &Analysis) -> Result<String, AnalysisError> {
    let base = hex(analysis.base_address);
    let mut w = new_writer();
    w.write_record([
        "base_address",
        "address",
        "detection",
        "prologue",
        "confidence",
        "called_from",
        "jumped_from",
    ])
    .map_err(csv_error)?;
    for c in &analysis.functions {
        let join = |set: &std::collections::BTreeSet<u64>| set.iter().copied().map(hex).collect::<Vec<_>>().join(" ");
        w.write_record([
            base.as_str(),
            hex(c.address).as_str(),
            c.detection.as_str(),
            c.prologue.map(|k| k.as_str()).unwrap_or(""),
            c.confidence.as_str(),
            join(&c.called_from).as_str(),
            join(&c.jumped_from).as_str(),
        ])
        .map_err(csv_error)?;
    }
    finish(w)
}

impl ResultFormatter for super::CsvFormatter {
    fn format(&self, analysis: &Analysis, report: Report) -> Result<String, AnalysisError> {
        let mut tables = Vec::new();
        if report.prologues() {
            tables.push(prologue_table(analysis)?);
        }
        if report.calls() {
            tables.push(call_site_table(analysis)?);
        }
        if report.functions() {
            tables.push(function_table(analysis)?);
        }
        Ok(tables.join("\n"))
    }
}
