//! Output format module implementation

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use clap::ValueEnum;

use crate::{Analysis, AnalysisError};

/// Supported output formats for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON format (one document)
    Json,
    /// JSON Lines format (one JSON object per record)
    #[value(name = "jsonl", alias = "jsonlines")]
    JsonLines,
    /// CSV format (one table per record kind)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ResultFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Which record kinds to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Report {
    Prologues,
    Calls,
    Functions,
    #[default]
    All,
}

impl Report {
    pub fn prologues(&self) -> bool {
        matches!(self, Report::Prologues | Report::All)
    }

    pub fn calls(&self) -> bool {
        matches!(self, Report::Calls | Report::All)
    }

    pub fn functions(&self) -> bool {
        matches!(self, Report::Functions | Report::All)
    }
}

impl FromStr for Report {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prologues" => Ok(Report::Prologues),
            "calls" | "call-sites" => Ok(Report::Calls),
            "functions" => Ok(Report::Functions),
            "all" => Ok(Report::All),
            _ => Err(format!("Unknown report: {}", s)),
        }
    }
}

/// Formatter trait for analysis output
pub trait ResultFormatter {
    /// Render the record kinds selected by `report`
    fn format(&self, analysis: &Analysis, report: Report) -> Result<String, AnalysisError>;
}

/// Format results as an aligned plain-text listing
pub struct TextFormatter;

/// Format results as one pretty-printed JSON document
pub struct JsonFormatter;

/// Format results as JSON Lines
pub struct JsonLinesFormatter;

/// Format results as CSV tables
pub struct CsvFormatter;

/// `0x`-prefixed lowercase hex, the address rendering every format shares
pub(crate) fn hex(address: crate::Address) -> String {
    format!("0x{:x}", address)
}

impl ResultFormatter for TextFormatter {
    fn format(&self, analysis: &Analysis, report: Report) -> Result<String, AnalysisError> {
        let mut out = String::new();
        let fmt_err = |e: fmt::Error| AnalysisError::Format(e.to_string());

        write!(
            out,
            "{} code at 0x{:08x}",
            analysis.architecture, analysis.base_address
        )
        .map_err(fmt_err)?;
        match &analysis.section {
            Some(name) => writeln!(out, " ({}, {} bytes)", name, analysis.code_size),
            None => writeln!(out, " ({} bytes)", analysis.code_size),
        }
        .map_err(fmt_err)?;

        if report.prologues() {
            writeln!(out, "\nPrologues ({}):", analysis.prologues.len()).map_err(fmt_err)?;
            for p in &analysis.prologues {
                writeln!(out, "  0x{:08x}  {:<16} {}", p.address, p.kind, p.instructions).map_err(fmt_err)?;
            }
        }

        if report.calls() {
            writeln!(out, "\nCall sites ({}):", analysis.call_sites.len()).map_err(fmt_err)?;
            for e in &analysis.call_sites {
                let target = e
                    .target
                    .map(|t| format!("0x{:08x}", t))
                    .unwrap_or_else(|| "?".to_string());
                writeln!(
                    out,
                    "  0x{:08x}  {:<4} {:<17} {:<6} -> {}",
                    e.source, e.kind, e.mode, e.confidence, target
                )
                .map_err(fmt_err)?;
            }
        }

        if report.functions() {
            writeln!(out, "\nFunctions ({}):", analysis.functions.len()).map_err(fmt_err)?;
            for c in &analysis.functions {
                let prologue = c.prologue.map(|k| k.as_str()).unwrap_or("-");
                writeln!(
                    out,
                    "  0x{:08x}  {:<13} {:<6} {:<16} calls: {}  jumps: {}",
                    c.address,
                    c.detection,
                    c.confidence,
                    prologue,
                    c.called_from.len(),
                    c.jumped_from.len()
                )
                .map_err(fmt_err)?;
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{analyze, AnalysisOptions, Architecture};

    /// `call 0x1006; ret; push rbp; mov rbp, rsp; call rax; ret` at 0x1000
    pub(crate) fn sample_analysis() -> Analysis {
        let code = [
            0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x55, 0x48, 0x89, 0xe5, 0xff, 0xd0, 0xc3,
        ];
        analyze(&code, 0x1000, Architecture::X86_64, &AnalysisOptions::default()).unwrap()
    }

    #[test]
    fn test_text_formatter_all() {
        let result = TextFormatter.format(&sample_analysis(), Report::All).unwrap();
        assert!(result.starts_with("x86-64 code at 0x00001000 (13 bytes)"));
        assert!(result.contains("Prologues (2):"));
        assert!(result.contains("0x00001006  classic"));
        assert!(result.contains("push rbp; mov rbp, rsp"));
        assert!(result.contains("Call sites (2):"));
        assert!(result.contains("-> 0x00001006"));
        assert!(result.contains("register-indirect"));
        assert!(result.contains("-> ?"));
        assert!(result.contains("Functions (1):"));
        assert!(result.contains("both"));
    }

    #[test]
    fn test_text_formatter_report_selection() {
        let result = TextFormatter.format(&sample_analysis(), Report::Functions).unwrap();
        assert!(!result.contains("Prologues"));
        assert!(!result.contains("Call sites"));
        assert!(result.contains("Functions (1):"));
    }

    #[test]
    fn test_format_selection() {
        let analysis = sample_analysis();
        for format in OutputFormat::available_formats() {
            let formatter = format.get_formatter();
            let out = formatter.format(&analysis, Report::All).unwrap();
            assert!(!out.is_empty(), "{} produced no output", format);
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSONL".parse::<OutputFormat>().unwrap(), OutputFormat::JsonLines);
        assert_eq!(OutputFormat::JsonLines.to_string(), "jsonl");
        assert!("ngram".parse::<OutputFormat>().is_err());
        assert_eq!("calls".parse::<Report>().unwrap(), Report::Calls);
        assert!(Report::All.prologues() && Report::All.calls() && Report::All.functions());
        assert!(!Report::Calls.functions());
    }
}
