//! Python bindings for resurgo

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::format::{OutputFormat, Report};
use crate::{Analysis, AnalysisError, AnalysisOptions, Architecture};

fn to_py_err(e: AnalysisError) -> PyErr {
    match e {
        AnalysisError::IoError(io) => PyIOError::new_err(io.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn parse_arch(arch: &str) -> PyResult<Architecture> {
    arch.parse::<Architecture>().map_err(PyValueError::new_err)
}

fn render(analysis: &Analysis, output_format: &str, report: &str) -> PyResult<String> {
    let format = output_format
        .parse::<OutputFormat>()
        .map_err(PyValueError::new_err)?;
    let report = report.parse::<Report>().map_err(PyValueError::new_err)?;
    format
        .get_formatter()
        .format(analysis, report)
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Detect function prologues in raw machine code.
///
/// Returns a list of `(address, type, instructions)` tuples.
#[pyfunction]
#[pyo3(signature = (code, base=0, arch="amd64"))]
fn detect_prologues(code: Vec<u8>, base: u64, arch: &str) -> PyResult<Vec<(u64, String, String)>> {
    let arch = parse_arch(arch)?;
    let prologues = crate::detect_prologues(&code, base, arch).map_err(to_py_err)?;
    Ok(prologues
        .into_iter()
        .map(|p| (p.address, p.kind.as_str().to_string(), p.instructions))
        .collect())
}

/// Analyse raw machine code and return formatted results
#[pyfunction]
#[pyo3(signature = (code, base=0, arch="amd64", output_format="json", report="all"))]
fn analyze_bytes(
    py: Python<'_>,
    code: Vec<u8>,
    base: u64,
    arch: &str,
    output_format: &str,
    report: &str,
) -> PyResult<String> {
    let arch = parse_arch(arch)?;
    let analysis = py
        .allow_threads(|| crate::analyze(&code, base, arch, &AnalysisOptions::default()))
        .map_err(to_py_err)?;
    render(&analysis, output_format, report)
}

/// Analyse the code section of a binary on disk and return formatted results
#[pyfunction]
#[pyo3(signature = (file_path, output_format="text", report="all", keep_external_targets=false))]
fn analyze_file(
    py: Python<'_>,
    file_path: &str,
    output_format: &str,
    report: &str,
    keep_external_targets: bool,
) -> PyResult<String> {
    let options = AnalysisOptions {
        restrict_to_region: !keep_external_targets,
        ..AnalysisOptions::default()
    };
    let analysis = py
        .allow_threads(|| crate::analyze_file(file_path, &options))
        .map_err(to_py_err)?;
    render(&analysis, output_format, report)
}

/// Python module initialization
#[pymodule]
fn resurgo(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(detect_prologues, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_bytes, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_file, m)?)?;

    let py = m.py();
    let output_format = PyDict::new(py);
    output_format.set_item("TEXT", "text")?;
    output_format.set_item("JSON", "json")?;
    output_format.set_item("JSONL", "jsonl")?;
    output_format.set_item("CSV", "csv")?;
    m.setattr("OutputFormat", output_format)?;

    let report = PyDict::new(py);
    report.set_item("PROLOGUES", "prologues")?;
    report.set_item("CALLS", "calls")?;
    report.set_item("FUNCTIONS", "functions")?;
    report.set_item("ALL", "all")?;
    m.setattr("Report", report)?;

    Ok(())
}
