use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use resurgo::format::{OutputFormat, Report};
use resurgo::{analyze, analyze_file, AnalysisOptions, Architecture};

/// Recover function entry points from stripped machine code.
///
/// By default the input is an ELF, PE, or Mach-O image and its code section is
/// analysed. With `--arch` the input is treated as raw machine code instead.
#[derive(Parser, Debug)]
#[command(name = "resurgo", version, about, long_about = None)]
struct Cli {
    /// Binary (or raw code blob with --arch) to analyse
    input: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Which records to print
    #[arg(short, long, value_enum, default_value_t = Report::All)]
    report: Report,

    /// Treat the input as raw code for this architecture (amd64, arm64)
    #[arg(long)]
    arch: Option<String>,

    /// Virtual address of the first byte of a raw blob
    #[arg(long, value_parser = parse_address, default_value = "0", requires = "arch")]
    base: u64,

    /// Let calls and jumps that leave the code section create candidates
    #[arg(long, default_value_t = false)]
    keep_external_targets: bool,

    /// Run the detector passes one after the other
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // log records from the library are bridged through tracing-log
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = AnalysisOptions {
        restrict_to_region: !cli.keep_external_targets,
        parallel: !cli.sequential,
    };

    let analysis = match &cli.arch {
        Some(name) => {
            let arch: Architecture = name.parse().map_err(anyhow::Error::msg)?;
            if !arch.is_supported() {
                bail!("architecture {} is not supported (expected amd64 or arm64)", arch);
            }
            let code = fs::read(&cli.input).with_context(|| format!("Failed to read {}", cli.input.display()))?;
            analyze(&code, cli.base, arch, &options)
                .with_context(|| format!("Failed to analyse raw code in {}", cli.input.display()))?
        }
        None => analyze_file(&cli.input, &options)
            .with_context(|| format!("Failed to analyse {}", cli.input.display()))?,
    };

    let output = cli
        .format
        .get_formatter()
        .format(&analysis, cli.report)
        .context("Failed to format results")?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x401000").unwrap(), 0x401000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn test_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "resurgo",
            "blob.bin",
            "--arch",
            "arm64",
            "--base",
            "0x10000",
            "--format",
            "jsonl",
            "--report",
            "functions",
            "--keep-external-targets",
            "--sequential",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.arch.as_deref(), Some("arm64"));
        assert_eq!(cli.base, 0x10000);
        assert_eq!(cli.format, OutputFormat::JsonLines);
        assert_eq!(cli.report, Report::Functions);
        assert!(cli.keep_external_targets && cli.sequential);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_base_requires_arch() {
        assert!(Cli::try_parse_from(["resurgo", "a.out", "--base", "0x1000"]).is_err());
    }
}
