// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Command-line interface parsing and argument validation.

use std::fs;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::Level;

use super::AssemblerOptions;
use crate::z80::SpectrumModel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const LONG_ABOUT: &str = "Z80/Z80N cross-assembler for ZX Spectrum targets.

The concatenated segment bytes are written to -o/--outfile, or next to the
source with a .bin extension. --list and --json add a listing file and a JSON
dump of the full compilation output. Settings given on the command line
override the ones read from --options.";

#[derive(Parser, Debug)]
#[command(
    name = "zxasm",
    version = VERSION,
    about = "Z80/Z80N cross-assembler for ZX Spectrum targets",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    /// Assembly source file
    pub source: PathBuf,
    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "FILE",
        long_help = "Binary output file. Defaults to the source name with a .bin extension."
    )]
    pub outfile: Option<PathBuf>,
    #[arg(long = "list", value_name = "FILE", long_help = "Write a listing file.")]
    pub list: Option<PathBuf>,
    #[arg(
        long = "json",
        value_name = "FILE",
        long_help = "Write the compilation output (segments, symbols, maps, diagnostics) as JSON."
    )]
    pub json: Option<PathBuf>,
    #[arg(
        short = 'D',
        long = "define",
        value_name = "NAME[=VAL]",
        action = ArgAction::Append,
        long_help = "Predefine a symbol (repeatable). If VAL is omitted, defaults to 1. VAL accepts #, $ and 0x hex prefixes."
    )]
    pub defines: Vec<String>,
    #[arg(
        long = "model",
        value_name = "MODEL",
        long_help = "Spectrum model used when the source has no .model pragma: Spectrum48, Spectrum128, SpectrumP3 or Next."
    )]
    pub model: Option<String>,
    #[arg(
        long = "start",
        value_name = "ADDR",
        long_help = "Start address of the first segment. Defaults to #8000."
    )]
    pub start: Option<String>,
    #[arg(
        long = "case-sensitive",
        action = ArgAction::SetTrue,
        long_help = "Treat symbol names as case-sensitive."
    )]
    pub case_sensitive: bool,
    #[arg(
        long = "flexible-defs",
        action = ArgAction::SetTrue,
        long_help = "Let .defb/.defw take strings and .defm/.defn/.defc take numbers."
    )]
    pub flexible_defs: bool,
    #[arg(
        long = "options",
        value_name = "FILE",
        long_help = "Read compilation options from a JSON file."
    )]
    pub options: Option<PathBuf>,
    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(long = "log-level", default_value_t = Level::WARN)]
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Invalid -D/--define value '{0}'; use NAME or NAME=VAL")]
    Define(String),
    #[error("Invalid address '{0}'; it must be a number between 0 and 65535")]
    Address(String),
    #[error("Unknown Spectrum model: '{0}'")]
    Model(String),
    #[error("cannot read options file {path}: {source}")]
    ReadOptions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid options file {path}: {source}")]
    ParseOptions {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a number with an optional `#`, `$` or `0x` hex prefix.
fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    let hex = text
        .strip_prefix('#')
        .or_else(|| text.strip_prefix('$'))
        .or_else(|| text.strip_prefix("0x"))
        .or_else(|| text.strip_prefix("0X"));
    match hex {
        Some(digits) => i64::from_str_radix(digits, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Split a `NAME[=VAL]` define.
pub fn parse_define(arg: &str) -> Result<(String, i64), CliError> {
    let (name, value) = match arg.split_once('=') {
        Some((name, value)) => {
            let value = parse_number(value).ok_or_else(|| CliError::Define(arg.to_string()))?;
            (name, value)
        }
        None => (arg, 1),
    };
    let name = name.trim();
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(CliError::Define(arg.to_string()));
    }
    Ok((name.to_string(), value))
}

pub fn parse_address(arg: &str) -> Result<u16, CliError> {
    parse_number(arg)
        .and_then(|value| u16::try_from(value).ok())
        .ok_or_else(|| CliError::Address(arg.to_string()))
}

/// Compilation options: the `--options` file, then the flags on top.
pub fn build_options(cli: &Cli) -> Result<AssemblerOptions, CliError> {
    let mut options = match &cli.options {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|source| CliError::ReadOptions {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| CliError::ParseOptions {
                path: path.clone(),
                source,
            })?
        }
        None => AssemblerOptions::default(),
    };
    for define in &cli.defines {
        let (name, value) = parse_define(define)?;
        options.predefined_symbols.insert(name, value);
    }
    if let Some(model) = &cli.model {
        let model =
            SpectrumModel::from_name(model).ok_or_else(|| CliError::Model(model.clone()))?;
        options.current_model = Some(model);
    }
    if let Some(start) = &cli.start {
        options.default_start_address = Some(parse_address(start)?);
    }
    if cli.case_sensitive {
        options.use_case_sensitive_symbols = true;
    }
    if cli.flexible_defs {
        options.flexible_def_pragmas = true;
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn cli_parses_outputs_and_flags() {
        let cli = Cli::parse_from([
            "zxasm",
            "prog.asm",
            "-o",
            "out.bin",
            "--list",
            "prog.lst",
            "-D",
            "DEBUG",
            "-D",
            "LEVEL=#10",
            "--model",
            "spectrum128",
            "--start",
            "0x6000",
            "--case-sensitive",
        ]);
        assert_eq!(cli.source, PathBuf::from("prog.asm"));
        assert_eq!(cli.outfile, Some(PathBuf::from("out.bin")));
        assert_eq!(cli.list, Some(PathBuf::from("prog.lst")));
        assert_eq!(cli.defines, vec!["DEBUG".to_string(), "LEVEL=#10".to_string()]);
        assert!(cli.case_sensitive);
        assert!(!cli.flexible_defs);
        assert_eq!(cli.log_level, Level::WARN);

        let options = build_options(&cli).expect("build options");
        assert_eq!(options.predefined_symbols["DEBUG"], 1);
        assert_eq!(options.predefined_symbols["LEVEL"], 0x10);
        assert_eq!(options.current_model, Some(SpectrumModel::Spectrum128));
        assert_eq!(options.default_start_address, Some(0x6000));
        assert!(options.use_case_sensitive_symbols);
    }

    #[test]
    fn cli_parses_log_level() {
        let cli = Cli::parse_from(["zxasm", "prog.asm", "--log-level", "debug"]);
        assert_eq!(cli.log_level, Level::DEBUG);
    }

    #[test]
    fn parse_define_rejects_bad_names_and_values() {
        assert!(matches!(parse_define("1ABC"), Err(CliError::Define(_))));
        assert!(matches!(parse_define("A=zz"), Err(CliError::Define(_))));
        assert_eq!(parse_define("big=$FFFF").unwrap(), ("big".to_string(), 0xFFFF));
    }

    #[test]
    fn parse_address_accepts_prefixes() {
        assert_eq!(parse_address("#8000").unwrap(), 0x8000);
        assert_eq!(parse_address("$4000").unwrap(), 0x4000);
        assert_eq!(parse_address("24576").unwrap(), 24576);
        let err = parse_address("70000").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid address '70000'; it must be a number between 0 and 65535"
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        let cli = Cli::parse_from(["zxasm", "prog.asm", "--model", "zx81"]);
        assert!(matches!(build_options(&cli), Err(CliError::Model(name)) if name == "zx81"));
    }

    #[test]
    fn flags_override_the_options_file() {
        let dir = create_temp_dir("options");
        let path = dir.join("options.json");
        fs::write(
            &path,
            r#"{ "maxLoopErrorsToReport": 4, "flexibleDefPragmas": false, "defaultStartAddress": 16384 }"#,
        )
        .expect("write options");
        let cli = Cli::parse_from([
            "zxasm",
            "prog.asm",
            "--options",
            path.to_str().expect("utf-8 path"),
            "--flexible-defs",
        ]);
        let options = build_options(&cli).expect("build options");
        assert_eq!(options.max_loop_errors_to_report, 4);
        assert_eq!(options.default_start_address, Some(0x4000));
        assert!(options.flexible_def_pragmas);
        let _ = fs::remove_dir_all(&dir);
    }

    fn create_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("test-tmp")
            .join(format!("zxasm-cli-{label}-{}-{nanos}", process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }
}
