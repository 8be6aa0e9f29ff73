use std::path::Path;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use depyc_lib::{DecompileMode, DecompileOptions, InputKind, PyVersion, VersionSelect};

use crate::cli::{Cli, DecompileCommand, DecompileModeCli, DecompileVersionCli, TopLevel};

mod cli;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn version_select(v: DecompileVersionCli) -> VersionSelect {
    match v {
        DecompileVersionCli::Auto => VersionSelect::Auto,
        DecompileVersionCli::V310 => VersionSelect::Fixed(PyVersion::V3_10),
        DecompileVersionCli::V311 => VersionSelect::Fixed(PyVersion::V3_11),
        DecompileVersionCli::V312 => VersionSelect::Fixed(PyVersion::V3_12),
        DecompileVersionCli::V313 => VersionSelect::Fixed(PyVersion::V3_13),
        DecompileVersionCli::V314 => VersionSelect::Fixed(PyVersion::V3_14),
    }
}

fn write_output(out: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = out.len(), "wrote output");
        }
        None => print!("{out}"),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, mode, version, force, dump, no_markers, output, report } => {
                let options = DecompileOptions {
                    mode: match mode {
                        DecompileModeCli::Pseudo => DecompileMode::Pseudo,
                        DecompileModeCli::Disasm => DecompileMode::Disasm,
                    },
                    version: version_select(version),
                    force,
                    input: if dump { InputKind::TextDump } else { InputKind::Auto },
                    markers: !no_markers,
                    ..DecompileOptions::default()
                };
                debug!(?options, "options");
                let bytes = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
                let display = path.display();

                if options.mode == DecompileMode::Disasm {
                    let listing = depyc_lib::decompile_with_options(&bytes, &options)
                        .with_context(|| format!("failed to disassemble {display}"))?;
                    return write_output(&listing, output.as_deref());
                }

                let decompiled = depyc_lib::decompile_full(&bytes, &options)
                    .with_context(|| format!("failed to decompile {display}"))?;
                write_output(&decompiled.source, output.as_deref())?;
                if report {
                    let json = serde_json::to_string_pretty(&decompiled.report)?;
                    eprintln!("{json}");
                }
                Ok(())
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
            Ok(())
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
