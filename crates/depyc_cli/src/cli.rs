use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileVersionCli {
    Auto,
    #[value(name = "3.10")]
    V310,
    #[value(name = "3.11")]
    V311,
    #[value(name = "3.12")]
    V312,
    #[value(name = "3.13")]
    V313,
    #[value(name = "3.14")]
    V314,
}

#[derive(Parser)]
#[command(name = "depyc",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles a Python bytecode file
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a .pyc file, or a `dis` listing with --dump
    File {
        /// Path to the .pyc file or listing
        path: PathBuf,

        /// Output mode
        #[arg(long, value_enum, default_value_t = DecompileModeCli::Pseudo)]
        mode: DecompileModeCli,

        /// Select bytecode version (default: from the container header)
        #[arg(long, value_enum, default_value_t = DecompileVersionCli::Auto)]
        version: DecompileVersionCli,

        /// Decode an unknown magic number with the closest known version
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Treat the input as a textual `dis` listing
        #[arg(long, default_value_t = false)]
        dump: bool,

        /// Leave out `# unreconstructed:` comments
        #[arg(long, default_value_t = false)]
        no_markers: bool,

        /// Write the source here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the decompile report as JSON on stderr
        #[arg(long, default_value_t = false)]
        report: bool,
    },
}
