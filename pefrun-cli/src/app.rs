use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pefrun - classic Mac OS PEF container inspection and import resolution
#[derive(Debug, Parser)]
#[command(name = "pefrun", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display the container header: architecture, versions, timestamp and section counts.
    Info {
        /// Path to the PEF container.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List the section table.
    Sections {
        /// Path to the PEF container.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Instantiate every instantiable section, not only the instantiated prefix.
        #[arg(short, long)]
        all: bool,
    },

    /// Hex-dump a section as it looks after instantiation.
    Dump {
        /// Path to the PEF container.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Section name or index.
        #[arg(value_name = "SECTION")]
        section: String,

        /// Start offset within the section (hex like 0x40 or decimal).
        #[arg(long, value_name = "OFFSET")]
        offset: Option<String>,

        /// Number of bytes to dump.
        #[arg(short, long, value_name = "BYTES")]
        length: Option<usize>,
    },

    /// List imported libraries and symbols from the loader section.
    Imports {
        /// Path to the PEF container.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Resolve the container's imports against the built-in libraries.
    Resolve {
        /// Path to the PEF container.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// UI helper program to attach to InterfaceLib.
        #[arg(long, value_name = "PROGRAM")]
        ui_head: Option<PathBuf>,
    },
}
