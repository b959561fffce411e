mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show pefrun info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("pefrun", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Info { path } => commands::info::run(path, &cli.global),
        Command::Sections { path, all } => commands::sections::run(path, *all, &cli.global),
        Command::Dump {
            path,
            section,
            offset,
            length,
        } => commands::dump::run(path, section, offset.as_deref(), *length, &cli.global),
        Command::Imports { path } => commands::imports::run(path, &cli.global),
        Command::Resolve { path, ui_head } => {
            commands::resolve::run(path, ui_head.as_deref(), &cli.global)
        }
    }
}
