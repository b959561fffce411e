use std::path::Path;

use pefrun::container::{loader::LibraryOptions, LoaderConfig};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::load_container,
    output::{print_output, TabWriter},
};

#[derive(Debug, Serialize)]
struct ImportedSymbolEntry {
    name: String,
    class: String,
    weak: bool,
}

#[derive(Debug, Serialize)]
struct ImportedLibraryEntry {
    name: String,
    current_version: String,
    old_imp_version: String,
    weak: bool,
    init_before: bool,
    symbols: Vec<ImportedSymbolEntry>,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let container = load_container(path, LoaderConfig::new())?;
    let libraries: Vec<ImportedLibraryEntry> = match container.loader_info()? {
        Some(loader) => loader
            .libraries
            .iter()
            .map(|library| ImportedLibraryEntry {
                name: library.name.clone(),
                current_version: format!("0x{:08X}", library.current_version),
                old_imp_version: format!("0x{:08X}", library.old_imp_version),
                weak: library.options.contains(LibraryOptions::WEAK_IMPORT),
                init_before: library.options.contains(LibraryOptions::INIT_BEFORE),
                symbols: library
                    .symbols
                    .iter()
                    .map(|symbol| ImportedSymbolEntry {
                        name: symbol.name.clone(),
                        class: symbol.class.to_string(),
                        weak: symbol.is_weak(),
                    })
                    .collect(),
            })
            .collect(),
        None => Vec::new(),
    };

    print_output(&libraries, opts, |libraries| {
        if libraries.is_empty() {
            println!("Imports: none");
            return;
        }

        for library in libraries {
            let mut flags = Vec::new();
            if library.weak {
                flags.push("weak");
            }
            if library.init_before {
                flags.push("init-before");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            println!(
                "{} (version {}, compatible from {}){flags}: {} symbols",
                library.name,
                library.current_version,
                library.old_imp_version,
                library.symbols.len()
            );

            let mut tw = TabWriter::new(&["Symbol", "Class", "Weak"]);
            for symbol in &library.symbols {
                tw.row(vec![
                    symbol.name.clone(),
                    symbol.class.clone(),
                    if symbol.weak { "yes" } else { "" }.to_string(),
                ]);
            }
            tw.print("  ");
        }
    })
}
