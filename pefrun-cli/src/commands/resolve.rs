use std::{path::Path, sync::Arc};

use anyhow::Context;
use log::warn;
use pefrun::{
    bridge::{LibraryContext, LibraryRegistry, SymbolResolution},
    container::LoaderConfig,
    libraries::register_builtins,
    memory::AddressSpace,
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::load_container,
    output::{print_output, TabWriter},
};

#[derive(Debug, Serialize)]
struct Binding {
    library: String,
    symbol: String,
    class: String,
    weak: bool,
    resolution: String,
    target: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveOutput {
    bindings: Vec<Binding>,
    unresolved: usize,
    unresolved_weak: usize,
}

pub fn run(path: &Path, ui_head: Option<&Path>, opts: &GlobalOptions) -> anyhow::Result<()> {
    let container = load_container(path, LoaderConfig::new())?;
    let Some(loader) = container.loader_info()? else {
        println!("Container has no loader section");
        return Ok(());
    };

    let space = Arc::new(AddressSpace::default());
    let mut context = LibraryContext::new(space);
    if let Some(program) = ui_head {
        context = context.ui_head(program);
    }
    let registry = LibraryRegistry::new(context);
    register_builtins(&registry);

    let mut bindings = Vec::new();
    for library in &loader.libraries {
        let handle = match registry.load(&library.name) {
            Ok(handle) => Some(handle),
            Err(pefrun::Error::LibraryNotFound(_)) => {
                warn!("No built-in implementation of {}", library.name);
                None
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to load {}", library.name))
            }
        };

        for symbol in &library.symbols {
            let resolution = match handle {
                Some(handle) => registry.lookup(handle, &symbol.name)?,
                None => SymbolResolution::NotFound,
            };
            let (kind, target) = match resolution {
                SymbolResolution::Code(entry) => (
                    "code",
                    registry.entry_name(entry).map(str::to_string),
                ),
                SymbolResolution::Data(address) => ("data", Some(address.to_string())),
                SymbolResolution::NotFound => ("missing", None),
            };

            bindings.push(Binding {
                library: library.name.clone(),
                symbol: symbol.name.clone(),
                class: symbol.class.to_string(),
                weak: symbol.is_weak(),
                resolution: kind.to_string(),
                target,
            });
        }
    }

    let is_missing = |binding: &&Binding| binding.resolution == "missing";
    let unresolved = bindings
        .iter()
        .filter(is_missing)
        .filter(|binding| !binding.weak)
        .count();
    let unresolved_weak = bindings
        .iter()
        .filter(is_missing)
        .filter(|binding| binding.weak)
        .count();
    let output = ResolveOutput {
        bindings,
        unresolved,
        unresolved_weak,
    };

    registry.unload_all()?;

    print_output(&output, opts, |output| {
        let mut tw = TabWriter::new(&["Library", "Symbol", "Class", "Resolution", "Target"]);
        for binding in &output.bindings {
            let resolution = if binding.weak && binding.resolution == "missing" {
                "missing (weak)".to_string()
            } else {
                binding.resolution.clone()
            };
            tw.row(vec![
                binding.library.clone(),
                binding.symbol.clone(),
                binding.class.clone(),
                resolution,
                binding.target.clone().unwrap_or_default(),
            ]);
        }
        tw.print("");
        println!(
            "\n{} bindings, {} unresolved, {} unresolved weak",
            output.bindings.len(),
            output.unresolved,
            output.unresolved_weak
        );
    })
}
