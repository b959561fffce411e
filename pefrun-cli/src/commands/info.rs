use std::path::Path;

use pefrun::container::LoaderConfig;
use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_container, output::print_output};

#[derive(Debug, Serialize)]
pub struct ContainerInfo {
    pub architecture: String,
    pub format_version: u32,
    pub date_time_stamp: String,
    pub old_def_version: String,
    pub old_imp_version: String,
    pub current_version: String,
    pub section_count: u16,
    pub instantiated_section_count: u16,
    pub file_size: usize,
    pub imported_library_count: usize,
    pub imported_symbol_count: usize,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let container = load_container(path, LoaderConfig::new())?;
    let header = container.header();
    let loader = container.loader_info()?;

    let info = ContainerInfo {
        architecture: header.architecture.to_string(),
        format_version: header.format_version,
        date_time_stamp: format!("0x{:08X}", header.date_time_stamp),
        old_def_version: format!("0x{:08X}", header.old_def_version),
        old_imp_version: format!("0x{:08X}", header.old_imp_version),
        current_version: format!("0x{:08X}", header.current_version),
        section_count: header.section_count,
        instantiated_section_count: header.inst_section_count,
        file_size: container.data().len(),
        imported_library_count: loader.as_ref().map_or(0, |loader| loader.libraries.len()),
        imported_symbol_count: loader.as_ref().map_or(0, |loader| loader.imports().count()),
    };

    print_output(&info, opts, |info| {
        println!("Architecture:      {}", info.architecture);
        println!("Format version:    {}", info.format_version);
        println!("Timestamp:         {}", info.date_time_stamp);
        println!("Old def version:   {}", info.old_def_version);
        println!("Old imp version:   {}", info.old_imp_version);
        println!("Current version:   {}", info.current_version);
        println!("Sections:          {}", info.section_count);
        println!("Instantiated:      {}", info.instantiated_section_count);
        println!("File size:         {}", info.file_size);
        println!("Imported libraries: {}", info.imported_library_count);
        println!("Imported symbols:  {}", info.imported_symbol_count);
    })
}
