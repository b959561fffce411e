use std::path::Path;

use pefrun::container::LoaderConfig;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{load_container, section_display_name},
    output::{print_output, TabWriter},
};

#[derive(Debug, Serialize)]
struct SectionEntry {
    index: usize,
    name: String,
    kind: String,
    share: String,
    alignment: u32,
    offset: String,
    packed_size: u32,
    unpacked_size: u32,
    total_size: u32,
    instantiated: bool,
}

pub fn run(path: &Path, all: bool, opts: &GlobalOptions) -> anyhow::Result<()> {
    let container = load_container(path, LoaderConfig::new().instantiate_all(all))?;
    let instantiated_count = usize::from(container.header().inst_section_count);
    let name_table = container.header().name_table_offset();

    let entries: Vec<SectionEntry> = container
        .section_headers()
        .iter()
        .enumerate()
        .map(|(index, header)| SectionEntry {
            index,
            name: header.name(container.data(), name_table),
            kind: header.section_kind.to_string(),
            share: header.share_kind.to_string(),
            alignment: header.alignment_bytes().unwrap_or(0),
            offset: format!("0x{:08X}", header.container_offset),
            packed_size: header.container_length,
            unpacked_size: header.unpacked_length,
            total_size: header.total_length,
            instantiated: index < instantiated_count
                || (all && header.section_kind.is_instantiable()),
        })
        .collect();

    print_output(&entries, opts, |entries| {
        let mut tw = TabWriter::new(&[
            "#", "Name", "Kind", "Share", "Align", "Offset", "Packed", "Unpacked", "Total", "Inst",
        ])
        .right_align(&[0, 4, 6, 7, 8]);
        for entry in entries {
            tw.row(vec![
                entry.index.to_string(),
                section_display_name(&entry.name),
                entry.kind.clone(),
                entry.share.clone(),
                entry.alignment.to_string(),
                entry.offset.clone(),
                entry.packed_size.to_string(),
                entry.unpacked_size.to_string(),
                entry.total_size.to_string(),
                if entry.instantiated { "yes" } else { "no" }.to_string(),
            ]);
        }
        tw.print("");
    })
}
