use std::path::Path;

use anyhow::{bail, Context};
use pefrun::container::{LoaderConfig, Section};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{load_container, parse_number, section_display_name},
    output::{hex_dump, print_output},
};

#[derive(Debug, Serialize)]
struct SectionDump {
    name: String,
    kind: String,
    offset: usize,
    length: usize,
    hex: String,
}

fn find_section<'a>(sections: &'a [Section], wanted: &str) -> Option<&'a Section> {
    sections
        .iter()
        .find(|section| section.name() == wanted)
        .or_else(|| sections.get(parse_number(wanted).ok()?))
}

pub fn run(
    path: &Path,
    section: &str,
    offset: Option<&str>,
    length: Option<usize>,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    // Raw sections are kept, so section indexes match the section table
    let container = load_container(path, LoaderConfig::new().instantiate_all(true))?;
    let target = find_section(container.sections(), section)
        .with_context(|| format!("no section named or numbered {section}"))?;
    let Some(data) = target.data() else {
        bail!("section {section} has no data");
    };

    let start = offset.map(parse_number).transpose()?.unwrap_or(0);
    if start > data.len() {
        bail!("offset {start} is past the {}-byte section", data.len());
    }
    let end = length.map_or(data.len(), |length| {
        start.saturating_add(length).min(data.len())
    });
    let bytes = &data[start..end];

    let dump = SectionDump {
        name: target.name().to_string(),
        kind: target.kind().to_string(),
        offset: start,
        length: bytes.len(),
        hex: bytes.iter().map(|byte| format!("{byte:02x}")).collect(),
    };

    print_output(&dump, opts, |dump| {
        println!(
            "{} ({}), {} bytes at offset 0x{:X}:",
            section_display_name(&dump.name),
            dump.kind,
            dump.length,
            dump.offset
        );
        hex_dump(bytes, start);
    })
}
