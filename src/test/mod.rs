//! Shared factories for unit tests.

use std::sync::Arc;

use crate::{
    container::{
        loader::SymbolClass, pattern::PatternEncoder, ContainerBuilder, LoaderSectionBuilder,
        SectionHeader, SectionKind, SectionSpec, ShareKind,
    },
    memory::{AddressSpace, AddressSpaceConfig},
};

// Helper function to create a SectionHeader
pub fn section_header(
    kind: SectionKind,
    offset: u32,
    packed: u32,
    unpacked: u32,
    execution: u32,
    alignment: u8,
) -> SectionHeader {
    SectionHeader {
        name_offset: -1,
        default_address: 0,
        total_length: execution,
        unpacked_length: unpacked,
        container_length: packed,
        container_offset: offset,
        section_kind: kind,
        share_kind: ShareKind::ProcessShare,
        alignment,
    }
}

// Helper function to create a loader section; symbols are (name, class bits, weak)
pub fn loader_section(imports: &[(&str, &[(&str, u8, bool)])]) -> Vec<u8> {
    let mut builder = LoaderSectionBuilder::new();
    for (library, symbols) in imports {
        let symbols: Vec<(&str, SymbolClass, bool)> = symbols
            .iter()
            .map(|(name, class, weak)| {
                (
                    *name,
                    SymbolClass::from_bits(*class).unwrap_or(SymbolClass::Code),
                    *weak,
                )
            })
            .collect();
        builder.import(library, &symbols);
    }
    builder.build()
}

// Helper function to create a container with a code, a pattern data and a loader section
pub fn crafted_container() -> Vec<u8> {
    let mut code = vec![0x7C, 0x08, 0x02, 0xA6];
    code.resize(32, 0x60);

    let mut pattern = PatternEncoder::new();
    pattern
        .block_copy(&[0xDE, 0xAD, 0xBE, 0xEF])
        .repeat_block(&[1, 2, 3, 4], 2);

    let loader = loader_section(&[("StdCLib", &[("printf", 2, false), ("errno", 1, false)])]);

    let mut builder = ContainerBuilder::new();
    builder
        .section("code", SectionKind::Code, code)
        .add(SectionSpec::pattern("data", pattern.finish(), 16, 64))
        .add(SectionSpec {
            name: None,
            ..SectionSpec::raw("", SectionKind::Loader, loader)
        });
    builder.build()
}

// Helper function to create a small shared address space
pub fn address_space() -> Arc<AddressSpace> {
    Arc::new(AddressSpace::new(
        AddressSpaceConfig::new().base(0x1000_0000).limit(1024 * 1024),
    ))
}
