use std::path::Path;

use anyhow::Context;
use pefrun::{container::LoaderConfig, Container};

/// Load a container with the given loader configuration.
pub fn load_container(path: &Path, config: LoaderConfig) -> anyhow::Result<Container> {
    Container::from_file_with_config(path, config)
        .with_context(|| format!("failed to load container: {}", path.display()))
}

/// Parse a hex (`0x` prefix) or decimal number.
pub fn parse_number(text: &str) -> anyhow::Result<usize> {
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number: {text}"))
}

/// Display name for a section, which may be unnamed.
pub fn section_display_name(name: &str) -> String {
    if name.is_empty() {
        "(unnamed)".to_string()
    } else {
        name.to_string()
    }
}
