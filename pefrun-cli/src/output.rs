use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Print `data` as JSON (if `--json`) or call `display_fn` for human-readable output.
pub fn print_output<T: Serialize>(
    data: &T,
    opts: &GlobalOptions,
    display_fn: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if opts.json {
        let json = serde_json::to_string_pretty(data)?;
        println!("{json}");
    } else {
        display_fn(data);
    }
    Ok(())
}

/// Whitespace-aligned table for terminal output, two spaces between columns.
pub struct TabWriter {
    table: Table,
}

impl TabWriter {
    /// A table of left-aligned columns under `headers`.
    pub fn new(headers: &[&str]) -> Self {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(headers.to_vec());

        let last = headers.len().saturating_sub(1);
        for (index, column) in table.column_iter_mut().enumerate() {
            column.set_padding((u16::from(index != 0), u16::from(index != last)));
        }
        Self { table }
    }

    /// Right-align the numeric columns at `indices`.
    pub fn right_align(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            if let Some(column) = self.table.column_mut(index) {
                column.set_cell_alignment(CellAlignment::Right);
            }
        }
        self
    }

    pub fn row(&mut self, values: Vec<String>) {
        self.table.add_row(values);
    }

    /// Print to stdout, each line prefixed with `indent`.
    pub fn print(&self, indent: &str) {
        print!("{}", self.render(indent));
    }

    fn render(&self, indent: &str) -> String {
        self.table
            .to_string()
            .lines()
            .map(|line| format!("{indent}{}\n", line.trim_end()))
            .collect()
    }
}

/// Classic 16-bytes-per-line hex dump, addresses relative to `base`.
pub fn hex_dump(data: &[u8], base: usize) {
    for (index, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02X}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|byte| {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    char::from(*byte)
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:08X}  {:<47}  {ascii}", base + index * 16, hex.join(" "));
    }
}
