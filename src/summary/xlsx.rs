use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Format, Workbook};

use super::{SummaryColumn, SummaryTable, ROW_HEADER, SUMMARY_SHEET};

/// Write `table` as a single `Summary` sheet.
///
/// Row keys go in the first column and version columns follow; percentage
/// columns use the `0.00%` number format. Every column is as wide as its
/// longest rendered cell plus two.
pub fn write_summary_xlsx(table: &SummaryTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let percent = Format::new().set_num_format("0.00%");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SUMMARY_SHEET)?;

    sheet.write_string(0, 0, ROW_HEADER)?;
    for (row, key) in table.rows.iter().enumerate() {
        sheet.write_string(row as u32 + 1, 0, key.as_str())?;
    }
    let key_width = table
        .rows
        .iter()
        .map(|key| key.chars().count())
        .chain(std::iter::once(ROW_HEADER.len()))
        .max()
        .unwrap_or(0);
    sheet.set_column_width(0, (key_width + 2) as f64)?;

    for (index, column) in table.columns.iter().enumerate() {
        let col = index as u16 + 1;
        sheet.write_string(0, col, column.name.as_str())?;
        for (row, value) in column.values.iter().enumerate() {
            let Some(value) = *value else {
                continue;
            };
            let row = row as u32 + 1;
            if column.percent {
                sheet.write_number_with_format(row, col, value, &percent)?;
            } else {
                sheet.write_number(row, col, value)?;
            }
        }
        sheet.set_column_width(col, (column_width(column) + 2) as f64)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;
    Ok(())
}

fn column_width(column: &SummaryColumn) -> usize {
    column
        .values
        .iter()
        .flatten()
        .map(|v| render_cell(*v, column.percent).chars().count())
        .chain(std::iter::once(column.name.chars().count()))
        .max()
        .unwrap_or(0)
}

/// Text a cell displays as, used for sizing.
fn render_cell(value: f64, percent: bool) -> String {
    if percent {
        format!("{:.2}%", value * 100.0)
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
