//! Cross-run summary.
//!
//! Every `summary_info.json` under a reports root is merged into one pivot
//! table: one row per scene step, one column per `rom_version+app_version`,
//! each cell the summed `count`. The first version column is the baseline;
//! every other column gets a `<column>_percent` companion holding
//! `(column - baseline) / baseline`.

mod xlsx;

pub use xlsx::write_summary_xlsx;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub const SUMMARY_INFO_JSON: &str = "summary_info.json";
pub const SUMMARY_XLSX: &str = "summary_pivot.xlsx";
pub const SUMMARY_SHEET: &str = "Summary";
pub const PERCENT_SUFFIX: &str = "_percent";

/// Header of the row-key column.
pub const ROW_HEADER: &str = "scene_name";

/// Deepest directory level searched for summary files.
const MAX_SCAN_DEPTH: usize = 16;

/// One entry of a `summary_info.json` file.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub rom_version: String,
    pub app_version: String,
    pub scene: String,
    pub step_id: String,
    pub step_name: String,
    pub count: f64,
}

impl SummaryRecord {
    /// Build a record from a JSON object. Returns `None` if a field is
    /// missing or has the wrong type.
    pub fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let text = |key: &str| match object.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        Some(Self {
            rom_version: text("rom_version")?,
            app_version: text("app_version")?,
            scene: text("scene")?,
            step_id: text("step_id")?,
            step_name: text("step_name")?,
            count: object.get("count")?.as_f64()?,
        })
    }

    pub fn version_key(&self) -> String {
        format!("{}+{}", self.rom_version, self.app_version)
    }

    pub fn row_key(&self) -> String {
        format!("{}步骤{}: {}", self.scene, self.step_id, self.step_name)
    }
}

/// A column of the summary table.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryColumn {
    pub name: String,
    /// `None` renders as an empty cell.
    pub values: Vec<Option<f64>>,
    pub percent: bool,
}

/// Pivoted summary: sorted row keys and the columns in output order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryTable {
    pub rows: Vec<String>,
    pub columns: Vec<SummaryColumn>,
}

impl SummaryTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&SummaryColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Value at `(row, column)`, if both exist and the cell is not empty.
    pub fn value(&self, row: &str, column: &str) -> Option<f64> {
        let index = self.rows.iter().position(|r| r == row)?;
        self.column(column)?.values[index]
    }
}

/// Load every `summary_info.json` below `root`, in path order.
///
/// Files that cannot be read or parsed are logged and skipped, as are
/// entries that are not objects.
pub fn collect_summary_records(root: &Path) -> Vec<SummaryRecord> {
    let mut records = Vec::new();
    for path in find_summary_files(root) {
        match read_summary_file(&path) {
            Ok(mut found) => records.append(&mut found),
            Err(e) => error!("Failed to read {}: {e:#}", path.display()),
        }
    }
    records
}

fn find_summary_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .max_depth(MAX_SCAN_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == SUMMARY_INFO_JSON)
        .map(|e| e.into_path())
        .collect()
}

fn read_summary_file(path: &Path) -> Result<Vec<SummaryRecord>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let objects: Vec<&Map<String, Value>> = match &value {
        Value::Object(object) => vec![object],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let object = item.as_object();
                if object.is_none() {
                    warn!("{} contains a non-object entry, skipped", path.display());
                }
                object
            })
            .collect(),
        _ => {
            warn!("{} has an unexpected layout, skipped", path.display());
            Vec::new()
        }
    };

    Ok(objects
        .into_iter()
        .filter_map(|object| {
            let record = SummaryRecord::from_object(object);
            if record.is_none() {
                warn!("{} has an incomplete record, skipped", path.display());
            }
            record
        })
        .collect())
}

/// Pivot records into rows (sorted) by version columns (first-seen order),
/// summing duplicate cells and filling gaps with zero.
pub fn build_pivot(records: &[SummaryRecord]) -> SummaryTable {
    let mut versions: Vec<String> = Vec::new();
    let mut version_index: HashMap<String, usize> = HashMap::new();
    let mut cells: BTreeMap<String, HashMap<usize, f64>> = BTreeMap::new();

    for record in records {
        let version = record.version_key();
        let column = *version_index.entry(version.clone()).or_insert_with(|| {
            versions.push(version);
            versions.len() - 1
        });
        *cells
            .entry(record.row_key())
            .or_default()
            .entry(column)
            .or_insert(0.0) += record.count;
    }

    let columns = versions
        .into_iter()
        .enumerate()
        .map(|(index, name)| SummaryColumn {
            name,
            values: cells
                .values()
                .map(|row| Some(row.get(&index).copied().unwrap_or(0.0)))
                .collect(),
            percent: false,
        })
        .collect();

    SummaryTable {
        rows: cells.into_keys().collect(),
        columns,
    }
}

/// Append a `<column>_percent` column for every column after the baseline.
///
/// A zero baseline leaves the cell empty. With fewer than two columns the
/// table is left unchanged.
pub fn add_percentage_columns(table: &mut SummaryTable) {
    if table.is_empty() || table.columns.len() < 2 {
        warn!("Not enough data columns to compute percentages");
        return;
    }
    let baseline = table.columns[0].values.clone();
    let percent_columns: Vec<SummaryColumn> = table.columns[1..]
        .iter()
        .map(|column| SummaryColumn {
            name: format!("{}{PERCENT_SUFFIX}", column.name),
            values: column
                .values
                .iter()
                .zip(&baseline)
                .map(|(value, base)| match (value, base) {
                    (Some(v), Some(b)) if *b != 0.0 => Some((v - b) / b),
                    _ => None,
                })
                .collect(),
            percent: true,
        })
        .collect();
    table.columns.extend(percent_columns);
}

/// Build the summary table for everything below `input`.
pub fn summarize(input: &Path) -> SummaryTable {
    let records = collect_summary_records(input);
    let mut table = build_pivot(&records);
    add_percentage_columns(&mut table);
    table
}

/// Merge the summaries below `input` and write the spreadsheet to `output`
/// (default `<input>/summary_pivot.xlsx`).
pub fn create_summary_excel(input: &Path, output: Option<&Path>) -> bool {
    if !input.is_dir() {
        error!("Directory {} does not exist", input.display());
        return false;
    }
    let records = collect_summary_records(input);
    if records.is_empty() {
        error!("No {SUMMARY_INFO_JSON} data found under {}", input.display());
        return false;
    }
    let mut table = build_pivot(&records);
    add_percentage_columns(&mut table);
    if let Some(baseline) = table.columns.first().filter(|_| table.columns.len() > 1) {
        info!("Computed percentages relative to {}", baseline.name);
    }

    let output = output.map_or_else(|| input.join(SUMMARY_XLSX), Path::to_path_buf);
    match write_summary_xlsx(&table, &output) {
        Ok(()) => {
            info!("Summary written to {}", output.display());
            true
        }
        Err(e) => {
            error!("Failed to write summary {}: {e:#}", output.display());
            false
        }
    }
}
