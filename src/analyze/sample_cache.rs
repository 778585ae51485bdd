//! Per-step cache of the profile's call-chain and symbol tables.
//!
//! Resolving a call-chain touches `perf_callchain` and `perf_files` once per
//! frame, so both tables are read in full the first time a chain is resolved
//! and kept for the rest of the step. A cache is tagged with the step it was
//! built for and lives no longer than the analyzer call that created it.

use std::cell::OnceCell;
use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use super::query::sqlite_value_to_i64;
use super::PerfDb;

/// Placeholder for frames whose symbol could not be found.
const UNKNOWN: &str = "unknown";

/// One resolved frame of a sample's call-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallchainFrame {
    pub depth: i64,
    pub file_id: i64,
    pub path: String,
    pub symbol_id: i64,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy)]
struct CallchainRow {
    depth: i64,
    file_id: i64,
    symbol_id: i64,
}

#[derive(Debug)]
struct SymbolRow {
    symbol: String,
    path: String,
}

#[derive(Debug, Default)]
struct SampleTables {
    /// Frames per `callchain_id`, sorted by depth.
    callchains: HashMap<i64, Vec<CallchainRow>>,
    /// Symbols keyed by `(file_id, serial_id)`.
    files: HashMap<(i64, i64), SymbolRow>,
}

impl SampleTables {
    fn is_empty(&self) -> bool {
        self.callchains.is_empty()
    }
}

/// Lazily loaded call-chain lookup for one step.
pub struct SampleCache<'db> {
    step_id: String,
    db: &'db PerfDb,
    tables: OnceCell<SampleTables>,
}

impl<'db> SampleCache<'db> {
    pub fn new(step_id: impl Into<String>, db: &'db PerfDb) -> Self {
        Self {
            step_id: step_id.into(),
            db,
            tables: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.tables.get().is_some()
    }

    fn tables(&self) -> Result<&SampleTables> {
        if let Some(tables) = self.tables.get() {
            return Ok(tables);
        }
        let loaded = load_tables(self.db)?;
        debug!(
            "Cached {} call-chains and {} symbols for {}",
            loaded.callchains.len(),
            loaded.files.len(),
            self.step_id
        );
        Ok(self.tables.get_or_init(|| loaded))
    }

    /// Resolve `callchain_id` to its frames ordered by depth.
    ///
    /// Returns `None` when the chain is unknown or the profile has no
    /// call-chain data at all.
    pub fn resolve(&self, callchain_id: i64) -> Result<Option<Vec<CallchainFrame>>> {
        let tables = self.tables()?;
        if tables.is_empty() {
            return Ok(None);
        }
        let Some(rows) = tables.callchains.get(&callchain_id) else {
            return Ok(None);
        };
        let frames = rows
            .iter()
            .map(|row| {
                let (symbol, path) = match tables.files.get(&(row.file_id, row.symbol_id)) {
                    Some(found) => (found.symbol.clone(), found.path.clone()),
                    None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
                };
                CallchainFrame {
                    depth: row.depth,
                    file_id: row.file_id,
                    path,
                    symbol_id: row.symbol_id,
                    symbol,
                }
            })
            .collect();
        Ok(Some(frames))
    }
}

fn load_tables(db: &PerfDb) -> Result<SampleTables> {
    let mut tables = SampleTables::default();
    if !db.table_exists("perf_callchain")? || !db.table_exists("perf_files")? {
        warn!(
            "{} has no call-chain tables, samples will not be symbolized",
            db.path().display()
        );
        return Ok(tables);
    }

    let conn = db.connection();
    let mut stmt = conn.prepare(
        "SELECT id, callchain_id, depth, file_id, symbol_id FROM perf_callchain ORDER BY id",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let Some(callchain_id) = sqlite_value_to_i64(row.get_ref(1)?) else {
            continue;
        };
        tables
            .callchains
            .entry(callchain_id)
            .or_default()
            .push(CallchainRow {
                depth: sqlite_value_to_i64(row.get_ref(2)?).unwrap_or(0),
                file_id: sqlite_value_to_i64(row.get_ref(3)?).unwrap_or(-1),
                symbol_id: sqlite_value_to_i64(row.get_ref(4)?).unwrap_or(-1),
            });
    }
    for frames in tables.callchains.values_mut() {
        frames.sort_by_key(|f| f.depth);
    }

    let mut stmt = conn.prepare("SELECT file_id, serial_id, symbol, path FROM perf_files")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let (Some(file_id), Some(serial_id)) = (
            sqlite_value_to_i64(row.get_ref(0)?),
            sqlite_value_to_i64(row.get_ref(1)?),
        ) else {
            continue;
        };
        let symbol: Option<String> = row.get(2)?;
        let path: Option<String> = row.get(3)?;
        // First entry wins on duplicate keys.
        tables
            .files
            .entry((file_id, serial_id))
            .or_insert_with(|| SymbolRow {
                symbol: symbol.unwrap_or_else(|| UNKNOWN.to_string()),
                path: path.unwrap_or_else(|| UNKNOWN.to_string()),
            });
    }
    Ok(tables)
}
