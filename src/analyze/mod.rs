//! Frame-quality and CPU-load analysis over converted trace databases.
//!
//! Each step of a captured run produces two SQLite files: `trace.db`, the
//! converted system trace with `frame_slice`, `process`, `thread` and
//! `callstack` tables, and `perf.db`, the sampling profile with
//! `perf_sample`, `perf_callchain` and `perf_files`. [`TraceDb`] and
//! [`PerfDb`] wrap read-only connections to them; the submodules add the
//! analyses as methods and free functions. All work is synchronous.

mod component_reuse;
mod empty_frames;
mod fps;
mod frames;
mod load;
mod query;
mod sample_cache;

#[cfg(test)]
pub(crate) mod fixtures;

pub use component_reuse::ComponentReuseResult;
pub use empty_frames::{
    EmptyFrameRecord, EmptyFrameResult, EmptyFrameSummary, TopEmptyFrames, TOP_FRAME_LIMIT,
};
pub use fps::{FpsStats, FpsTracker, FpsWindow, FPS_WINDOW_NS, LOW_FPS_THRESHOLD};
pub use frames::{
    classify_stutter, FrameRow, FrameStatistics, FrameStats, FrameType, FrameTypeStats,
    StutterDetail, StutterDetails, StutterLevel, StutterLevels, StutterResult, FRAME_INTERVAL_MS,
};
pub use load::{
    attribute_frame_load, is_vsync_callback_noise, FrameLoad, SampleCallchain, SampleIndex,
    VSYNC_NOISE_MAX_EVENTS,
};
pub use sample_cache::{CallchainFrame, SampleCache};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};

use crate::error::AnalyzeError;
use query::{sqlite_value_to_i64, sqlite_value_to_json};

/// Tables the empty-frame query joins across.
pub const EMPTY_FRAME_TABLES: &[&str] = &["frame_slice", "process", "thread", "callstack"];

/// Oldest SQLite release with common-table expressions.
const MIN_CTE_VERSION: (u32, u32, u32) = (3, 8, 3);

/// One row of `perf_sample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfSample {
    pub callchain_id: Option<i64>,
    /// Sample time on the trace clock, in nanoseconds.
    pub timestamp: i64,
    pub thread_id: i64,
    pub event_count: i64,
}

fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(AnalyzeError::MissingArtifact {
            path: path.to_path_buf(),
        }
        .into());
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(conn)
}

/// Read-only handle on a step's converted trace database.
pub struct TraceDb {
    conn: Connection,
    path: PathBuf,
}

impl TraceDb {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_read_only(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Fail with [`AnalyzeError::SchemaMismatch`] listing every absent table.
    pub fn require_tables(&self, tables: &[&str]) -> Result<()> {
        require_tables(&self.conn, tables)
    }

    /// Fail with [`AnalyzeError::SqliteTooOld`] if the engine cannot run `WITH` queries.
    pub fn require_cte_support(&self) -> Result<()> {
        let version: String = self
            .conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        if !version_at_least(&version, MIN_CTE_VERSION) {
            return Err(AnalyzeError::SqliteTooOld { version }.into());
        }
        Ok(())
    }

    /// The `runtime` entry of the `meta` table, if the converter recorded one.
    pub fn runtime(&self) -> Result<Option<serde_json::Value>> {
        if !table_exists(&self.conn, "meta")? {
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM meta WHERE name = 'runtime' LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let value = sqlite_value_to_json(row.get_ref(0)?);
                Ok((!value.is_null()).then_some(value))
            }
            None => Ok(None),
        }
    }

    /// Map of `process.ipid` to `process.name`.
    pub fn process_names(&self) -> Result<HashMap<i64, String>> {
        let mut names = HashMap::new();
        if !table_exists(&self.conn, "process")? {
            return Ok(names);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT ipid, name FROM process WHERE ipid IS NOT NULL")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(ipid) = sqlite_value_to_i64(row.get_ref(0)?) else {
                continue;
            };
            let name: Option<String> = row.get(1)?;
            names.insert(ipid, name.unwrap_or_default());
        }
        Ok(names)
    }
}

/// Read-only handle on a step's sampling-profile database.
pub struct PerfDb {
    conn: Connection,
    path: PathBuf,
}

impl PerfDb {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_read_only(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn table_exists(&self, table_name: &str) -> Result<bool> {
        table_exists(&self.conn, table_name)
    }

    /// Every sample in the profile. Rows without a usable timestamp or
    /// thread are dropped.
    pub fn load_samples(&self) -> Result<Vec<PerfSample>> {
        require_tables(&self.conn, &["perf_sample"])?;
        let mut stmt = self.conn.prepare(
            "SELECT callchain_id, timestamp_trace, thread_id, event_count \
             FROM perf_sample",
        )?;
        let mut rows = stmt.query([])?;
        let mut samples = Vec::new();
        while let Some(row) = rows.next()? {
            let (Some(timestamp), Some(thread_id)) = (
                sqlite_value_to_i64(row.get_ref(1)?),
                sqlite_value_to_i64(row.get_ref(2)?),
            ) else {
                continue;
            };
            samples.push(PerfSample {
                callchain_id: sqlite_value_to_i64(row.get_ref(0)?),
                timestamp,
                thread_id,
                event_count: sqlite_value_to_i64(row.get_ref(3)?).unwrap_or(0),
            });
        }
        Ok(samples)
    }

    /// Sum of `event_count` across the whole profile; `None` for an empty table.
    pub fn total_load(&self) -> Result<Option<i64>> {
        require_tables(&self.conn, &["perf_sample"])?;
        let total: Option<i64> =
            self.conn
                .query_row("SELECT SUM(event_count) FROM perf_sample", [], |row| {
                    row.get(0)
                })?;
        Ok(total)
    }
}

// -- Free functions (module-internal) --

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn require_tables(conn: &Connection, tables: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for table in tables {
        if !table_exists(conn, table)? {
            missing.push(table.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(AnalyzeError::SchemaMismatch { missing }.into());
    }
    Ok(())
}

fn version_at_least(version: &str, min: (u32, u32, u32)) -> bool {
    let mut parts = version
        .split('.')
        .map(|p| p.trim().parse::<u32>().unwrap_or(0));
    let found = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    found >= min
}

/// Round to four decimal places, the precision rates are reported with.
pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Round to two decimal places.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
