//! Synthetic trace and profile databases for unit tests.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tempfile::TempDir;

const TRACE_SCHEMA: &str = "
    CREATE TABLE frame_slice (
        id INTEGER PRIMARY KEY, ts INTEGER, dur INTEGER, ipid INTEGER, itid INTEGER,
        vsync INTEGER, type INTEGER, flag INTEGER, src TEXT, dst TEXT, callstack_id INTEGER
    );
    CREATE TABLE process (ipid INTEGER PRIMARY KEY, pid INTEGER, name TEXT);
    CREATE TABLE thread (
        itid INTEGER PRIMARY KEY, tid INTEGER, name TEXT, ipid INTEGER, is_main_thread INTEGER
    );
    CREATE TABLE callstack (id INTEGER PRIMARY KEY, name TEXT, ts INTEGER, dur INTEGER);
    CREATE TABLE meta (name TEXT, value TEXT);
";

const PERF_SCHEMA: &str = "
    CREATE TABLE perf_sample (
        id INTEGER PRIMARY KEY, callchain_id INTEGER, timestamp_trace INTEGER,
        thread_id INTEGER, event_count INTEGER
    );
    CREATE TABLE perf_callchain (
        id INTEGER PRIMARY KEY, callchain_id INTEGER, depth INTEGER,
        file_id INTEGER, symbol_id INTEGER
    );
    CREATE TABLE perf_files (
        id INTEGER PRIMARY KEY, file_id INTEGER, serial_id INTEGER, symbol TEXT, path TEXT
    );
";

/// One `frame_slice` row.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub ts: i64,
    pub dur: i64,
    pub ipid: Option<i64>,
    pub itid: Option<i64>,
    pub vsync: Option<i64>,
    pub kind: i64,
    pub flag: Option<i64>,
    pub callstack_id: Option<i64>,
}

impl Frame {
    /// An on-time actual frame (`type=0, flag=0`).
    pub fn actual(vsync: i64, ts: i64, dur: i64) -> Self {
        Self {
            ts,
            dur,
            ipid: None,
            itid: None,
            vsync: Some(vsync),
            kind: 0,
            flag: Some(0),
            callstack_id: None,
        }
    }

    /// An expected frame (`type=1`).
    pub fn expected(vsync: i64, ts: i64, dur: i64) -> Self {
        Self {
            kind: 1,
            flag: None,
            ..Self::actual(vsync, ts, dur)
        }
    }

    pub fn flag(mut self, flag: i64) -> Self {
        self.flag = Some(flag);
        self
    }

    pub fn ipid(mut self, ipid: i64) -> Self {
        self.ipid = Some(ipid);
        self
    }

    pub fn itid(mut self, itid: i64) -> Self {
        self.itid = Some(itid);
        self
    }

    pub fn callstack(mut self, id: i64) -> Self {
        self.callstack_id = Some(id);
        self
    }

    pub fn no_vsync(mut self) -> Self {
        self.vsync = None;
        self
    }
}

pub(crate) struct TraceFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl TraceFixture {
    /// A trace database with the full converter schema and no rows.
    pub fn new() -> Self {
        Self::with_schema(TRACE_SCHEMA)
    }

    /// A trace database with none of the expected tables.
    pub fn bare() -> Self {
        Self::with_schema("CREATE TABLE unrelated (x INTEGER);")
    }

    fn with_schema(schema: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.db");
        Connection::open(&path).unwrap().execute_batch(schema).unwrap();
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }

    pub fn add_process(&self, ipid: i64, pid: i64, name: &str) {
        self.conn()
            .execute(
                "INSERT INTO process (ipid, pid, name) VALUES (?1, ?2, ?3)",
                params![ipid, pid, name],
            )
            .unwrap();
    }

    pub fn add_thread(&self, itid: i64, tid: i64, name: &str, ipid: i64, is_main: bool) {
        self.conn()
            .execute(
                "INSERT INTO thread (itid, tid, name, ipid, is_main_thread) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![itid, tid, name, ipid, is_main as i64],
            )
            .unwrap();
    }

    pub fn add_callstack(&self, id: i64, name: &str) {
        self.conn()
            .execute(
                "INSERT INTO callstack (id, name, ts, dur) VALUES (?1, ?2, 0, 0)",
                params![id, name],
            )
            .unwrap();
    }

    pub fn add_frame(&self, frame: Frame) {
        self.conn()
            .execute(
                "INSERT INTO frame_slice (ts, dur, ipid, itid, vsync, type, flag, callstack_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    frame.ts,
                    frame.dur,
                    frame.ipid,
                    frame.itid,
                    frame.vsync,
                    frame.kind,
                    frame.flag,
                    frame.callstack_id
                ],
            )
            .unwrap();
    }

    pub fn set_runtime(&self, value: &str) {
        self.conn()
            .execute(
                "INSERT INTO meta (name, value) VALUES ('runtime', ?1)",
                params![value],
            )
            .unwrap();
    }
}

pub(crate) struct PerfFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl PerfFixture {
    pub fn new() -> Self {
        Self::with_schema(PERF_SCHEMA)
    }

    /// A profile with only `perf_sample`, no call-chain tables.
    pub fn samples_only() -> Self {
        Self::with_schema(
            "CREATE TABLE perf_sample (
                id INTEGER PRIMARY KEY, callchain_id INTEGER, timestamp_trace INTEGER,
                thread_id INTEGER, event_count INTEGER
            );",
        )
    }

    fn with_schema(schema: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perf.db");
        Connection::open(&path).unwrap().execute_batch(schema).unwrap();
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }

    pub fn add_sample(&self, callchain_id: Option<i64>, ts: i64, tid: i64, event_count: i64) {
        self.conn()
            .execute(
                "INSERT INTO perf_sample (callchain_id, timestamp_trace, thread_id, event_count) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![callchain_id, ts, tid, event_count],
            )
            .unwrap();
    }

    pub fn add_callchain_frame(&self, callchain_id: i64, depth: i64, file_id: i64, symbol_id: i64) {
        self.conn()
            .execute(
                "INSERT INTO perf_callchain (callchain_id, depth, file_id, symbol_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![callchain_id, depth, file_id, symbol_id],
            )
            .unwrap();
    }

    pub fn add_symbol(&self, file_id: i64, serial_id: i64, symbol: &str, path: &str) {
        self.conn()
            .execute(
                "INSERT INTO perf_files (file_id, serial_id, symbol, path) VALUES (?1, ?2, ?3, ?4)",
                params![file_id, serial_id, symbol, path],
            )
            .unwrap();
    }

    /// Register a call-chain whose frames are `symbols` in depth order,
    /// all in one library.
    pub fn add_chain(&self, callchain_id: i64, symbols: &[&str]) {
        let file_id = 1000 + callchain_id;
        for (depth, symbol) in symbols.iter().enumerate() {
            let symbol_id = depth as i64;
            self.add_callchain_frame(callchain_id, depth as i64, file_id, symbol_id);
            self.add_symbol(file_id, symbol_id, symbol, "/system/lib64/libtest.so");
        }
    }
}
