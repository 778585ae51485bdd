//! Common test utilities for hapray integration tests.
//!
//! Builders for the two per-step SQLite databases and for on-disk case
//! trees laid out the way the capture tooling leaves them.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde_json::json;

pub const MS: i64 = 1_000_000;

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

/// Call-chain of a VSync listener wake-up that only dispatches callbacks.
pub const VSYNC_CHAIN: &[&str] = &[
    "OHOS::Rosen::VSyncCallBackListener::OnReadable(int)",
    "OHOS::Rosen::VSyncCallBackListener::HandleVsyncCallbacks(long, long, int)",
    "epoll_wait",
];

/// A `trace.db` under construction.
pub struct TraceDbBuilder {
    conn: Connection,
}

impl TraceDbBuilder {
    pub fn create(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(TRACE_SCHEMA).unwrap();
        Self { conn }
    }

    pub fn process(self, ipid: i64, pid: i64, name: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO process (ipid, pid, name) VALUES (?1, ?2, ?3)",
                params![ipid, pid, name],
            )
            .unwrap();
        self
    }

    pub fn thread(self, itid: i64, tid: i64, name: &str, ipid: i64, is_main: bool) -> Self {
        self.conn
            .execute(
                "INSERT INTO thread (itid, tid, name, ipid, is_main_thread) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![itid, tid, name, ipid, is_main as i64],
            )
            .unwrap();
        self
    }

    pub fn callstack(self, id: i64, name: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO callstack (id, name, ts, dur) VALUES (?1, ?2, 0, 0)",
                params![id, name],
            )
            .unwrap();
        self
    }

    /// Insert a `frame_slice` row. `kind` is 0 for actual and 1 for expected
    /// frames.
    #[allow(clippy::too_many_arguments)]
    pub fn frame(
        self,
        vsync: i64,
        ts: i64,
        dur: i64,
        kind: i64,
        flag: Option<i64>,
        ipid: Option<i64>,
        itid: Option<i64>,
        callstack_id: Option<i64>,
    ) -> Self {
        self.conn
            .execute(
                "INSERT INTO frame_slice (ts, dur, ipid, itid, vsync, type, flag, callstack_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![ts, dur, ipid, itid, vsync, kind, flag, callstack_id],
            )
            .unwrap();
        self
    }

    /// An actual frame of `itid` in process `ipid`.
    pub fn actual(self, vsync: i64, ts: i64, dur: i64, flag: i64, ipid: i64, itid: i64) -> Self {
        self.frame(vsync, ts, dur, 0, Some(flag), Some(ipid), Some(itid), None)
    }

    pub fn expected(self, vsync: i64, ts: i64, dur: i64, ipid: i64) -> Self {
        self.frame(vsync, ts, dur, 1, None, Some(ipid), None, None)
    }

    pub fn runtime(self, value: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO meta (name, value) VALUES ('runtime', ?1)",
                params![value],
            )
            .unwrap();
        self
    }
}

/// A `perf.db` under construction.
pub struct PerfDbBuilder {
    conn: Connection,
}

impl PerfDbBuilder {
    pub fn create(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(PERF_SCHEMA).unwrap();
        Self { conn }
    }

    pub fn sample(self, callchain_id: Option<i64>, ts: i64, tid: i64, event_count: i64) -> Self {
        self.conn
            .execute(
                "INSERT INTO perf_sample (callchain_id, timestamp_trace, thread_id, event_count) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![callchain_id, ts, tid, event_count],
            )
            .unwrap();
        self
    }

    /// Register a call-chain whose frames are `symbols` in depth order.
    pub fn chain(self, callchain_id: i64, symbols: &[&str]) -> Self {
        let file_id = 1000 + callchain_id;
        for (depth, symbol) in symbols.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO perf_callchain (callchain_id, depth, file_id, symbol_id) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![callchain_id, depth as i64, file_id, depth as i64],
                )
                .unwrap();
            self.conn
                .execute(
                    "INSERT INTO perf_files (file_id, serial_id, symbol, path) \
                     VALUES (?1, ?2, ?3, '/system/lib64/libtest.so')",
                    params![file_id, depth as i64, symbol],
                )
                .unwrap();
        }
        self
    }
}

/// A case directory with `hiperf/` and `htrace/` subtrees.
pub struct CaseTree {
    root: PathBuf,
}

impl CaseTree {
    pub fn create(root: &Path) -> Self {
        fs::create_dir_all(root.join("hiperf")).unwrap();
        fs::create_dir_all(root.join("htrace")).unwrap();
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trace_db(&self, step: &str) -> PathBuf {
        self.root.join("htrace").join(step).join("trace.db")
    }

    pub fn perf_db(&self, step: &str) -> PathBuf {
        self.root.join("hiperf").join(step).join("perf.db")
    }

    pub fn write_pids(&self, step: &str, pids: &[i64], names: &[&str]) {
        let dir = self.root.join("hiperf").join(step);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("pids.json"),
            json!({ "pids": pids, "process_names": names }).to_string(),
        )
        .unwrap();
    }

    pub fn write_steps(&self, count: usize) {
        let steps: Vec<_> = (1..=count)
            .map(|i| json!({ "name": format!("step{i}"), "description": "", "stepIdx": i }))
            .collect();
        fs::write(
            self.root.join("hiperf").join("steps.json"),
            serde_json::to_string(&steps).unwrap(),
        )
        .unwrap();
    }

    /// A step whose app (pid 100, main thread itid 1, render thread itid 2)
    /// drew one on-time frame, one late frame and one empty frame.
    pub fn add_app_step(&self, step: &str) {
        TraceDbBuilder::create(&self.trace_db(step))
            .process(1, 100, "com.example.app")
            .thread(1, 100, "com.example.app", 1, true)
            .thread(2, 101, "RenderThread", 1, false)
            .callstack(10, "H:ReceiveVsync")
            .callstack(11, "H:CustomNode:BuildItem [ListItem]")
            .callstack(12, "H:CustomNode:BuildRecycle [ListItem]")
            .actual(1, 0, 16 * MS, 0, 1, 1)
            .actual(2, 20 * MS, 50 * MS, 1, 1, 1)
            .expected(2, 20 * MS, 16_670_000, 1)
            .frame(3, 80 * MS, 10 * MS, 0, Some(2), Some(1), Some(1), Some(10))
            .runtime("{\"version\": \"5.0\"}");
        PerfDbBuilder::create(&self.perf_db(step))
            .chain(1, &["ArkUI::Layout", "main"])
            .sample(Some(1), 25 * MS, 100, 3_000_000)
            .sample(Some(1), 85 * MS, 100, 2_000_000)
            .sample(Some(1), 85 * MS, 101, 1_000_000)
            .sample(None, 200 * MS, 100, 4_000_000);
        self.write_pids(step, &[100], &["com.example.app"]);
    }
}
