//! CPU load spent on frames that produced nothing to draw.
//!
//! A frame with `flag=2` ran through the UI pipeline without submitting a
//! new buffer. The work done on its thread during the frame is attributed to
//! it, split into main-thread and background-thread buckets, and the
//! heaviest frames of each bucket are reported.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use super::load::{attribute_frame_load, SampleCallchain, SampleIndex};
use super::query::{placeholders, sqlite_value_to_i64};
use super::sample_cache::SampleCache;
use super::{PerfDb, TraceDb, EMPTY_FRAME_TABLES};

/// Frames reported per bucket.
pub const TOP_FRAME_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmptyFrameRecord {
    pub ts: i64,
    pub dur: i64,
    pub ipid: Option<i64>,
    pub itid: Option<i64>,
    pub pid: Option<i64>,
    pub tid: i64,
    pub callstack_id: Option<i64>,
    pub process_name: Option<String>,
    pub thread_name: Option<String>,
    pub callstack_name: Option<String>,
    pub frame_load: i64,
    pub is_main_thread: i64,
    pub sample_callchains: Vec<SampleCallchain>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmptyFrameSummary {
    pub total_load: i64,
    pub empty_frame_load: i64,
    pub empty_frame_percentage: f64,
    pub background_thread_load: i64,
    pub background_thread_percentage: f64,
    pub total_empty_frames: u64,
    pub empty_frames_with_load: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopEmptyFrames {
    pub main_thread_empty_frames: Vec<EmptyFrameRecord>,
    pub background_thread: Vec<EmptyFrameRecord>,
}

/// Outcome of the empty-frame analysis for one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmptyFrameResult {
    NoFrames {
        message: String,
    },
    NoLoad {
        message: String,
    },
    Success {
        summary: EmptyFrameSummary,
        top_frames: TopEmptyFrames,
    },
}

impl EmptyFrameResult {
    fn no_frames() -> Self {
        Self::NoFrames {
            message: "no empty frames found for the application processes".to_string(),
        }
    }

    fn no_load() -> Self {
        Self::NoLoad {
            message: "no sampled load was attributed to any empty frame".to_string(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::NoFrames { .. } => "no_frames",
            Self::NoLoad { .. } => "no_load",
            Self::Success { .. } => "success",
        }
    }
}

/// An empty frame joined with its process, thread and callstack.
#[derive(Debug, Clone)]
struct Candidate {
    ts: i64,
    dur: i64,
    ipid: Option<i64>,
    itid: Option<i64>,
    callstack_id: Option<i64>,
    pid: Option<i64>,
    process_name: Option<String>,
    tid: Option<i64>,
    thread_name: Option<String>,
    is_main_thread: i64,
    callstack_name: Option<String>,
}

impl TraceDb {
    fn empty_frame_candidates(&self, pids: &[i64]) -> Result<Vec<Candidate>> {
        let sql = build_empty_frame_query(pids.len());
        let mut stmt = self.connection().prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(pids.iter()))?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next()? {
            candidates.push(Candidate {
                ts: sqlite_value_to_i64(row.get_ref(0)?).unwrap_or(0),
                dur: sqlite_value_to_i64(row.get_ref(1)?).unwrap_or(0),
                ipid: sqlite_value_to_i64(row.get_ref(2)?),
                itid: sqlite_value_to_i64(row.get_ref(3)?),
                callstack_id: sqlite_value_to_i64(row.get_ref(4)?),
                pid: sqlite_value_to_i64(row.get_ref(5)?),
                process_name: row.get(6)?,
                tid: sqlite_value_to_i64(row.get_ref(7)?),
                thread_name: row.get(8)?,
                is_main_thread: sqlite_value_to_i64(row.get_ref(9)?).unwrap_or(0),
                callstack_name: row.get(10)?,
            });
        }
        Ok(candidates)
    }

    /// Attribute sampled load to the empty frames of the processes in `pids`.
    ///
    /// Wake-ups of the VSync listener that only dispatch callbacks are not
    /// counted as load. A sample counts toward at most one empty frame.
    pub fn analyze_empty_frames(
        &self,
        perf: &PerfDb,
        pids: &[i64],
        step_id: &str,
    ) -> Result<EmptyFrameResult> {
        self.require_cte_support()?;
        self.require_tables(EMPTY_FRAME_TABLES)?;

        if pids.is_empty() {
            debug!("{step_id}: no application pids, skipping empty-frame analysis");
            return Ok(EmptyFrameResult::no_frames());
        }
        let candidates = self.empty_frame_candidates(pids)?;
        if candidates.is_empty() {
            return Ok(EmptyFrameResult::no_frames());
        }

        let total_load = match perf.total_load()? {
            Some(total) if total > 0 => total,
            _ => return Ok(EmptyFrameResult::no_load()),
        };
        let index = SampleIndex::new(perf.load_samples()?);
        if index.is_empty() {
            debug!("{step_id}: no sample has a timestamp and thread");
            return Ok(EmptyFrameResult::no_load());
        }
        let cache = SampleCache::new(step_id, perf);

        let total_empty_frames = candidates.iter().filter(|c| c.is_main_thread == 1).count() as u64;
        let mut records = Vec::new();
        // Last timestamp already attributed per thread. Candidates come in
        // timestamp order, so a sample on the boundary of two back-to-back
        // frames of one thread belongs to the earlier frame only.
        let mut claimed_until: HashMap<i64, i64> = HashMap::new();
        for candidate in candidates {
            let Some(tid) = candidate.tid else {
                continue;
            };
            let end = candidate.ts + candidate.dur;
            let start = match claimed_until.get(&tid) {
                Some(&claimed) => candidate.ts.max(claimed + 1),
                None => candidate.ts,
            };
            let claimed = claimed_until.entry(tid).or_insert(end);
            *claimed = (*claimed).max(end);
            let Some(load) = attribute_frame_load(&index, &cache, tid, start, end, true)? else {
                continue;
            };
            records.push(EmptyFrameRecord {
                ts: candidate.ts,
                dur: candidate.dur,
                ipid: candidate.ipid,
                itid: candidate.itid,
                pid: candidate.pid,
                tid,
                callstack_id: candidate.callstack_id,
                process_name: candidate.process_name,
                thread_name: candidate.thread_name,
                callstack_name: candidate.callstack_name,
                frame_load: load.frame_load,
                is_main_thread: candidate.is_main_thread,
                sample_callchains: load.sample_callchains,
            });
        }
        if records.is_empty() {
            return Ok(EmptyFrameResult::no_load());
        }

        let (main, background): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.is_main_thread == 1);
        let empty_frame_load: i64 = main.iter().map(|r| r.frame_load).sum();
        let background_thread_load: i64 = background.iter().map(|r| r.frame_load).sum();
        let empty_frames_with_load = main.len() as u64;

        debug!(
            "{step_id}: {} main-thread and {} background empty frames with samples",
            main.len(),
            background.len()
        );

        Ok(EmptyFrameResult::Success {
            summary: EmptyFrameSummary {
                total_load,
                empty_frame_load,
                empty_frame_percentage: empty_frame_load as f64 / total_load as f64 * 100.0,
                background_thread_load,
                background_thread_percentage: background_thread_load as f64 / total_load as f64
                    * 100.0,
                total_empty_frames,
                empty_frames_with_load,
            },
            top_frames: TopEmptyFrames {
                main_thread_empty_frames: top_by_load(main),
                background_thread: top_by_load(background),
            },
        })
    }
}

fn top_by_load(mut records: Vec<EmptyFrameRecord>) -> Vec<EmptyFrameRecord> {
    // Stable, so equal loads keep timestamp order.
    records.sort_by(|a, b| b.frame_load.cmp(&a.frame_load));
    records.truncate(TOP_FRAME_LIMIT);
    records
}

fn build_empty_frame_query(pid_count: usize) -> String {
    format!(
        "WITH filtered_frames AS ( \
             SELECT fs.ts, fs.dur, fs.ipid, fs.itid, fs.callstack_id \
             FROM frame_slice fs \
             WHERE fs.flag = 2 AND fs.type = 0 \
         ), \
         process_filtered AS ( \
             SELECT ff.*, p.pid, p.name AS process_name, t.tid, t.name AS thread_name, \
                    t.is_main_thread \
             FROM filtered_frames ff \
             JOIN process p ON ff.ipid = p.ipid \
             JOIN thread t ON ff.itid = t.itid \
             WHERE p.pid IN ({}) \
         ) \
         SELECT pf.ts, pf.dur, pf.ipid, pf.itid, pf.callstack_id, pf.pid, pf.process_name, \
                pf.tid, pf.thread_name, pf.is_main_thread, cs.name AS callstack_name \
         FROM process_filtered pf \
         JOIN callstack cs ON pf.callstack_id = cs.id \
         ORDER BY pf.ts, pf.itid",
        placeholders(pid_count)
    )
}
