//! Stutter classification and frame-rate statistics for one step.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use super::fps::{FpsStats, FpsTracker};
use super::load::{attribute_frame_load, SampleCallchain, SampleIndex};
use super::query::{sqlite_value_to_i64, sqlite_value_to_json};
use super::sample_cache::SampleCache;
use super::{require_tables, round4, PerfDb, TraceDb};

/// Duration of one frame at the 60 fps reference rate, in milliseconds.
pub const FRAME_INTERVAL_MS: f64 = 16.67;

const NS_PER_MS: f64 = 1_000_000.0;
const FRAME_TYPE_ACTUAL: i64 = 0;
const FRAME_TYPE_EXPECTED: i64 = 1;
const FLAG_LATE: i64 = 1;
const FLAG_NO_DRAW: i64 = 2;
const FLAG_FORCED_MINOR: i64 = 3;

/// Which pipeline produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Ui,
    Render,
    Sceneboard,
}

impl FrameType {
    pub fn from_process_name(name: Option<&str>) -> Self {
        match name {
            Some("render_service") => Self::Render,
            Some("ohos.sceneboard") => Self::Sceneboard,
            _ => Self::Ui,
        }
    }
}

/// Severity of a late frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StutterLevel {
    Minor = 1,
    Moderate = 2,
    Severe = 3,
}

impl StutterLevel {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

/// Grade a late frame by how many reference frames it overran.
pub fn classify_stutter(flag: Option<i64>, exceed_frames: f64) -> StutterLevel {
    if flag == Some(FLAG_FORCED_MINOR) || exceed_frames < 2.0 {
        StutterLevel::Minor
    } else if exceed_frames < 6.0 {
        StutterLevel::Moderate
    } else {
        StutterLevel::Severe
    }
}

/// One `frame_slice` row with the owning thread's `tid`.
#[derive(Debug, Clone)]
pub struct FrameRow {
    pub ts: i64,
    pub dur: i64,
    pub ipid: Option<i64>,
    pub itid: Option<i64>,
    pub tid: Option<i64>,
    pub vsync: i64,
    pub frame_type: i64,
    pub flag: Option<i64>,
    pub src: serde_json::Value,
    pub dst: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameTypeStats {
    pub total: u64,
    pub stutter: u64,
    pub stutter_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStats {
    pub ui: FrameTypeStats,
    pub render: FrameTypeStats,
    pub sceneboard: FrameTypeStats,
}

impl FrameStats {
    fn get_mut(&mut self, frame_type: FrameType) -> &mut FrameTypeStats {
        match frame_type {
            FrameType::Ui => &mut self.ui,
            FrameType::Render => &mut self.render,
            FrameType::Sceneboard => &mut self.sceneboard,
        }
    }

    fn all(&self) -> [&FrameTypeStats; 3] {
        [&self.ui, &self.render, &self.sceneboard]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StutterLevels {
    pub level_1: u64,
    pub level_2: u64,
    pub level_3: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStatistics {
    pub total_frames: u64,
    pub frame_stats: FrameStats,
    pub total_stutter_frames: u64,
    pub stutter_rate: f64,
    pub stutter_levels: StutterLevels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StutterDetail {
    pub vsync: i64,
    pub timestamp: i64,
    pub actual_duration: i64,
    pub expected_duration: i64,
    /// Overrun in milliseconds. Serialized under both names the report
    /// consumers read.
    pub exceed_time: f64,
    pub exceed_time_ms: f64,
    pub exceed_frames: f64,
    pub stutter_level: u8,
    pub level_description: &'static str,
    pub src: serde_json::Value,
    pub dst: serde_json::Value,
    pub frame_load: i64,
    pub sample_callchains: Vec<SampleCallchain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StutterDetails {
    pub ui_stutter: Vec<StutterDetail>,
    pub render_stutter: Vec<StutterDetail>,
    pub sceneboard_stutter: Vec<StutterDetail>,
}

impl StutterDetails {
    fn get_mut(&mut self, frame_type: FrameType) -> &mut Vec<StutterDetail> {
        match frame_type {
            FrameType::Ui => &mut self.ui_stutter,
            FrameType::Render => &mut self.render_stutter,
            FrameType::Sceneboard => &mut self.sceneboard_stutter,
        }
    }
}

/// Stutter and FPS result for one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StutterResult {
    pub runtime: Option<serde_json::Value>,
    pub statistics: FrameStatistics,
    pub stutter_details: StutterDetails,
    pub fps_stats: FpsStats,
}

impl TraceDb {
    /// All frames with a usable `vsync`, grouped by it. Within a group rows
    /// are ordered by timestamp.
    pub fn frame_groups(&self) -> Result<BTreeMap<i64, Vec<FrameRow>>> {
        require_tables(self.connection(), &["frame_slice", "thread"])?;
        let mut stmt = self.connection().prepare(&build_frame_query())?;
        let mut rows = stmt.query([])?;
        let mut groups: BTreeMap<i64, Vec<FrameRow>> = BTreeMap::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.next()? {
            let Some(vsync) = sqlite_value_to_i64(row.get_ref(4)?) else {
                skipped += 1;
                continue;
            };
            groups.entry(vsync).or_default().push(FrameRow {
                ts: sqlite_value_to_i64(row.get_ref(0)?).unwrap_or(0),
                dur: sqlite_value_to_i64(row.get_ref(1)?).unwrap_or(0),
                ipid: sqlite_value_to_i64(row.get_ref(2)?),
                itid: sqlite_value_to_i64(row.get_ref(3)?),
                vsync,
                frame_type: sqlite_value_to_i64(row.get_ref(5)?).unwrap_or(FRAME_TYPE_ACTUAL),
                flag: sqlite_value_to_i64(row.get_ref(6)?),
                src: sqlite_value_to_json(row.get_ref(7)?),
                dst: sqlite_value_to_json(row.get_ref(8)?),
                tid: sqlite_value_to_i64(row.get_ref(9)?),
            });
        }
        if skipped > 0 {
            debug!("Skipped {skipped} frames without a vsync in {}", self.path().display());
        }
        for frames in groups.values_mut() {
            frames.sort_by_key(|f| f.ts);
        }
        Ok(groups)
    }

    /// Classify late frames and count frames per second.
    ///
    /// With a profile database, each stutter also carries the CPU load its
    /// thread spent during the frame. A profile that cannot be read is
    /// logged and the analysis continues without load.
    pub fn analyze_stutter(&self, perf: Option<&PerfDb>, step_id: &str) -> Result<StutterResult> {
        let groups = self.frame_groups()?;
        let process_names = self.process_names()?;
        let runtime = self.runtime()?;

        let samples = match perf {
            Some(db) => match db.load_samples() {
                Ok(samples) => Some(SampleIndex::new(samples)),
                Err(e) => {
                    warn!("{step_id}: frame load unavailable: {e:#}");
                    None
                }
            },
            None => None,
        };
        let cache = perf.map(|db| SampleCache::new(step_id, db));

        let mut statistics = FrameStatistics::default();
        let mut details = StutterDetails::default();
        let mut fps = FpsTracker::new();

        for (&vsync, frames) in &groups {
            let expected = frames.iter().find(|f| f.frame_type == FRAME_TYPE_EXPECTED);
            for frame in frames {
                if frame.frame_type == FRAME_TYPE_EXPECTED || frame.flag == Some(FLAG_NO_DRAW) {
                    continue;
                }
                let frame_type = FrameType::from_process_name(
                    frame
                        .ipid
                        .and_then(|ipid| process_names.get(&ipid))
                        .map(String::as_str),
                );
                statistics.frame_stats.get_mut(frame_type).total += 1;
                fps.record(vsync, frame.ts, frame.dur);

                let Some(expected) = expected.filter(|_| frame.flag == Some(FLAG_LATE)) else {
                    continue;
                };
                let exceed_time = (frame.dur - expected.dur) as f64 / NS_PER_MS;
                let exceed_frames = exceed_time / FRAME_INTERVAL_MS;
                let level = classify_stutter(frame.flag, exceed_frames);
                match level {
                    StutterLevel::Minor => statistics.stutter_levels.level_1 += 1,
                    StutterLevel::Moderate => statistics.stutter_levels.level_2 += 1,
                    StutterLevel::Severe => statistics.stutter_levels.level_3 += 1,
                }
                statistics.frame_stats.get_mut(frame_type).stutter += 1;

                let load = match (&samples, &cache, frame.tid) {
                    (Some(index), Some(cache), Some(tid)) => attribute_frame_load(
                        index,
                        cache,
                        tid,
                        frame.ts,
                        frame.ts + frame.dur,
                        false,
                    )?,
                    _ => None,
                }
                .unwrap_or_default();

                details.get_mut(frame_type).push(StutterDetail {
                    vsync,
                    timestamp: frame.ts,
                    actual_duration: frame.dur,
                    expected_duration: expected.dur,
                    exceed_time,
                    exceed_time_ms: exceed_time,
                    exceed_frames,
                    stutter_level: level.number(),
                    level_description: level.description(),
                    src: frame.src.clone(),
                    dst: frame.dst.clone(),
                    frame_load: load.frame_load,
                    sample_callchains: load.sample_callchains,
                });
            }
        }

        for stats in [
            &mut statistics.frame_stats.ui,
            &mut statistics.frame_stats.render,
            &mut statistics.frame_stats.sceneboard,
        ] {
            stats.stutter_rate = rate(stats.stutter, stats.total);
        }
        let totals = statistics.frame_stats.all();
        statistics.total_frames = totals.iter().map(|s| s.total).sum();
        statistics.total_stutter_frames = totals.iter().map(|s| s.stutter).sum();
        statistics.stutter_rate = rate(statistics.total_stutter_frames, statistics.total_frames);

        debug!(
            "{step_id}: {} frames, {} stutters",
            statistics.total_frames, statistics.total_stutter_frames
        );

        Ok(StutterResult {
            runtime,
            statistics,
            stutter_details: details,
            fps_stats: fps.finish(),
        })
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round4(part as f64 / total as f64)
    }
}

/// Process-name lookups are done in Rust, so only the thread join is needed here.
fn build_frame_query() -> String {
    "SELECT fs.ts, fs.dur, fs.ipid, fs.itid, fs.vsync, fs.type, fs.flag, fs.src, fs.dst, t.tid \
     FROM frame_slice fs \
     LEFT JOIN thread t ON fs.itid = t.itid \
     ORDER BY fs.rowid"
        .to_string()
}
