use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use super::StepAnalyzer;
use crate::analyze::{PerfDb, TraceDb};
use crate::layout::read_pids;

/// Report written by [`FrameDropAnalyzer`], also embedded in the HTML report.
pub const FRAME_REPORT_NAME: &str = "frame_analysis_summary.json";

/// Stutter classification and FPS per step.
pub struct FrameDropAnalyzer;

impl FrameDropAnalyzer {
    pub fn create(_case_dir: &Path) -> Box<dyn StepAnalyzer> {
        Box::new(Self)
    }
}

impl StepAnalyzer for FrameDropAnalyzer {
    fn name(&self) -> &'static str {
        "FrameDropAnalyzer"
    }

    fn report_name(&self) -> &'static str {
        FRAME_REPORT_NAME
    }

    fn analyze(&self, step_id: &str, trace_db: &Path, perf_db: &Path) -> Result<Value> {
        let trace = TraceDb::open(trace_db)?;
        // Frame load is optional for this analysis.
        let perf = match PerfDb::open(perf_db) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!("{step_id}: {e:#}, analyzing frames without load");
                None
            }
        };
        let result = trace.analyze_stutter(perf.as_ref(), step_id)?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Load attributed to frames that drew nothing, for the app's processes.
pub struct EmptyFrameAnalyzer {
    case_dir: PathBuf,
}

impl EmptyFrameAnalyzer {
    pub fn create(case_dir: &Path) -> Box<dyn StepAnalyzer> {
        Box::new(Self {
            case_dir: case_dir.to_path_buf(),
        })
    }
}

impl StepAnalyzer for EmptyFrameAnalyzer {
    fn name(&self) -> &'static str {
        "EmptyFrameAnalyzer"
    }

    fn report_name(&self) -> &'static str {
        "empty_frames_analysis.json"
    }

    fn analyze(&self, step_id: &str, trace_db: &Path, perf_db: &Path) -> Result<Value> {
        let manifest = read_pids(&self.case_dir, step_id);
        for (pid, name) in manifest.processes() {
            info!("{step_id}: process {name} (pid {pid})");
        }
        let trace = TraceDb::open(trace_db)?;
        let perf = PerfDb::open(perf_db)?;
        let result = trace.analyze_empty_frames(&perf, &manifest.pid_list(), step_id)?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Share of custom-component builds served from the recycle pool.
pub struct ComponentReusableAnalyzer;

impl ComponentReusableAnalyzer {
    pub fn create(_case_dir: &Path) -> Box<dyn StepAnalyzer> {
        Box::new(Self)
    }
}

impl StepAnalyzer for ComponentReusableAnalyzer {
    fn name(&self) -> &'static str {
        "ComponentReusableAnalyzer"
    }

    fn report_name(&self) -> &'static str {
        "component_reusability_report.json"
    }

    fn analyze(&self, _step_id: &str, trace_db: &Path, _perf_db: &Path) -> Result<Value> {
        let trace = TraceDb::open(trace_db)?;
        Ok(serde_json::to_value(trace.component_reuse()?)?)
    }
}
