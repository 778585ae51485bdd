//! Step orchestration for one case directory.
//!
//! Every registered analyzer runs once per step on a pool of
//! [`MAX_WORKERS`] threads. Each analyzer keeps its per-step results in a
//! map keyed by step id; when all tasks are done the maps are written as
//! one JSON report per analyzer under `<case>/htrace/`.

mod analyzers;

pub use analyzers::{
    ComponentReusableAnalyzer, EmptyFrameAnalyzer, FrameDropAnalyzer, FRAME_REPORT_NAME,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::config::Config;
use crate::exec::convert_trace;
use crate::layout::{enumerate_steps, StepArtifacts, TRACE_CAPTURE, TRACE_DB, TRACE_DIR};

/// Worker threads per pool.
pub const MAX_WORKERS: usize = 4;

/// One analysis over a single step's databases.
pub trait StepAnalyzer: Send + Sync {
    /// Stable identifier, used in logs.
    fn name(&self) -> &'static str;

    /// File name of the case-level report under `htrace/`.
    fn report_name(&self) -> &'static str;

    fn analyze(&self, step_id: &str, trace_db: &Path, perf_db: &Path) -> Result<Value>;
}

/// Builds an analyzer bound to a case directory.
pub type AnalyzerFactory = fn(&Path) -> Box<dyn StepAnalyzer>;

/// Registered analyzers in execution order.
pub const REGISTRY: &[(&str, AnalyzerFactory)] = &[
    ("FrameDropAnalyzer", FrameDropAnalyzer::create as AnalyzerFactory),
    ("EmptyFrameAnalyzer", EmptyFrameAnalyzer::create as AnalyzerFactory),
    (
        "ComponentReusableAnalyzer",
        ComponentReusableAnalyzer::create as AnalyzerFactory,
    ),
];

/// An analyzer together with the results it has collected for a case.
pub struct AnalyzerRun {
    analyzer: Box<dyn StepAnalyzer>,
    case_dir: PathBuf,
    results: Mutex<BTreeMap<String, Value>>,
}

impl AnalyzerRun {
    pub fn new(analyzer: Box<dyn StepAnalyzer>, case_dir: &Path) -> Self {
        Self {
            analyzer,
            case_dir: case_dir.to_path_buf(),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.analyzer.name()
    }

    /// Analyze one step and record the outcome. A failure is stored as
    /// `{"error": message}` under the step id. Returns whether it succeeded.
    pub fn analyze(&self, step: &StepArtifacts) -> bool {
        let started = Instant::now();
        let (value, ok) = match self
            .analyzer
            .analyze(&step.step_id, &step.trace_db, &step.perf_db)
        {
            Ok(value) => {
                info!(
                    "{} completed {} in {:.2?}",
                    self.name(),
                    step.step_id,
                    started.elapsed()
                );
                (value, true)
            }
            Err(e) => {
                error!("{} failed on {}: {e:#}", self.name(), step.step_id);
                (serde_json::json!({ "error": format!("{e:#}") }), false)
            }
        };
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step.step_id.clone(), value);
        ok
    }

    pub fn results(&self) -> BTreeMap<String, Value> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Path the report is written to.
    pub fn report_path(&self) -> PathBuf {
        self.case_dir
            .join(TRACE_DIR)
            .join(self.analyzer.report_name())
    }

    /// Write all recorded step results as pretty-printed JSON.
    ///
    /// Nothing is written when no step succeeded.
    pub fn write_report(&self) -> Result<Option<PathBuf>> {
        let results = self.results();
        let has_success = results.values().any(|v| v.get("error").is_none());
        if !has_success {
            warn!("{}: no results to write, skipping report", self.name());
            return Ok(None);
        }
        let path = self.report_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&results)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Report written to {}", path.display());
        Ok(Some(path))
    }
}

/// Outcome of analyzing one case.
#[derive(Debug, Default)]
pub struct CaseAnalysis {
    pub steps: usize,
    pub successes: usize,
    pub failures: usize,
    pub reports: Vec<PathBuf>,
    pub cancelled: bool,
}

/// Convert `trace.htrace` captures that have no database yet.
///
/// Failures are logged; the step is then skipped by step enumeration.
pub fn convert_missing_traces(case_dir: &Path, streamer: &Path) -> Result<usize> {
    let trace_root = case_dir.join(TRACE_DIR);
    let mut converted = 0;
    let entries = fs::read_dir(&trace_root)
        .with_context(|| format!("Failed to read {}", trace_root.display()))?;
    for entry in entries {
        let step_dir = entry?.path();
        let capture = step_dir.join(TRACE_CAPTURE);
        let db = step_dir.join(TRACE_DB);
        if !capture.is_file() || db.exists() {
            continue;
        }
        match convert_trace(streamer, &capture, &db) {
            Ok(()) => converted += 1,
            Err(e) => error!("Failed to convert {}: {e:#}", capture.display()),
        }
    }
    Ok(converted)
}

/// Run every registered analyzer over every step of `case_dir` and write
/// the reports.
///
/// Once `cancel` is set no further tasks are submitted; tasks already
/// queued still run and reports are written from whatever finished.
pub fn analyze_case(case_dir: &Path, config: &Config, cancel: &AtomicBool) -> Result<CaseAnalysis> {
    if let Some(streamer) = config.trace_streamer() {
        let converted = convert_missing_traces(case_dir, &streamer)?;
        if converted > 0 {
            info!("Converted {converted} trace captures in {}", case_dir.display());
        }
    }

    let steps = enumerate_steps(case_dir, &config.hiperf_db_filename())?;
    let mut outcome = CaseAnalysis {
        steps: steps.len(),
        ..Default::default()
    };
    if steps.is_empty() {
        warn!("No valid step directories found in {}", case_dir.display());
        return Ok(outcome);
    }

    let runs: Vec<Arc<AnalyzerRun>> = REGISTRY
        .iter()
        .map(|(name, factory)| {
            debug!("Initialized analyzer {name}");
            Arc::new(AnalyzerRun::new(factory(case_dir), case_dir))
        })
        .collect();

    info!(
        "Processing {} steps with {MAX_WORKERS} workers in {}",
        steps.len(),
        case_dir.display()
    );
    let started = Instant::now();
    let pool = Pool::<ThunkWorker<bool>>::new(MAX_WORKERS);
    let (tx, rx) = channel();
    let mut submitted = 0;
    'submit: for step in &steps {
        for run in &runs {
            if cancel.load(Ordering::SeqCst) {
                warn!("Cancelled, not submitting further steps");
                outcome.cancelled = true;
                break 'submit;
            }
            let run = Arc::clone(run);
            let step = step.clone();
            pool.execute_to(tx.clone(), Thunk::of(move || run.analyze(&step)));
            submitted += 1;
        }
    }
    drop(tx);

    for ok in rx.iter().take(submitted) {
        if ok {
            outcome.successes += 1;
        } else {
            outcome.failures += 1;
        }
    }
    pool.join();
    info!(
        "Step processing completed in {:.2?}: {} successes, {} errors",
        started.elapsed(),
        outcome.successes,
        outcome.failures
    );

    for run in &runs {
        match run.write_report() {
            Ok(Some(path)) => outcome.reports.push(path),
            Ok(None) => {}
            Err(e) => error!("Failed to write report for {}: {e:#}", run.name()),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixed {
        fail_on: &'static str,
    }

    impl StepAnalyzer for Fixed {
        fn name(&self) -> &'static str {
            "Fixed"
        }

        fn report_name(&self) -> &'static str {
            "fixed.json"
        }

        fn analyze(&self, step_id: &str, _trace_db: &Path, _perf_db: &Path) -> Result<Value> {
            if step_id == self.fail_on {
                anyhow::bail!("boom on {step_id}");
            }
            Ok(serde_json::json!({ "step": step_id }))
        }
    }

    fn step(id: &str) -> StepArtifacts {
        StepArtifacts {
            step_id: id.to_string(),
            trace_db: PathBuf::from("/unused/trace.db"),
            perf_db: PathBuf::from("/unused/perf.db"),
        }
    }

    #[test]
    fn test_registry_order() {
        let names: Vec<&str> = REGISTRY.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["FrameDropAnalyzer", "EmptyFrameAnalyzer", "ComponentReusableAnalyzer"]
        );
        let dir = TempDir::new().unwrap();
        for (name, factory) in REGISTRY {
            assert_eq!(factory(dir.path()).name(), *name);
        }
    }

    #[test]
    fn test_failure_recorded_as_error() {
        let dir = TempDir::new().unwrap();
        let run = AnalyzerRun::new(Box::new(Fixed { fail_on: "step2" }), dir.path());
        assert!(run.analyze(&step("step1")));
        assert!(!run.analyze(&step("step2")));
        let results = run.results();
        assert_eq!(results["step1"]["step"], "step1");
        assert!(results["step2"]["error"]
            .as_str()
            .unwrap()
            .contains("boom on step2"));

        let path = run.write_report().unwrap().unwrap();
        assert_eq!(path, dir.path().join("htrace").join("fixed.json"));
        let written: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_write_report_skips_without_success() {
        let dir = TempDir::new().unwrap();
        let run = AnalyzerRun::new(Box::new(Fixed { fail_on: "step1" }), dir.path());
        assert!(run.write_report().unwrap().is_none());
        run.analyze(&step("step1"));
        assert!(run.write_report().unwrap().is_none());
        assert!(!run.report_path().exists());
    }

    #[test]
    fn test_analyze_case_without_steps() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("htrace")).unwrap();
        fs::create_dir_all(dir.path().join("hiperf")).unwrap();
        let outcome =
            analyze_case(dir.path(), &Config::default(), &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.steps, 0);
        assert!(outcome.reports.is_empty());
    }

    #[test]
    fn test_analyze_case_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let step_dir = dir.path().join("htrace").join("step1");
        fs::create_dir_all(&step_dir).unwrap();
        fs::write(step_dir.join("trace.db"), b"").unwrap();
        let sample_dir = dir.path().join("hiperf").join("step1");
        fs::create_dir_all(&sample_dir).unwrap();
        fs::write(sample_dir.join("perf.db"), b"").unwrap();

        let outcome = analyze_case(dir.path(), &Config::default(), &AtomicBool::new(true)).unwrap();
        assert_eq!(outcome.steps, 1);
        assert!(outcome.cancelled);
        assert_eq!(outcome.successes + outcome.failures, 0);
        assert!(outcome.reports.is_empty());
    }
}
