//! Top-level actions behind the command-line subcommands.
//!
//! Each action returns whether it fully succeeded. Failures of single cases
//! are logged and counted but never stop the batch, and whatever was written
//! before a failure stays on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tracing::{error, info, warn};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::analyze::{PerfDb, StutterResult, TraceDb};
use crate::config::Config;
use crate::layout::discover_case_dirs;
use crate::pipeline::MAX_WORKERS;
use crate::report::ReportGenerator;
use crate::rounds::{
    discover_testcases, run_case_rounds, select_testcases, CommandRunner, RoundPlan,
};
use crate::summary::create_summary_excel;

/// Extension of the case scripts under the testcases directory.
pub const CASE_SCRIPT_EXTENSION: &str = "py";

/// Inputs of the `perf` action.
#[derive(Debug, Clone)]
pub struct PerfOptions {
    pub testcases: PathBuf,
    /// Defaults to `reports/<YYYYmmddHHMMSS>` in the working directory.
    pub reports: Option<PathBuf>,
}

/// Default reports directory for a run started now.
pub fn timestamped_reports_dir() -> PathBuf {
    Path::new("reports").join(Local::now().format("%Y%m%d%H%M%S").to_string())
}

/// Run the selected cases round by round, build a report per case and
/// summarize the batch.
pub fn perf_action(config: Arc<Config>, options: &PerfOptions, cancel: Arc<AtomicBool>) -> bool {
    let patterns = match config.run_testcases() {
        Ok(patterns) => patterns,
        Err(e) => {
            error!("{e:#}");
            return false;
        }
    };
    if patterns.is_empty() {
        error!("No test cases specified for execution");
        return false;
    }
    let all_cases = match discover_testcases(&options.testcases, CASE_SCRIPT_EXTENSION) {
        Ok(cases) => cases,
        Err(e) => {
            error!("{e:#}");
            return false;
        }
    };
    let matched = select_testcases(&patterns, all_cases.keys());
    if matched.is_empty() {
        error!("No test cases matched the input patterns");
        return false;
    }
    info!("Found {} test cases for execution", matched.len());

    let runner = match CommandRunner::from_config(&config) {
        Ok(runner) => runner,
        Err(e) => {
            error!("{e:#}");
            return false;
        }
    };
    let reports_dir = options
        .reports
        .clone()
        .unwrap_or_else(timestamped_reports_dir);
    if let Err(e) = fs::create_dir_all(&reports_dir) {
        error!("Failed to create {}: {e}", reports_dir.display());
        return false;
    }
    info!("Reports will be saved to: {}", reports_dir.display());

    let plan = RoundPlan::from_config(&config);
    let pool = Pool::<ThunkWorker<bool>>::new(MAX_WORKERS);
    let (tx, rx) = channel();
    let mut submitted = 0;
    let mut failed = 0;

    // Rounds run one at a time on the device; report generation overlaps them.
    for name in &matched {
        if cancel.load(Ordering::SeqCst) {
            warn!("Cancelled, not starting further cases");
            break;
        }
        let case = &all_cases[name];
        let round_dirs = run_case_rounds(&runner, case, &reports_dir, &plan, &cancel);
        if round_dirs.is_empty() {
            error!("{name}: no complete rounds, case failed");
            failed += 1;
            continue;
        }
        let case_dir = reports_dir.join(name);
        let config = Arc::clone(&config);
        let cancel = Arc::clone(&cancel);
        pool.execute_to(
            tx.clone(),
            Thunk::of(move || {
                ReportGenerator::new(&config).generate_report(&round_dirs, &case_dir, &cancel)
            }),
        );
        submitted += 1;
    }
    drop(tx);

    failed += rx.iter().take(submitted).filter(|ok| !ok).count();
    pool.join();

    info!("Creating summary Excel report...");
    let summary_ok = create_summary_excel(&reports_dir, None);
    if !summary_ok {
        error!("Failed to create summary Excel");
    }
    if failed > 0 {
        error!("{failed} of {} cases failed", matched.len());
    }
    summary_ok && failed == 0
}

/// Re-run analysis and HTML generation on existing case directories, then
/// summarize.
pub fn update_action(config: Arc<Config>, report_dir: &Path, cancel: Arc<AtomicBool>) -> bool {
    if !report_dir.exists() {
        error!("Report directory not found: {}", report_dir.display());
        return false;
    }
    info!("Updating reports in: {}", report_dir.display());
    if let Some(so_dir) = config.so_dir() {
        info!("Using symbolicated .so files from: {}", so_dir.display());
    }

    let case_dirs = match discover_case_dirs(report_dir) {
        Ok(dirs) => dirs,
        Err(e) => {
            error!("{e:#}");
            return false;
        }
    };
    if case_dirs.is_empty() {
        error!("No valid test case reports found");
        return false;
    }
    info!("Found {} test case reports for updating", case_dirs.len());

    let pool = Pool::<ThunkWorker<bool>>::new(MAX_WORKERS);
    let (tx, rx) = channel();
    let mut submitted = 0;
    for case_dir in case_dirs {
        if cancel.load(Ordering::SeqCst) {
            warn!("Cancelled, not updating further cases");
            break;
        }
        let config = Arc::clone(&config);
        let cancel = Arc::clone(&cancel);
        pool.execute_to(
            tx.clone(),
            Thunk::of(move || ReportGenerator::new(&config).update_report(&case_dir, &cancel)),
        );
        submitted += 1;
    }
    drop(tx);

    let failed = rx.iter().take(submitted).filter(|ok| !ok).count();
    pool.join();
    if failed > 0 {
        error!("{failed} of {submitted} report updates failed");
    }

    info!("Generating summary Excel report");
    let summary_ok = create_summary_excel(report_dir, None);
    summary_ok && failed == 0
}

/// Summarize every `summary_info.json` below `input`.
pub fn summary_action(input: &Path, output: Option<&Path>) -> bool {
    create_summary_excel(input, output)
}

/// Stutter and FPS analysis of a single step's databases.
///
/// Without a sample database the result carries no frame load.
pub fn frames_action(
    trace_db: &Path,
    perf_db: Option<&Path>,
    step_id: &str,
) -> Result<StutterResult> {
    let trace = TraceDb::open(trace_db)?;
    let perf = perf_db.map(PerfDb::open).transpose()?;
    trace.analyze_stutter(perf.as_ref(), step_id)
}
