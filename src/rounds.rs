//! Test-case discovery and the per-case round loop.
//!
//! Each case is run `rounds` times through the device driver, each round into
//! its own `<reports>/<case>_round<n>` directory. A round whose sample
//! captures are mostly missing is deleted and re-run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::exec::{run_command, substitute_args, DriverArgs};
use crate::layout::{read_steps, SAMPLE_DIR};

/// A runnable test case found under the testcases directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub app_dir: PathBuf,
    pub script: PathBuf,
}

/// Find cases laid out as `<root>/<app>/<case>.<extension>`.
///
/// When two apps define the same case name the later directory in sort order
/// wins.
pub fn discover_testcases(root: &Path, extension: &str) -> Result<BTreeMap<String, TestCase>> {
    let mut cases = BTreeMap::new();
    let mut app_dirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    app_dirs.sort();

    for app_dir in app_dirs {
        let entries = fs::read_dir(&app_dir)
            .with_context(|| format!("Failed to read {}", app_dir.display()))?;
        for entry in entries {
            let script = entry?.path();
            if !script.is_file() || script.extension().and_then(|e| e.to_str()) != Some(extension)
            {
                continue;
            }
            let Some(name) = script.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            cases.insert(
                name.to_string(),
                TestCase {
                    name: name.to_string(),
                    app_dir: app_dir.clone(),
                    script: script.clone(),
                },
            );
        }
    }
    Ok(cases)
}

/// Case names matching any of `patterns`, in pattern order.
///
/// Patterns are regular expressions anchored at the start of the name. An
/// invalid pattern is logged and then matched as an exact name.
pub fn select_testcases<'a, I>(patterns: &[String], available: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String> + Clone,
{
    let mut selected: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !selected.iter().any(|s| s == name) {
            selected.push(name.to_string());
        }
    };
    for pattern in patterns {
        match Regex::new(&format!("^(?:{pattern})")) {
            Ok(re) => {
                for name in available.clone() {
                    if re.is_match(name) {
                        push(name);
                    }
                }
            }
            Err(e) => {
                error!("Invalid regex pattern: {pattern}, error: {e}");
                if available.clone().into_iter().any(|name| name == pattern) {
                    push(pattern);
                }
            }
        }
    }
    selected
}

/// Sample captures a round needs to count as complete: more than half of
/// the declared steps.
pub fn required_captures(steps: usize) -> usize {
    (steps.div_ceil(2) + 1).min(steps)
}

/// True when `round_dir` declares its steps and enough of them have a
/// non-empty sample capture.
pub fn is_round_complete(round_dir: &Path, data_filename: &str) -> bool {
    let steps = match read_steps(round_dir) {
        Ok(steps) => steps,
        Err(e) => {
            warn!("{}: {e:#}", round_dir.display());
            return false;
        }
    };
    if steps.is_empty() {
        return false;
    }

    let sample_root = round_dir.join(SAMPLE_DIR);
    let captures = match fs::read_dir(&sample_root) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join(data_filename))
            .filter(|capture| fs::metadata(capture).is_ok_and(|m| m.is_file() && m.len() > 0))
            .count(),
        Err(_) => 0,
    };
    debug!(
        "{}: {captures} captures for {} steps",
        round_dir.display(),
        steps.len()
    );
    captures >= required_captures(steps.len())
}

/// Runs one round of a case on the device.
pub trait CaseRunner: Send + Sync {
    fn run(&self, case: &TestCase, output: &Path) -> Result<()>;
}

/// Runs rounds through the configured `driver.command`, passing the
/// capture settings through the `{event}` and `{trace}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    argv: Vec<String>,
    event: String,
    trace: bool,
}

impl CommandRunner {
    pub fn new(argv: Vec<String>) -> Result<Self, ConfigError> {
        if argv.is_empty() {
            return Err(ConfigError::Invalid {
                key: "driver.command".to_string(),
                message: "no driver command configured".to_string(),
            });
        }
        Ok(Self {
            argv,
            event: String::new(),
            trace: true,
        })
    }

    /// Sample `event` instead of the driver's default; `None` keeps the default.
    pub fn with_event(mut self, event: Option<String>) -> Self {
        self.event = event.unwrap_or_default();
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.driver_command()?)?
            .with_event(config.hiperf_event())
            .with_trace(config.trace_enabled()))
    }
}

impl CaseRunner for CommandRunner {
    fn run(&self, case: &TestCase, output: &Path) -> Result<()> {
        let argv = substitute_args(
            &self.argv,
            &DriverArgs {
                case: &case.name,
                case_dir: &case.app_dir,
                output,
                event: &self.event,
                trace: self.trace,
            },
        );
        let Some((program, args)) = argv.split_first() else {
            bail!("empty driver command");
        };
        run_command(program, args)?;
        Ok(())
    }
}

/// Settings of the round loop.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub rounds: u32,
    pub max_retries: u32,
    pub data_filename: String,
}

impl RoundPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rounds: config.rounds(),
            max_retries: config.max_round_retries(),
            data_filename: config.hiperf_data_filename(),
        }
    }
}

/// Directory a round of `case` is written to.
pub fn round_dir(reports_dir: &Path, case: &str, round: u32) -> PathBuf {
    reports_dir.join(format!("{case}_round{round}"))
}

/// Run every round of `case` and return the directories of the complete
/// ones.
///
/// An incomplete round is deleted and re-run up to `max_retries` times; if it
/// is still incomplete it is left on disk and not returned.
pub fn run_case_rounds(
    runner: &dyn CaseRunner,
    case: &TestCase,
    reports_dir: &Path,
    plan: &RoundPlan,
    cancel: &AtomicBool,
) -> Vec<PathBuf> {
    let mut complete = Vec::new();
    for round in 0..plan.rounds {
        if cancel.load(Ordering::SeqCst) {
            warn!("Cancelled, skipping remaining rounds of {}", case.name);
            break;
        }
        let output = round_dir(reports_dir, &case.name, round);
        run_round(runner, case, &output);

        let mut attempt = 0;
        loop {
            if is_round_complete(&output, &plan.data_filename) {
                complete.push(output);
                break;
            }
            if attempt >= plan.max_retries || cancel.load(Ordering::SeqCst) {
                error!(
                    "Round {round} of {} still incomplete after {attempt} retries",
                    case.name
                );
                break;
            }
            attempt += 1;
            if output.exists() {
                if let Err(e) = fs::remove_dir_all(&output) {
                    error!("Failed to delete {}: {e}", output.display());
                    break;
                }
            }
            warn!(
                "Incomplete {}, retrying ({attempt}/{}) for {}",
                plan.data_filename,
                plan.max_retries,
                output.display()
            );
            run_round(runner, case, &output);
        }
    }
    info!(
        "{}: {} of {} rounds complete",
        case.name,
        complete.len(),
        plan.rounds
    );
    complete
}

fn run_round(runner: &dyn CaseRunner, case: &TestCase, output: &Path) {
    if let Err(e) = runner.run(case, output) {
        error!("Running {} into {} failed: {e:#}", case.name, output.display());
    }
}
