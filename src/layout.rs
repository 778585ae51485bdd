//! On-disk layout of captured runs.
//!
//! A case directory holds two sibling trees, `hiperf/` for CPU samples and
//! `htrace/` for trace captures, each with one `step<N>` directory per
//! scripted step:
//!
//! ```text
//! <case>/
//! ├── testInfo.json
//! ├── hiperf/
//! │   ├── steps.json
//! │   └── step1/{perf.data, perf.db, pids.json}
//! └── htrace/
//!     └── step1/{trace.htrace, trace.db}
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::AnalyzeError;

pub const SAMPLE_DIR: &str = "hiperf";
pub const TRACE_DIR: &str = "htrace";
pub const TRACE_DB: &str = "trace.db";
pub const TRACE_CAPTURE: &str = "trace.htrace";
pub const PIDS_JSON: &str = "pids.json";
pub const STEPS_JSON: &str = "steps.json";
pub const TEST_INFO_JSON: &str = "testInfo.json";

/// Database paths for one step of one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepArtifacts {
    /// Directory name of the step, e.g. `step3`. Used as the report key.
    pub step_id: String,
    pub trace_db: PathBuf,
    pub perf_db: PathBuf,
}

/// Contents of `pids.json`: the app's processes at capture time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidManifest {
    #[serde(default)]
    pub pids: Vec<i64>,
    #[serde(default)]
    pub process_names: Vec<String>,
}

impl PidManifest {
    /// `(pid, process_name)` pairs, truncated to the shorter of the two lists.
    pub fn processes(&self) -> impl Iterator<Item = (i64, &str)> {
        self.pids
            .iter()
            .copied()
            .zip(self.process_names.iter().map(String::as_str))
    }

    /// PIDs that have a matching process name.
    pub fn pid_list(&self) -> Vec<i64> {
        self.processes().map(|(pid, _)| pid).collect()
    }
}

/// One entry of `steps.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "stepIdx")]
    pub step_idx: i64,
}

/// Contents of `testInfo.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInfo {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub scene: String,
    #[serde(default)]
    pub device: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// Suffix of per-round intermediate directories. Compiled once at first use.
static ROUND_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_round\d+$").expect("Invalid round directory regex pattern"));

/// True for per-round intermediates such as `Case_0010_round2`.
pub fn is_round_dir_name(name: &str) -> bool {
    ROUND_DIR_RE.is_match(name)
}

/// True when `dir` has both the sample and trace subtrees.
pub fn is_case_root(dir: &Path) -> bool {
    dir.join(SAMPLE_DIR).is_dir() && dir.join(TRACE_DIR).is_dir()
}

/// Find case directories directly under `root`.
///
/// Round intermediates are excluded. When no child qualifies but `root`
/// itself does, `root` is the single case.
pub fn discover_case_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut cases = Vec::new();
    let entries =
        fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if is_round_dir_name(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() && is_case_root(&path) {
            cases.push(path);
        }
    }
    cases.sort();

    if cases.is_empty() && is_case_root(root) {
        cases.push(root.to_path_buf());
    }
    Ok(cases)
}

/// Sort key ordering `step2` before `step10`; non-numeric names sort last by name.
fn step_sort_key(name: &str) -> (u64, String) {
    let number = name
        .strip_prefix("step")
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    (number, name.to_string())
}

/// List the step directories of a case that have both databases.
///
/// Steps missing `trace.db` or the sample database are skipped with a warning.
pub fn enumerate_steps(case_dir: &Path, perf_db_name: &str) -> Result<Vec<StepArtifacts>> {
    let trace_root = case_dir.join(TRACE_DIR);
    let sample_root = case_dir.join(SAMPLE_DIR);

    let mut names = Vec::new();
    let entries = fs::read_dir(&trace_root)
        .with_context(|| format!("Failed to read {}", trace_root.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort_by_key(|n| step_sort_key(n));

    let mut steps = Vec::new();
    for name in names {
        let trace_db = trace_root.join(&name).join(TRACE_DB);
        let perf_db = sample_root.join(&name).join(perf_db_name);
        if !trace_db.is_file() {
            warn!("Skipping {name}: missing {}", trace_db.display());
            continue;
        }
        if !perf_db.is_file() {
            warn!("Skipping {name}: missing {}", perf_db.display());
            continue;
        }
        steps.push(StepArtifacts {
            step_id: name,
            trace_db,
            perf_db,
        });
    }
    Ok(steps)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(AnalyzeError::MissingArtifact {
            path: path.to_path_buf(),
        }
        .into());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).map_err(|source| {
        anyhow::Error::from(AnalyzeError::Parse {
            path: path.to_path_buf(),
            source,
        })
    })
}

/// Read `hiperf/<step>/pids.json`.
///
/// A missing or malformed manifest yields an empty PID list; the empty-frame
/// analysis then reports `no_frames` rather than failing.
pub fn read_pids(case_dir: &Path, step_id: &str) -> PidManifest {
    let path = case_dir.join(SAMPLE_DIR).join(step_id).join(PIDS_JSON);
    if !path.is_file() {
        warn!("No {PIDS_JSON} found at {}", path.display());
        return PidManifest::default();
    }
    match read_json::<PidManifest>(&path) {
        Ok(manifest) => {
            if manifest.pids.len() != manifest.process_names.len() {
                warn!(
                    "Mismatch between pids ({}) and process_names ({}) in {}",
                    manifest.pids.len(),
                    manifest.process_names.len(),
                    path.display()
                );
            }
            manifest
        }
        Err(e) => {
            error!("{e:#}");
            PidManifest::default()
        }
    }
}

/// Read `hiperf/steps.json` in step-execution order.
pub fn read_steps(case_dir: &Path) -> Result<Vec<StepInfo>> {
    read_json(&case_dir.join(SAMPLE_DIR).join(STEPS_JSON))
}

/// Read `testInfo.json` at the case root.
pub fn read_test_info(case_dir: &Path) -> Result<TestInfo> {
    read_json(&case_dir.join(TEST_INFO_JSON))
}
