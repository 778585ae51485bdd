//! Case report generation.
//!
//! A case report is produced in four stages: the external toolbox picks the
//! canonical round and copies it into the case directory, the toolbox runs
//! its perf analysis, the registered step analyzers run, and finally the
//! JSON outputs are injected into the HTML template.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{Config, KindCategory};
use crate::error::AnalyzeError;
use crate::exec::Toolbox;
use crate::layout::{SAMPLE_DIR, TRACE_DIR};
use crate::pipeline::{analyze_case, FRAME_REPORT_NAME};

pub const JSON_DATA_PLACEHOLDER: &str = "JSON_DATA_PLACEHOLDER";
pub const FRAME_JSON_PLACEHOLDER: &str = "FRAME_JSON_PLACEHOLDER";

/// Written by the external perf analysis under `hiperf/`.
pub const PERF_INFO_JSON: &str = "hiperf_info.json";
pub const REPORT_DIR: &str = "report";
pub const REPORT_HTML: &str = "hapray_report.html";

/// Produces and refreshes case reports.
pub struct ReportGenerator<'a> {
    config: &'a Config,
    toolbox: Toolbox,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            toolbox: Toolbox::from_config(config),
        }
    }

    /// Select a round out of `round_dirs` into `case_dir` and build its report.
    pub fn generate_report(
        &self,
        round_dirs: &[PathBuf],
        case_dir: &Path,
        cancel: &AtomicBool,
    ) -> bool {
        match self.generate(Some(round_dirs), case_dir, cancel) {
            Ok(()) => {
                info!("Report successfully generated for {}", case_dir.display());
                true
            }
            Err(e) => {
                error!("Report generation failed for {}: {e:#}", case_dir.display());
                false
            }
        }
    }

    /// Rebuild the report of an existing case directory, without round
    /// selection.
    pub fn update_report(&self, case_dir: &Path, cancel: &AtomicBool) -> bool {
        match self.generate(None, case_dir, cancel) {
            Ok(()) => {
                info!("Report successfully updated for {}", case_dir.display());
                true
            }
            Err(e) => {
                error!("Report update failed for {}: {e:#}", case_dir.display());
                false
            }
        }
    }

    fn generate(
        &self,
        round_dirs: Option<&[PathBuf]>,
        case_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        if let Some(round_dirs) = round_dirs {
            self.select_round(round_dirs, case_dir)
                .context("Round selection failed, aborting report generation")?;
        }
        if cancel.load(Ordering::SeqCst) {
            bail!("cancelled before analysis of {}", case_dir.display());
        }

        // The perf analysis only feeds the HTML report; frames are still analyzed without it.
        if let Err(e) = self.run_perf_analysis(case_dir) {
            error!("Perf analysis failed for {}: {e:#}", case_dir.display());
        }

        let outcome = analyze_case(case_dir, self.config, cancel)?;
        debug!(
            "{}: {} steps, {} reports",
            case_dir.display(),
            outcome.steps,
            outcome.reports.len()
        );

        if let Err(e) = self.create_html_report(case_dir) {
            error!("Failed to create HTML report: {e:#}");
        }
        Ok(())
    }

    fn select_round(&self, round_dirs: &[PathBuf], case_dir: &Path) -> Result<()> {
        if round_dirs.is_empty() {
            bail!("no round directories provided for {}", case_dir.display());
        }
        let args = vec![
            "dbtools".to_string(),
            "--choose".to_string(),
            "-i".to_string(),
            case_dir.to_string_lossy().into_owned(),
        ];
        debug!("Selecting round among {} rounds", round_dirs.len());
        self.toolbox.run(&args)?;
        Ok(())
    }

    fn run_perf_analysis(&self, case_dir: &Path) -> Result<()> {
        let args = build_perf_args(self.config, case_dir)?;
        self.toolbox.run(&args)?;
        Ok(())
    }

    /// Write `<case>/report/hapray_report.html` from the configured template.
    pub fn create_html_report(&self, case_dir: &Path) -> Result<PathBuf> {
        let template_path = self.config.report_template();
        if !template_path.is_file() {
            return Err(AnalyzeError::MissingArtifact {
                path: template_path,
            }
            .into());
        }
        let template = fs::read_to_string(&template_path)
            .with_context(|| format!("Failed to read {}", template_path.display()))?;

        let perf_json = read_perf_info(case_dir)?;
        let frame_json = read_frame_report(case_dir)?;

        let output = case_dir.join(REPORT_DIR).join(REPORT_HTML);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&output, inject_placeholders(&template, &perf_json, &frame_json))
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!("HTML report created at {}", output.display());
        Ok(output)
    }
}

/// Toolbox arguments for the perf analysis of `case_dir`.
pub fn build_perf_args(config: &Config, case_dir: &Path) -> Result<Vec<String>> {
    let mut args = vec![
        "dbtools".to_string(),
        "-i".to_string(),
        case_dir.to_string_lossy().into_owned(),
    ];
    if let Some(so_dir) = config.so_dir() {
        args.push("-s".to_string());
        args.push(so_dir.to_string_lossy().into_owned());
    }
    if let Some(kind) = config.kind().map_err(AnalyzeError::from)? {
        args.push("-k".to_string());
        args.push(kind_to_json(&kind));
    }
    Ok(args)
}

/// Wrap the configured categories the way the toolbox expects them.
pub fn kind_to_json(categories: &[KindCategory]) -> String {
    let components: Vec<Value> = categories
        .iter()
        .map(|category| {
            let mut component = json!({
                "name": category.name,
                "files": category.files,
            });
            if let Some(threads) = &category.thread {
                component["threads"] = threads.clone();
            }
            component
        })
        .collect();
    json!([{ "name": "APP_SO", "kind": 1, "components": components }]).to_string()
}

/// Replace the perf placeholder first, then the frame placeholder.
pub fn inject_placeholders(template: &str, perf_json: &str, frame_json: &str) -> String {
    template
        .replace(JSON_DATA_PLACEHOLDER, perf_json)
        .replace(FRAME_JSON_PLACEHOLDER, frame_json)
}

/// First object of `hiperf/hiperf_info.json`, serialized compactly.
fn read_perf_info(case_dir: &Path) -> Result<String> {
    let path = case_dir.join(SAMPLE_DIR).join(PERF_INFO_JSON);
    if !path.is_file() {
        return Err(AnalyzeError::MissingArtifact { path }.into());
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|source| AnalyzeError::Parse { path: path.clone(), source })?;
    match value.as_array().and_then(|entries| entries.first()) {
        Some(first) => Ok(first.to_string()),
        None => bail!("{} holds no perf entries", path.display()),
    }
}

fn read_frame_report(case_dir: &Path) -> Result<String> {
    let path = case_dir.join(TRACE_DIR).join(FRAME_REPORT_NAME);
    if !path.is_file() {
        warn!("{} not found, report has no frame data", path.display());
        return Ok("{}".to_string());
    }
    fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
}
