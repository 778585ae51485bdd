//! Running the external tools: the toolbox CLI, the trace converter and the
//! device driver.
//!
//! Commands are always built as argv vectors and never go through a shell.
//! Output is captured and logged; a non-zero exit becomes
//! [`AnalyzeError::Subprocess`].

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::AnalyzeError;

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args` and wait for it to exit.
pub fn run_command(program: &str, args: &[String]) -> Result<CommandOutput> {
    let cmdline = command_line(program, args);
    debug!("Running {cmdline}");
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to start {program}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        if !stdout.is_empty() {
            error!("{cmdline} stdout: {stdout}");
        }
        if !stderr.is_empty() {
            error!("{cmdline} stderr: {stderr}");
        }
        return Err(AnalyzeError::Subprocess {
            program: program.to_string(),
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }

    if !stdout.is_empty() {
        debug!("{cmdline} output: {stdout}");
    }
    if !stderr.is_empty() {
        warn!("{cmdline} warnings: {stderr}");
    }
    Ok(CommandOutput { stdout, stderr })
}

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The JavaScript toolbox, invoked as `node <cmd> hapray <args…>`.
#[derive(Debug, Clone)]
pub struct Toolbox {
    node: String,
    script: PathBuf,
}

impl Toolbox {
    pub fn new(node: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            node: node.into(),
            script: script.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.toolbox_node(), config.toolbox_cmd())
    }

    /// Full argv for a toolbox invocation, without the program name.
    pub fn build_args(&self, args: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.script.to_string_lossy().into_owned(),
            "hapray".to_string(),
        ];
        argv.extend(args.iter().cloned());
        argv
    }

    pub fn run(&self, args: &[String]) -> Result<CommandOutput> {
        run_command(&self.node, &self.build_args(args))
    }
}

/// Convert a raw trace capture into a SQLite database.
pub fn convert_trace(streamer: &Path, capture: &Path, db: &Path) -> Result<()> {
    let args = vec![
        capture.to_string_lossy().into_owned(),
        "-e".to_string(),
        db.to_string_lossy().into_owned(),
    ];
    run_command(&streamer.to_string_lossy(), &args)?;
    if !db.is_file() {
        return Err(AnalyzeError::MissingArtifact {
            path: db.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// Values substituted into the driver argv for one round.
#[derive(Debug, Clone, Copy)]
pub struct DriverArgs<'a> {
    pub case: &'a str,
    pub case_dir: &'a Path,
    pub output: &'a Path,
    /// Sampling event, empty when the driver's default applies.
    pub event: &'a str,
    pub trace: bool,
}

/// Substitute `{case}`, `{case_dir}`, `{output}`, `{event}` and `{trace}`
/// in each argument. `{trace}` becomes `true` or `false`.
pub fn substitute_args(template: &[String], values: &DriverArgs<'_>) -> Vec<String> {
    let trace = if values.trace { "true" } else { "false" };
    template
        .iter()
        .map(|arg| {
            arg.replace("{case_dir}", &values.case_dir.to_string_lossy())
                .replace("{case}", values.case)
                .replace("{output}", &values.output.to_string_lossy())
                .replace("{event}", values.event)
                .replace("{trace}", trace)
        })
        .collect()
}
