//! Integration tests for the round loop and the `perf` batch driven by a
//! shell stand-in for the device driver.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use hapray::actions::{perf_action, PerfOptions};
use hapray::rounds::{
    is_round_complete, run_case_rounds, CaseRunner, CommandRunner, RoundPlan, TestCase,
};
use hapray::Config;
use serde_json::json;
use tempfile::TempDir;

/// Declares two steps; every case except `Case_A` only captures the first.
const DRIVER_SCRIPT: &str = r#"
case="$1"; out="$2"
echo "$case" >> "$3"
mkdir -p "$out/hiperf/step1" "$out/hiperf/step2"
printf '[{"name":"step1","stepIdx":1},{"name":"step2","stepIdx":2}]' > "$out/hiperf/steps.json"
printf x > "$out/hiperf/step1/perf.data"
if [ "$case" = "Case_A" ]; then printf x > "$out/hiperf/step2/perf.data"; fi
"#;

fn driver_argv(log: &Path) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        DRIVER_SCRIPT.into(),
        "driver".into(),
        "{case}".into(),
        "{output}".into(),
        log.to_string_lossy().into_owned(),
    ]
}

fn test_case(name: &str) -> TestCase {
    TestCase {
        name: name.to_string(),
        app_dir: PathBuf::from("/cases/demo"),
        script: PathBuf::from(format!("/cases/demo/{name}.py")),
    }
}

fn invocations(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Writes four declared steps with a single capture, never enough.
struct OneCaptureRunner {
    calls: AtomicUsize,
}

impl CaseRunner for OneCaptureRunner {
    fn run(&self, _case: &TestCase, output: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sample = output.join("hiperf");
        fs::create_dir_all(sample.join("step1"))?;
        let steps: Vec<_> = (1..=4)
            .map(|i| json!({ "name": format!("step{i}"), "stepIdx": i }))
            .collect();
        fs::write(sample.join("steps.json"), serde_json::to_string(&steps)?)?;
        fs::write(sample.join("step1").join("perf.data"), b"capture")?;
        Ok(())
    }
}

#[test]
fn test_round_with_one_capture_in_four_is_abandoned() {
    let dir = TempDir::new().unwrap();
    let runner = OneCaptureRunner {
        calls: AtomicUsize::new(0),
    };
    let plan = RoundPlan {
        rounds: 1,
        max_retries: 5,
        data_filename: "perf.data".into(),
    };

    let rounds = run_case_rounds(
        &runner,
        &test_case("Case_0010"),
        dir.path(),
        &plan,
        &AtomicBool::new(false),
    );
    assert!(rounds.is_empty());
    assert_eq!(runner.calls.load(Ordering::SeqCst), 6);

    // The last attempt stays on disk for inspection.
    let leftover = dir.path().join("Case_0010_round0");
    assert!(leftover.is_dir());
    assert!(!is_round_complete(&leftover, "perf.data"));
}

#[test]
fn test_command_runner_substitutes_placeholders() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("driver.log");
    let runner = CommandRunner::new(driver_argv(&log)).unwrap();
    let plan = RoundPlan {
        rounds: 2,
        max_retries: 0,
        data_filename: "perf.data".into(),
    };

    let rounds = run_case_rounds(
        &runner,
        &test_case("Case_A"),
        dir.path(),
        &plan,
        &AtomicBool::new(false),
    );
    assert_eq!(
        rounds,
        vec![
            dir.path().join("Case_A_round0"),
            dir.path().join("Case_A_round1"),
        ]
    );
    assert_eq!(invocations(&log), vec!["Case_A", "Case_A"]);
}

#[test]
fn test_perf_batch_continues_past_failed_case() {
    let dir = TempDir::new().unwrap();
    let app_dir = dir.path().join("testcases").join("demo");
    fs::create_dir_all(&app_dir).unwrap();
    for name in ["Case_A", "Case_B"] {
        fs::write(app_dir.join(format!("{name}.py")), b"").unwrap();
    }
    let log = dir.path().join("driver.log");
    let reports = dir.path().join("reports");

    let config = Config::default()
        .with_override("driver.command", driver_argv(&log))
        .with_override("run_testcases", vec!["Case_".to_string()])
        .with_override("rounds", 1u64)
        .with_override("max_round_retries", 1u64)
        .with_override("toolbox.node", "hapray-test-missing-node");
    let options = PerfOptions {
        testcases: dir.path().join("testcases"),
        reports: Some(reports.clone()),
    };

    // Round selection needs the toolbox, so no case can produce a report.
    assert!(!perf_action(
        Arc::new(config),
        &options,
        Arc::new(AtomicBool::new(false)),
    ));

    assert_eq!(invocations(&log), vec!["Case_A", "Case_B", "Case_B"]);
    assert!(is_round_complete(&reports.join("Case_A_round0"), "perf.data"));
    assert!(!is_round_complete(&reports.join("Case_B_round0"), "perf.data"));
}

#[test]
fn test_perf_without_patterns_fails() {
    let dir = TempDir::new().unwrap();
    let options = PerfOptions {
        testcases: dir.path().to_path_buf(),
        reports: Some(dir.path().join("reports")),
    };
    assert!(!perf_action(
        Arc::new(Config::default()),
        &options,
        Arc::new(AtomicBool::new(false)),
    ));
    assert!(!dir.path().join("reports").exists());
}

/// Appends the substituted event and trace flag of every run to `log`.
fn capture_settings_argv(log: &Path) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        r#"echo "event=$1 trace=$2" >> "$3""#.into(),
        "driver".into(),
        "{event}".into(),
        "{trace}".into(),
        log.to_string_lossy().into_owned(),
    ]
}

#[test]
fn test_driver_receives_capture_settings() {
    let dir = TempDir::new().unwrap();
    let plan = RoundPlan {
        rounds: 1,
        max_retries: 0,
        data_filename: "perf.data".into(),
    };

    let defaults_log = dir.path().join("defaults.log");
    let config =
        Config::default().with_override("driver.command", capture_settings_argv(&defaults_log));
    let runner = CommandRunner::from_config(&config).unwrap();
    let cancel = AtomicBool::new(false);
    run_case_rounds(&runner, &test_case("Case_A"), dir.path(), &plan, &cancel);
    assert_eq!(invocations(&defaults_log), vec!["event= trace=true"]);

    let overridden_log = dir.path().join("overridden.log");
    let config = Config::default()
        .with_override("driver.command", capture_settings_argv(&overridden_log))
        .with_override("hiperf.event", "raw-cpu-cycles")
        .with_override("trace.enable", false);
    let runner = CommandRunner::from_config(&config).unwrap();
    run_case_rounds(&runner, &test_case("Case_A"), dir.path(), &plan, &cancel);
    assert_eq!(
        invocations(&overridden_log),
        vec!["event=raw-cpu-cycles trace=false"]
    );
}

#[test]
fn test_perf_flags_reach_the_driver() {
    let dir = TempDir::new().unwrap();
    let app_dir = dir.path().join("testcases").join("demo");
    fs::create_dir_all(&app_dir).unwrap();
    fs::write(app_dir.join("Case_A.py"), b"").unwrap();
    let log = dir.path().join("driver.log");

    // JSON is valid YAML.
    let config = dir.path().join("config.yaml");
    let settings = json!({
        "driver": { "command": capture_settings_argv(&log) },
        "rounds": 1,
        "max_round_retries": 0,
        "toolbox": { "node": "hapray-test-missing-node" },
    });
    fs::write(&config, settings.to_string()).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_hapray"))
        .arg("--config")
        .arg(&config)
        .arg("perf")
        .arg("--testcases")
        .arg(dir.path().join("testcases"))
        .arg("--reports")
        .arg(dir.path().join("reports"))
        .args(["--circles", "--no-trace", "--run-testcases", "Case_A"])
        .env("RUST_LOG", "warn")
        .status()
        .unwrap();
    // The stub captures nothing, so the case itself fails.
    assert!(!status.success());
    assert_eq!(invocations(&log), vec!["event=raw-cpu-cycles trace=false"]);
}
