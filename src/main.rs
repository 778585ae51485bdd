use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use hapray::actions::{
    frames_action, perf_action, summary_action, update_action, PerfOptions,
};
use hapray::Config;

/// Hardware event sampled when `--circles` is given.
const CPU_CYCLES_EVENT: &str = "raw-cpu-cycles";

#[derive(Debug, Parser)]
#[command(name = "hapray")]
#[command(about = "Frame-quality and CPU-load analysis of captured app performance runs")]
#[command(version)]
struct Cli {
    /// YAML file deep-merged over the default configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset. Examples: "info", "debug,hapray::rounds=trace"
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run test cases on the device, then analyze, report and summarize
    Perf {
        /// Directory laid out as <testcases>/<app>/<case>.py
        #[arg(long)]
        testcases: PathBuf,

        /// Case name patterns (regular expressions matched from the start)
        #[arg(long, alias = "run_testcases", num_args = 1..)]
        run_testcases: Vec<String>,

        /// Directory of symbolicated .so files
        #[arg(long, alias = "so_dir")]
        so_dir: Option<PathBuf>,

        /// Sample CPU cycles instead of the default event
        #[arg(long)]
        circles: bool,

        /// Rounds per case
        #[arg(long)]
        round: Option<u32>,

        /// Disable trace capture
        #[arg(long)]
        no_trace: bool,

        /// Output directory, reports/<timestamp> when omitted
        #[arg(long)]
        reports: Option<PathBuf>,
    },
    /// Re-run analysis and HTML generation on existing reports
    Update {
        /// Directory containing the case reports
        #[arg(short, long, alias = "report_dir")]
        report_dir: PathBuf,

        /// Directory of symbolicated .so files
        #[arg(long, alias = "so_dir")]
        so_dir: Option<PathBuf>,
    },
    /// Merge every summary_info.json below a directory into a spreadsheet
    Summary {
        #[arg(short, long)]
        input: PathBuf,

        /// Defaults to <input>/summary_pivot.xlsx
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the stutter and FPS analysis of one step as JSON
    Frames {
        #[arg(long)]
        trace_db: PathBuf,

        #[arg(long)]
        perf_db: Option<PathBuf>,

        #[arg(long, default_value = "step1")]
        step: String,
    },
}

fn init_log(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(log_level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!("invalid log level: {log_level}, using info, err is: {e}");
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
    {
        eprintln!("failed to init logger: {e}");
    }
}

/// Cancellation flag set on Ctrl-C.
fn install_cancel_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Error setting Ctrl-C handler: {e}");
    }
    cancel
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Perf {
            testcases,
            run_testcases,
            so_dir,
            circles,
            round,
            no_trace,
            reports,
        } => {
            let mut config = config.with_override("trace.enable", !no_trace);
            if !run_testcases.is_empty() {
                config = config.with_override("run_testcases", run_testcases);
            }
            if let Some(so_dir) = so_dir {
                config = config.with_override(
                    "so_dir",
                    absolute(so_dir).to_string_lossy().into_owned(),
                );
            }
            if circles {
                config = config.with_override("hiperf.event", CPU_CYCLES_EVENT);
            }
            if let Some(round) = round {
                config = config.with_override("rounds", u64::from(round));
            }
            let options = PerfOptions { testcases, reports };
            Ok(perf_action(
                Arc::new(config),
                &options,
                install_cancel_handler(),
            ))
        }
        Commands::Update { report_dir, so_dir } => {
            let mut config = config;
            if let Some(so_dir) = so_dir {
                config = config.with_override(
                    "so_dir",
                    absolute(so_dir).to_string_lossy().into_owned(),
                );
            }
            Ok(update_action(
                Arc::new(config),
                &absolute(report_dir),
                install_cancel_handler(),
            ))
        }
        Commands::Summary { input, output } => Ok(summary_action(&input, output.as_deref())),
        Commands::Frames {
            trace_db,
            perf_db,
            step,
        } => {
            let result = frames_action(&trace_db, perf_db.as_deref(), &step)
                .with_context(|| format!("Frame analysis of {} failed", trace_db.display()))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            info!("{step}: {} frames", result.statistics.total_frames);
            Ok(true)
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_log(&cli.log_level);

    if run(cli)? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
