//! hapray library - offline analysis of captured app performance runs.
//!
//! A case directory holds, per interaction step, a CPU sampling database
//! under `hiperf/<step>/` and a trace database under `htrace/<step>/`. This
//! crate turns those into per-step frame reports, builds the case HTML
//! report and summarizes many cases into one comparison spreadsheet.
//!
//! # Modules
//!
//! - [`analyze`] - SQLite handles and the frame, empty-frame and component analyses
//! - [`pipeline`] - analyzer registry and parallel step processing for one case
//! - [`report`] - round selection, external perf analysis and the HTML report
//! - [`rounds`] - test-case selection and the per-case round loop
//! - [`summary`] - cross-run pivot with baseline-relative deltas
//! - [`actions`] - the `perf`, `update`, `summary` and `frames` actions
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//! use hapray::{pipeline, Config};
//!
//! let config = Config::load(None).expect("default config");
//! let outcome = pipeline::analyze_case(
//!     Path::new("./reports/Case_0010"),
//!     &config,
//!     &AtomicBool::new(false),
//! )
//! .expect("analysis failed");
//! println!("{} reports written", outcome.reports.len());
//! ```

pub mod actions;
pub mod analyze;
pub mod config;
pub mod error;
pub mod exec;
pub mod layout;
pub mod pipeline;
pub mod report;
pub mod rounds;
pub mod summary;

// Re-export for convenience
pub use config::Config;
pub use error::{AnalyzeError, ConfigError};
pub use layout::StepArtifacts;
pub use pipeline::{analyze_case, CaseAnalysis, StepAnalyzer};
