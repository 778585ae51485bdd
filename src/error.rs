//! Typed error kinds for the analysis pipeline.
//!
//! Most glue code works with `anyhow::Result`; these types exist for the
//! failures callers need to tell apart (a step aborted by a schema problem
//! versus a case failed by a subprocess, for instance).

use std::path::PathBuf;

use thiserror::Error;

/// Failure while loading or merging configuration. Always fatal at start-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {origin}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config key `{key}`: {message}")]
    Invalid { key: String, message: String },
}

/// Error kinds raised by the analyzers and orchestrators.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// An expected input file is absent.
    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// A database lacks tables the analysis depends on.
    #[error("database is missing required tables: {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    /// The SQLite engine is too old for common-table expressions.
    #[error("SQLite {version} does not support WITH clauses, 3.8.3 or newer is required")]
    SqliteTooOld { version: String },

    /// A JSON artifact could not be decoded.
    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An external tool exited unsuccessfully.
    #[error(
        "{program} failed with {}: {stderr}",
        code.map_or("signal".to_string(), |c| format!("exit code {c}"))
    )]
    Subprocess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
