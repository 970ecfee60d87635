use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown dataset '{name}' (expected one of: {expected})")]
    UnknownDataset { name: String, expected: String },

    #[error("unknown method '{name}' (expected one of: {expected})")]
    UnknownMethod { name: String, expected: String },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidComponent {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error(
        "preflight failed: missing {} (available splits: {})",
        join_paths(.missing),
        join_or_none(.available_splits)
    )]
    Preflight {
        missing: Vec<PathBuf>,
        available_splits: Vec<String>,
    },

    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for launched process: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to read profile {}: {source}", .path.display())]
    ReadProfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse profile {}: {source}", .path.display())]
    ParseProfile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl LaunchError {
    /// Stable code used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::UnknownDataset { .. }
            | LaunchError::UnknownMethod { .. }
            | LaunchError::InvalidComponent { .. }
            | LaunchError::InvalidParam { .. } => "config_invalid",
            LaunchError::Preflight { .. } => "preflight_failed",
            LaunchError::CreateDir { .. } | LaunchError::Log { .. } => "filesystem_error",
            LaunchError::Spawn { .. } | LaunchError::Wait(_) => "spawn_failed",
            LaunchError::ReadProfile { .. } | LaunchError::ParseProfile { .. } => {
                "profile_invalid"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
