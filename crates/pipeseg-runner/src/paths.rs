use crate::config::{Dataset, RunConfig};
use crate::error::{LaunchError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const LOG_FILE_NAME: &str = "out.log";
pub const LABELED_FILE_NAME: &str = "labeled.txt";
pub const UNLABELED_FILE_NAME: &str = "unlabeled.txt";

/// Paths derived from a [`RunConfig`], relative to the project root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub config: PathBuf,
    pub labeled: PathBuf,
    pub unlabeled: PathBuf,
    pub save_dir: PathBuf,
    pub log_file: PathBuf,
}

impl ResolvedPaths {
    pub fn resolve(cfg: &RunConfig) -> Self {
        let dataset = cfg.dataset.as_str();
        let split_dir = splits_dir(cfg.dataset).join(&cfg.split);
        let save_dir = PathBuf::from("exp")
            .join(dataset)
            .join(cfg.method.as_str())
            .join(&cfg.experiment_tag)
            .join(&cfg.split);
        Self {
            config: PathBuf::from("configs").join(format!("{}.yaml", dataset)),
            labeled: split_dir.join(LABELED_FILE_NAME),
            unlabeled: split_dir.join(UNLABELED_FILE_NAME),
            log_file: save_dir.join(LOG_FILE_NAME),
            save_dir,
        }
    }

    /// The input files the training program reads, in argument order.
    pub fn inputs(&self) -> [&Path; 3] {
        [
            self.config.as_path(),
            self.labeled.as_path(),
            self.unlabeled.as_path(),
        ]
    }
}

pub fn splits_dir(dataset: Dataset) -> PathBuf {
    PathBuf::from("splits").join(dataset.as_str())
}

/// Split fractions available for a dataset, sorted by name.
pub fn available_splits(root: &Path, dataset: Dataset) -> Vec<String> {
    let dir = root.join(splits_dir(dataset));
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut out: Vec<String> = WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    out.sort();
    out
}

/// Check that every input file exists under `root` before anything is created.
pub fn preflight(root: &Path, cfg: &RunConfig, paths: &ResolvedPaths) -> Result<()> {
    let missing: Vec<PathBuf> = paths
        .inputs()
        .into_iter()
        .filter(|p| !root.join(p).is_file())
        .map(|p| p.to_path_buf())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(LaunchError::Preflight {
        missing,
        available_splits: available_splits(root, cfg.dataset),
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SplitInfo {
    pub name: String,
    pub labeled_ids: Option<usize>,
    pub unlabeled_ids: Option<usize>,
}

pub fn describe_splits(root: &Path, dataset: Dataset) -> Vec<SplitInfo> {
    let base = root.join(splits_dir(dataset));
    available_splits(root, dataset)
        .into_iter()
        .map(|name| {
            let dir = base.join(&name);
            SplitInfo {
                labeled_ids: count_ids(&dir.join(LABELED_FILE_NAME)),
                unlabeled_ids: count_ids(&dir.join(UNLABELED_FILE_NAME)),
                name,
            }
        })
        .collect()
}

fn count_ids(path: &Path) -> Option<usize> {
    let text = fs::read_to_string(path).ok()?;
    Some(text.lines().filter(|l| !l.trim().is_empty()).count())
}
