//! Resolves a segmentation training run into paths and a distributed launch,
//! then runs it with its console output mirrored into `<save_dir>/out.log`.

pub mod config;
pub mod error;
pub mod launch;
pub mod paths;
pub mod tee;

pub use config::{
    merge_selection, Dataset, LaunchOptions, LaunchParams, Method, RunConfig, RunProfile,
    Selection,
};
pub use error::{LaunchError, Result};
pub use launch::{
    launch_with_terminal, plan_launch, run_plan, LaunchOutcome, LaunchPlan, LaunchSpec,
};
pub use paths::{available_splits, describe_splits, preflight, ResolvedPaths, SplitInfo};
pub use tee::TeeWriter;
