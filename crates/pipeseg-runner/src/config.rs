use crate::error::{LaunchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_EXPERIMENT_TAG: &str = "dinov2_base";
pub const DEFAULT_SPLIT: &str = "40%";
pub const DEFAULT_PYTHON: &str = "python";
pub const DEFAULT_MASTER_ADDR: &str = "localhost";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    #[default]
    Levir,
    Whu,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::Levir, Dataset::Whu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Levir => "levir",
            Dataset::Whu => "whu",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        Dataset::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| LaunchError::UnknownDataset {
                name: s.to_string(),
                expected: expected_names(Dataset::ALL.iter().map(|d| d.as_str())),
            })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    #[default]
    #[serde(rename = "unimatch_v2")]
    UniMatchV2,
    Supervised,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::UniMatchV2, Method::Supervised];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::UniMatchV2 => "unimatch_v2",
            Method::Supervised => "supervised",
        }
    }

    /// Training entrypoint handed to the distributed launcher.
    pub fn script(&self) -> String {
        format!("{}.py", self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| LaunchError::UnknownMethod {
                name: s.to_string(),
                expected: expected_names(Method::ALL.iter().map(|m| m.as_str())),
            })
    }
}

fn expected_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

/// The four named values that select one training run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub dataset: Dataset,
    pub method: Method,
    pub experiment_tag: String,
    pub split: String,
}

impl RunConfig {
    pub fn new(
        dataset: Dataset,
        method: Method,
        experiment_tag: impl Into<String>,
        split: impl Into<String>,
    ) -> Result<Self> {
        let cfg = Self {
            dataset,
            method,
            experiment_tag: experiment_tag.into(),
            split: split.into(),
        };
        validate_path_component("experiment tag", &cfg.experiment_tag)?;
        validate_path_component("split", &cfg.split)?;
        Ok(cfg)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::default(),
            method: Method::default(),
            experiment_tag: DEFAULT_EXPERIMENT_TAG.to_string(),
            split: DEFAULT_SPLIT.to_string(),
        }
    }
}

// Tags and splits are interpolated into paths as a single component each.
fn validate_path_component(field: &'static str, value: &str) -> Result<()> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value == "." || value == ".." {
        Some("must not be a relative directory reference")
    } else if value.contains('/') || value.contains('\\') {
        Some("must not contain path separators")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(LaunchError::InvalidComponent {
            field,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Runtime parameters supplied by whoever starts the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchParams {
    pub nproc: u32,
    pub port: u16,
}

impl LaunchParams {
    pub fn new(nproc: u32, port: u16) -> Result<Self> {
        if nproc == 0 {
            return Err(LaunchError::InvalidParam {
                name: "nproc",
                reason: "worker count must be at least 1".to_string(),
            });
        }
        if port == 0 {
            return Err(LaunchError::InvalidParam {
                name: "port",
                reason: "port must be non-zero".to_string(),
            });
        }
        Ok(Self { nproc, port })
    }
}

/// How the launcher itself behaves, as opposed to what it launches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchOptions {
    pub root: PathBuf,
    pub python: String,
    pub master_addr: String,
    pub preflight: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            python: DEFAULT_PYTHON.to_string(),
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            preflight: true,
        }
    }
}

/// Optional YAML file pre-filling any of the run selection values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunProfile {
    pub dataset: Option<String>,
    pub method: Option<String>,
    pub exp: Option<String>,
    pub split: Option<String>,
    pub python: Option<String>,
    pub master_addr: Option<String>,
}

impl RunProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| LaunchError::ReadProfile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| LaunchError::ParseProfile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values given explicitly on the command line; each wins over the profile.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub dataset: Option<Dataset>,
    pub method: Option<Method>,
    pub exp: Option<String>,
    pub split: Option<String>,
    pub python: Option<String>,
    pub master_addr: Option<String>,
}

/// Layer explicit values over a profile over the built-in defaults.
pub fn merge_selection(
    explicit: Selection,
    profile: Option<RunProfile>,
    root: PathBuf,
    preflight: bool,
) -> Result<(RunConfig, LaunchOptions)> {
    let profile = profile.unwrap_or_default();
    let defaults = RunConfig::default();

    let dataset = match (explicit.dataset, profile.dataset) {
        (Some(dataset), _) => dataset,
        (None, Some(name)) => name.parse()?,
        (None, None) => defaults.dataset,
    };
    let method = match (explicit.method, profile.method) {
        (Some(method), _) => method,
        (None, Some(name)) => name.parse()?,
        (None, None) => defaults.method,
    };
    let exp = explicit
        .exp
        .or(profile.exp)
        .unwrap_or(defaults.experiment_tag);
    let split = explicit.split.or(profile.split).unwrap_or(defaults.split);
    let cfg = RunConfig::new(dataset, method, exp, split)?;

    let options = LaunchOptions {
        root,
        python: explicit
            .python
            .or(profile.python)
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        master_addr: explicit
            .master_addr
            .or(profile.master_addr)
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
        preflight,
    };
    Ok((cfg, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pipeseg_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn defaults_select_the_reference_run() {
        assert_eq!(Dataset::default(), Dataset::Levir);
        assert_eq!(Method::default(), Method::UniMatchV2);
    }

    #[test]
    fn profile_loads_from_file() {
        let dir = scratch_dir("profile_load");
        let path = dir.join("run.yaml");
        fs::write(
            &path,
            "dataset: whu\nmethod: supervised\nexp: r50\nsplit: '10%'\nmaster_addr: 127.0.0.1\n",
        )
        .expect("write profile");

        let profile = RunProfile::load(&path).expect("load profile");
        assert_eq!(profile.dataset.as_deref(), Some("whu"));
        assert_eq!(profile.method.as_deref(), Some("supervised"));
        assert_eq!(profile.exp.as_deref(), Some("r50"));
        assert_eq!(profile.split.as_deref(), Some("10%"));
        assert_eq!(profile.master_addr.as_deref(), Some("127.0.0.1"));
        assert_eq!(profile.python, None);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_profile_is_a_read_error() {
        let dir = scratch_dir("profile_missing");
        let path = dir.join("absent.yaml");

        let err = RunProfile::load(&path).expect_err("file does not exist");
        assert!(matches!(err, LaunchError::ReadProfile { .. }), "{:?}", err);
        assert_eq!(err.code(), "profile_invalid");
        assert!(err.to_string().contains("absent.yaml"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_profile_is_a_parse_error() {
        let dir = scratch_dir("profile_malformed");
        let path = dir.join("bad.yaml");
        fs::write(&path, "dataset: [levir\nsplit: 10%\n").expect("write profile");

        let err = RunProfile::load(&path).expect_err("not valid yaml");
        assert!(matches!(err, LaunchError::ParseProfile { .. }), "{:?}", err);
        assert_eq!(err.code(), "profile_invalid");

        fs::write(&path, "epochs: 80\n").expect("rewrite profile");
        let err = RunProfile::load(&path).expect_err("unknown key");
        assert!(matches!(err, LaunchError::ParseProfile { .. }), "{:?}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dataset_and_method_parse_known_names() {
        assert_eq!("levir".parse::<Dataset>().expect("levir"), Dataset::Levir);
        assert_eq!("whu".parse::<Dataset>().expect("whu"), Dataset::Whu);
        assert_eq!(
            "unimatch_v2".parse::<Method>().expect("unimatch"),
            Method::UniMatchV2
        );
        assert_eq!(
            "supervised".parse::<Method>().expect("supervised"),
            Method::Supervised
        );
        assert_eq!(Method::UniMatchV2.script(), "unimatch_v2.py");
    }

    #[test]
    fn unknown_dataset_lists_accepted_values() {
        let err = "levr".parse::<Dataset>().expect_err("typo must fail");
        let msg = err.to_string();
        assert!(msg.contains("'levr'"), "{}", msg);
        assert!(msg.contains("levir, whu"), "{}", msg);
        assert_eq!(err.code(), "config_invalid");

        let err = "unimatch".parse::<Method>().expect_err("unknown method");
        assert!(err.to_string().contains("unimatch_v2, supervised"));
    }

    #[test]
    fn run_config_rejects_components_that_escape_their_directory() {
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(
                RunConfig::new(Dataset::Levir, Method::Supervised, "tag", bad).is_err(),
                "split '{}' should be rejected",
                bad
            );
            assert!(
                RunConfig::new(Dataset::Levir, Method::Supervised, bad, "10%").is_err(),
                "tag '{}' should be rejected",
                bad
            );
        }
        assert!(RunConfig::new(Dataset::Whu, Method::Supervised, "r50", "10%").is_ok());
    }

    #[test]
    fn launch_params_reject_zero_values() {
        assert!(LaunchParams::new(0, 12345).is_err());
        assert!(LaunchParams::new(4, 0).is_err());
        assert_eq!(
            LaunchParams::new(4, 12345).expect("valid"),
            LaunchParams {
                nproc: 4,
                port: 12345
            }
        );
    }

    #[test]
    fn explicit_values_override_profile_and_defaults() {
        let profile: RunProfile =
            serde_yaml::from_str("dataset: whu\nexp: r101\nsplit: '10%'\npython: python3\n")
                .expect("profile yaml");
        let explicit = Selection {
            split: Some("5%".to_string()),
            ..Selection::default()
        };
        let (cfg, opts) =
            merge_selection(explicit, Some(profile), PathBuf::from("/work"), true).expect("merge");
        assert_eq!(cfg.dataset, Dataset::Whu);
        assert_eq!(cfg.method, Method::UniMatchV2);
        assert_eq!(cfg.experiment_tag, "r101");
        assert_eq!(cfg.split, "5%");
        assert_eq!(opts.python, "python3");
        assert_eq!(opts.master_addr, DEFAULT_MASTER_ADDR);
        assert_eq!(opts.root, PathBuf::from("/work"));
    }

    #[test]
    fn misspelled_profile_dataset_fails_fast() {
        let profile = RunProfile {
            dataset: Some("wuh".to_string()),
            ..RunProfile::default()
        };
        let err = merge_selection(Selection::default(), Some(profile), PathBuf::from("."), true)
            .expect_err("typo in profile");
        assert!(err.to_string().contains("unknown dataset 'wuh'"));

        let explicit = Selection {
            dataset: Some(Dataset::Levir),
            ..Selection::default()
        };
        let profile = RunProfile {
            dataset: Some("wuh".to_string()),
            ..RunProfile::default()
        };
        let (cfg, _) = merge_selection(explicit, Some(profile), PathBuf::from("."), true)
            .expect("explicit value shadows the profile");
        assert_eq!(cfg.dataset, Dataset::Levir);
    }

    #[test]
    fn empty_selection_uses_defaults() {
        let (cfg, opts) =
            merge_selection(Selection::default(), None, PathBuf::from("."), false).expect("merge");
        assert_eq!(cfg, RunConfig::default());
        assert_eq!(cfg.split, "40%");
        assert_eq!(opts.python, "python");
        assert!(!opts.preflight);
    }

    #[test]
    fn profile_rejects_unknown_keys() {
        let parsed = serde_yaml::from_str::<RunProfile>("datasets: whu\n");
        assert!(parsed.is_err());
    }
}
