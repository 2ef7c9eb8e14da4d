// src/config/bridge.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const ENV_CONFIG_PATH: &str = "RESEARCH_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

const ENV_PROJECT_ROOT: &str = "RESEARCH_PROJECT_ROOT";
const ENV_ENTRY_POINT: &str = "RESEARCH_ENTRY_POINT";
const ENV_INTERPRETER: &str = "RESEARCH_INTERPRETER";
const ENV_MAX_RUNTIME_SECS: &str = "RESEARCH_MAX_RUNTIME_SECS";
const ENV_KEEPALIVE_SECS: &str = "RESEARCH_KEEPALIVE_SECS";
const ENV_RUNTIME: &str = "RESEARCH_ENV";

fn default_project_root() -> PathBuf {
    PathBuf::from("../financial-research-analyst")
}
fn default_entry_point() -> String {
    "main.py".to_string()
}
fn default_venv_dirs() -> Vec<String> {
    vec!["venv".to_string(), ".venv".to_string()]
}
fn default_max_runtime_secs() -> u64 {
    60 * 60
}
fn default_keepalive_secs() -> u64 {
    15
}

/// On-disk shape of `config/bridge.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    #[serde(default = "default_project_root")]
    project_root: PathBuf,
    #[serde(default = "default_entry_point")]
    entry_point: String,
    #[serde(default)]
    interpreter: Option<String>,
    #[serde(default = "default_venv_dirs")]
    venv_dirs: Vec<String>,
    #[serde(default = "default_max_runtime_secs")]
    max_runtime_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    keepalive_secs: u64,
    #[serde(default)]
    dev_mode: Option<bool>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            entry_point: default_entry_point(),
            interpreter: None,
            venv_dirs: default_venv_dirs(),
            max_runtime_secs: default_max_runtime_secs(),
            keepalive_secs: default_keepalive_secs(),
            dev_mode: None,
        }
    }
}

/// Runtime settings for launching and supervising analysis jobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root of the analysis project; used as the child's working directory.
    pub project_root: PathBuf,
    /// Script path relative to `project_root`.
    pub entry_point: String,
    /// Explicit interpreter override. Skips venv discovery when set.
    pub interpreter: Option<String>,
    /// Directories under `project_root` probed for an isolated interpreter.
    pub venv_dirs: Vec<String>,
    pub max_runtime: Duration,
    pub keepalive_interval: Duration,
    /// Attach error details to failure bodies.
    pub dev_mode: bool,
    /// Expose `/metrics`.
    pub debug_routes: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_file_config(FileConfig::default())
    }
}

impl BridgeConfig {
    /// Rooted at `project_root`, everything else default.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.project_root.join(&self.entry_point)
    }

    /// Load from an explicit TOML file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading bridge config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing bridge config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let fc: FileConfig = toml::from_str(s)?;
        Ok(Self::from_file_config(fc))
    }

    /// Resolve settings using env var + fallbacks, then apply env overrides:
    /// 1) $RESEARCH_CONFIG_PATH (must exist when set)
    /// 2) config/bridge.toml
    /// 3) built-in defaults
    pub fn from_env() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn from_file_config(fc: FileConfig) -> Self {
        Self {
            project_root: fc.project_root,
            entry_point: fc.entry_point,
            interpreter: fc.interpreter.filter(|s| !s.trim().is_empty()),
            venv_dirs: fc.venv_dirs,
            max_runtime: Duration::from_secs(fc.max_runtime_secs.max(1)),
            keepalive_interval: Duration::from_secs(fc.keepalive_secs.max(1)),
            dev_mode: fc.dev_mode.unwrap_or_else(dev_env_detected),
            debug_routes: false,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env(ENV_PROJECT_ROOT) {
            self.project_root = PathBuf::from(v);
        }
        if let Some(v) = non_empty_env(ENV_ENTRY_POINT) {
            self.entry_point = v;
        }
        if let Some(v) = non_empty_env(ENV_INTERPRETER) {
            self.interpreter = Some(v);
        }
        if let Some(secs) = parse_secs_env(non_empty_env(ENV_MAX_RUNTIME_SECS)) {
            self.max_runtime = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs_env(non_empty_env(ENV_KEEPALIVE_SECS)) {
            self.keepalive_interval = Duration::from_secs(secs);
        }
        self.debug_routes = env::var("DEBUG_ROUTES").ok().as_deref() == Some("1");
    }
}

/// Dev env: debug build OR RESEARCH_ENV in {local, development, dev}.
fn dev_env_detected() -> bool {
    cfg!(debug_assertions)
        || matches!(
            env::var(ENV_RUNTIME)
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// parse a positive seconds value; zero or garbage keeps the current setting
fn parse_secs_env(raw: Option<String>) -> Option<u64> {
    raw.and_then(|s| s.parse::<u64>().ok()).filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.entry_point, "main.py");
        assert_eq!(cfg.max_runtime, Duration::from_secs(3600));
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(15));
        assert_eq!(cfg.venv_dirs, vec!["venv".to_string(), ".venv".to_string()]);
        assert!(cfg.interpreter.is_none());
    }

    #[test]
    fn toml_partial_override_keeps_other_defaults() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
            project_root = "/srv/analyst"
            interpreter = "python3.12"
            keepalive_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.project_root, PathBuf::from("/srv/analyst"));
        assert_eq!(cfg.interpreter.as_deref(), Some("python3.12"));
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(1));
        assert_eq!(cfg.script_path(), PathBuf::from("/srv/analyst/main.py"));
    }

    #[test]
    fn secs_parsing_rejects_zero_and_garbage() {
        assert_eq!(parse_secs_env(Some("30".into())), Some(30));
        assert_eq!(parse_secs_env(Some("0".into())), None);
        assert_eq!(parse_secs_env(Some("soon".into())), None);
        assert_eq!(parse_secs_env(None), None);
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        env::set_var(ENV_PROJECT_ROOT, "/opt/analyst");
        env::set_var(ENV_MAX_RUNTIME_SECS, "120");
        env::set_var("DEBUG_ROUTES", "1");
        let cfg = BridgeConfig::from_env().unwrap();
        assert_eq!(cfg.project_root, PathBuf::from("/opt/analyst"));
        assert_eq!(cfg.max_runtime, Duration::from_secs(120));
        assert!(cfg.debug_routes);

        env::remove_var(ENV_PROJECT_ROOT);
        env::remove_var(ENV_MAX_RUNTIME_SECS);
        env::remove_var("DEBUG_ROUTES");

        // Explicit path must exist
        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml"));
        assert!(BridgeConfig::from_env().is_err());
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
