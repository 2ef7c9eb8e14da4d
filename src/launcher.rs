//! Process launcher for the external analysis program.
//!
//! Resolves an interpreter (project-local venv first, system interpreter second)
//! and spawns `<interpreter> <entry-point> TICKER horizon risk_profile` with piped
//! output, working directory at the project root, and output-mode overrides.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::LaunchError;
use crate::request::AnalysisRequest;

/// Environment overrides handed to every analysis process.
pub const CHILD_ENV: [(&str, &str); 2] = [("JSON_OUTPUT", "true"), ("PYTHONUNBUFFERED", "1")];

#[cfg(windows)]
const SYSTEM_INTERPRETER: &str = "python";
#[cfg(not(windows))]
const SYSTEM_INTERPRETER: &str = "python3";

#[cfg(windows)]
const VENV_BIN: &[&str] = &["Scripts", "python.exe"];
#[cfg(not(windows))]
const VENV_BIN: &[&str] = &["bin", "python"];

/// A spawned analysis process with its output pipes still attached.
#[derive(Debug)]
pub struct ProcessHandle {
    pub child: Child,
    pub pid: Option<u32>,
}

/// Pick the interpreter to run the entry point with.
///
/// Order: explicit override, first existing venv interpreter under the project
/// root, platform system interpreter name.
pub fn resolve_interpreter(cfg: &BridgeConfig) -> String {
    if let Some(explicit) = cfg.interpreter.as_deref() {
        return explicit.to_string();
    }
    cfg.venv_dirs
        .iter()
        .map(|dir| venv_interpreter(&cfg.project_root, dir))
        .find(|p| p.is_file())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| SYSTEM_INTERPRETER.to_string())
}

fn venv_interpreter(root: &Path, dir: &str) -> PathBuf {
    VENV_BIN.iter().fold(root.join(dir), |p, seg| p.join(seg))
}

/// Spawn the analysis program for `req`. Never waits on the child.
pub fn launch(cfg: &BridgeConfig, req: &AnalysisRequest) -> Result<ProcessHandle, LaunchError> {
    let script = cfg.script_path();
    if !script.is_file() {
        return Err(LaunchError::ScriptNotFound(script));
    }
    let interpreter = resolve_interpreter(cfg);

    let mut cmd = Command::new(&interpreter);
    cmd.arg(&cfg.entry_point)
        .args(req.args())
        .current_dir(&cfg.project_root)
        .envs(CHILD_ENV)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // only reaps on abrupt shutdown; abandoned sessions keep their job alive
        .kill_on_drop(true);

    debug!(target: "launcher", %interpreter, script = %script.display(), "spawning analysis");

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::ExecutableNotFound(interpreter.clone())
        } else {
            LaunchError::Spawn(e)
        }
    })?;

    let pid = child.id();
    info!(
        target: "launcher",
        ticker = %req.ticker,
        horizon = %req.horizon,
        risk_profile = %req.risk_profile,
        pid = ?pid,
        %interpreter,
        "analysis process started"
    );

    Ok(ProcessHandle { child, pid })
}
