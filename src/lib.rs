// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod metrics;
pub mod progress;
pub mod request;
pub mod resolver;
pub mod session;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::BridgeConfig;
pub use crate::job::{run_analysis, run_analysis_with_progress, CompletedJob, ProgressSink};
pub use crate::resolver::AnalysisResult;

use axum::Router;

/// Build the full Router for `config`.
pub fn app(config: BridgeConfig) -> Router {
    router(AppState::new(config))
}

/// Build the Router from `$RESEARCH_CONFIG_PATH` / `config/bridge.toml` / env overrides.
pub fn app_from_env() -> anyhow::Result<Router> {
    let config = BridgeConfig::from_env()?;
    tracing::info!(
        target: "api",
        project_root = %config.project_root.display(),
        entry_point = %config.entry_point,
        max_runtime_secs = config.max_runtime.as_secs(),
        dev_mode = config.dev_mode,
        "bridge configured"
    );
    Ok(app(config))
}
