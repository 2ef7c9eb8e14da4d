//! Research Bridge — Binary Entrypoint
//! Boots the Axum HTTP server that runs analyses as subprocesses.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default, JSON lines when LOG_FORMAT=json.
/// No-op if the runtime already installed a subscriber.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("api=info,launcher=info,job=info,resolver=info,session=info,metrics=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().compact()))
        .try_init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let router = research_bridge::app_from_env()?;
    Ok(router.into())
}
