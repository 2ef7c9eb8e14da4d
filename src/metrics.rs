use axum::{routing::get, Router};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::warn;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder once per process.
    ///
    /// Returns `None` if another global recorder is already installed.
    pub fn global() -> Option<&'static Metrics> {
        static METRICS: OnceCell<Option<Metrics>> = OnceCell::new();
        METRICS
            .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => {
                    describe_series();
                    Some(Metrics { handle })
                }
                Err(e) => {
                    warn!(target: "metrics", error = %e, "prometheus recorder not installed");
                    None
                }
            })
            .as_ref()
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

fn describe_series() {
    describe_counter!("analysis_jobs_started_total", "Analysis processes spawned.");
    describe_counter!(
        "analysis_jobs_finished_total",
        "Analysis jobs finished, labelled by outcome."
    );
    describe_histogram!("analysis_job_duration_ms", "Job wall time in milliseconds.");
    describe_counter!(
        "analysis_progress_events_total",
        "Progress lines classified, labelled by stream."
    );
    describe_counter!(
        "analysis_sessions_abandoned_total",
        "Streaming sessions whose client went away before the job resolved."
    );
    describe_counter!(
        "analysis_parse_fallbacks_total",
        "Malformed structured payloads recovered by text scraping."
    );
}
