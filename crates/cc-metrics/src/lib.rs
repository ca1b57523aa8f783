use std::env;
use std::sync::OnceLock;

use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Start a Prometheus exporter on `0.0.0.0:<port>` and publish a build-info
/// gauge for the calling service.
///
/// The port comes from `port_env` when set, `default_port` otherwise. Safe to
/// call more than once; only the first call installs the recorder. A bind
/// failure is logged and tolerated so a second service instance on the same
/// host still runs.
pub fn init_metrics(
    service: &'static str,
    port_env: &str,
    default_port: u16,
) -> Option<&'static PrometheusHandle> {
    let port = env::var(port_env)
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(default_port);

    if let Some(existing) = PROMETHEUS_HANDLE.get() {
        return Some(existing);
    }

    match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install_recorder()
    {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
            gauge!("build_info", "service" => service, "version" => env!("CARGO_PKG_VERSION"))
                .set(1.0);
            info!(service, metrics_port = port, "started prometheus exporter");
            PROMETHEUS_HANDLE.get()
        }
        Err(err) => {
            warn!(service, error = %err, metrics_port = port, "failed to start prometheus exporter");
            PROMETHEUS_HANDLE.get()
        }
    }
}
