use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use loom_controller::{Controller, ControllerConfig, Manager};
use loom_kubehub::KubeStore;
use loom_templates::YttPreprocessor;
use tracing::{info, warn};

fn init_tracing() {
    let env = std::env::var("LOOM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LOOM_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let config = ControllerConfig::from_env();
    info!(?config, "starting loom");

    let store = KubeStore::try_default().await.context("connecting to the cluster")?;
    let controller = Controller::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(YttPreprocessor::from_env()),
    );
    let (mut task, cancel) = Manager::new(controller, config).start().await?;

    let interrupted = tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                warn!(error = %e, "unable to listen for ctrl-c");
            }
            true
        }
        r = &mut task => {
            r.context("controller task")?;
            false
        }
    };
    if interrupted {
        info!("Ctrl-C received; shutting down");
        cancel.cancel();
        task.await.context("controller task")?;
    } else {
        warn!("controller stopped on its own");
    }
    Ok(())
}
