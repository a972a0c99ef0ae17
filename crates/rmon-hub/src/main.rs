mod api;
mod buffer;
mod cli;
mod logging;
mod pipeline;
mod relay;
mod source;
mod tasks;

use crate::api::{router, AppState};
use crate::cli::Settings;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::relay::{Relay, RelayConfig};
use rmon_core::AppConfig;
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let settings = Settings::load();
    if let Some(path) = logging::init_logging(&settings) {
        info!(event = "log_file", path = %path.display());
    }

    let config = match AppConfig::load(&settings.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_error", error = %err);
            std::process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        error!(event = "config_invalid", error = %err);
        std::process::exit(1);
    }

    let port = settings.port_override.unwrap_or(config.server.port);
    let addr: SocketAddr = match format!("{}:{port}", config.server.bind).parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, bind = %config.server.bind, port);
            std::process::exit(1);
        }
    };

    let pipeline = Pipeline::new(config.hosts.clone(), PipelineOptions::default());
    if let Err(err) = pipeline.start() {
        error!(event = "config_invalid", error = %err);
        std::process::exit(1);
    }
    let relay = Relay::new(
        pipeline.clone(),
        RelayConfig {
            ping_interval: settings.ping_interval,
            write_timeout: settings.write_timeout,
        },
    );
    let app = router(AppState {
        pipeline: pipeline.clone(),
        relay,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "monitor_error", error = %err, addr = %addr);
            pipeline.stop();
            std::process::exit(1);
        }
    };

    info!(
        event = "monitor_start",
        addr = %addr,
        hosts = config.hosts.len(),
        config = %settings.config_path.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "monitor_shutdown");
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "monitor_error", error = %err);
    }
    pipeline.stop();
}
