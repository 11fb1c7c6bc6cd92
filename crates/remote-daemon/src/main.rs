mod command;
mod error;
mod events;
mod hls;
mod http;
mod ipc;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use remote_proto::config::Config;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging
    let data_dir = remote_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,remote_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if remote_proto::platform::find_mpv_binary().is_none() {
        anyhow::bail!("mpv binary not found; install mpv or set MPV_PATH");
    }

    let supervisor = Arc::new(supervisor::Supervisor::new(config.mpv.clone()));
    let hub = Arc::new(events::EventHub::default());
    let hls = Arc::new(hls::HlsService::new(config.hls.clone(), hub.clone()));

    // Idle reaper: instances untouched past the threshold are shut down
    let reaper = {
        let supervisor = supervisor.clone();
        let idle = Duration::from_secs(config.reaper.idle_secs);
        let sweep = Duration::from_secs(config.reaper.sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reaped = supervisor.reap_idle_instances(idle).await;
                if reaped > 0 {
                    info!("reaped {} idle instance(s)", reaped);
                }
            }
        })
    };

    let state = http::AppState {
        supervisor: supervisor.clone(),
        hls: hls.clone(),
        hub,
    };
    let _http_handle = http::start_server(config.http.bind_address.clone(), config.http.port, state);

    info!("Daemon initialised, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, cleaning up");

    reaper.abort();
    hls.shutdown().await;
    for instance in supervisor.list_instances().await {
        let _ = supervisor.stop_instance(&instance.id).await;
    }

    info!("Daemon stopped");
    Ok(())
}
