use std::{process::ExitCode, sync::Arc, time::Duration};
use tether_hub::{
    config::{load_config, HubConfig},
    logging::init_logging,
    serve,
    tts::{build_synthesizer, SpeechSynthesizer},
    Hub,
};
use tracing::{error, info};

/// How long in-flight work may drain after the listener stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tether-hub: {err}");
            return ExitCode::FAILURE;
        }
    };
    let log_guard = init_logging(&config);
    let log_file = log_guard
        .as_ref()
        .and_then(|guard| guard.path())
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    let synth = match build_synthesizer(&config) {
        Ok(synth) => synth,
        Err(err) => {
            error!(event = "invalid_config", error = %err);
            return ExitCode::FAILURE;
        }
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(event = "runtime_error", error = %err);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(config, synth, log_file));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    code
}

async fn run(
    config: HubConfig,
    synth: Option<Arc<dyn SpeechSynthesizer>>,
    log_file: String,
) -> ExitCode {
    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", addr = %config.addr, error = %err);
            return ExitCode::FAILURE;
        }
    };
    let addr = config.addr;
    let workers = config.workers;
    let engine = synth
        .as_ref()
        .map(|synth| synth.name().to_string())
        .unwrap_or_else(|| "none".to_string());
    let hub = Hub::new(config, synth);
    info!(
        event = "hub_start",
        addr = %addr,
        tts = %engine,
        workers = workers,
        log_file = %log_file
    );

    let signal_hub = hub.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(event = "shutdown_signal");
        signal_hub.shutdown();
    });

    match serve(listener, hub).await {
        Ok(()) => {
            info!(event = "hub_stop");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(event = "hub_error", error = %err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
