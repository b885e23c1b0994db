use std::time::Duration;

use clap::Parser as _;
use spot_handler_ext as k8s;
use spot_handler_kubeapi::KubeApi;
use spot_handler_mothership::MothershipClient;
use tokio_util::sync::CancellationToken;

use k8s::corev1;

use config::Config;
use handler::SpotHandler;
use version::BUILD_INFO;

mod config;
mod debug;
mod handler;
mod version;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter())
        .init();
    tracing::info!(
        version = BUILD_INFO.version,
        commit = BUILD_INFO.git_commit,
        git_ref = BUILD_INFO.git_ref,
        provider = %config.provider,
        "Starting spot-handler"
    );

    let kubeapi = KubeApi::new().await?;
    let server = kubeapi.server_version().await?;
    tracing::info!(version = %server.git_version, "Connected to Kubernetes API server");

    let checker = config.provider.checker()?;
    let reporter = MothershipClient::new(&config.mothership()?)?;

    if let Some(port) = config.debug_port {
        tokio::spawn(async move {
            if let Err(err) = debug::serve(port).await {
                tracing::error!(port, ?err, "Debug server failed");
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    SpotHandler::new(kubeapi, Box::new(reporter), checker, &config.node_name)
        .with_poll_interval(config.poll_interval())
        .with_grace_period(config.grace_period)
        .with_policy(config.interruption_policy)
        .run(shutdown)
        .await;

    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    match shutdown_signal().await {
        Ok(signal) => {
            tracing::info!(signal, "Received shutdown signal");
            shutdown.cancel();
        }
        Err(err) => tracing::error!(?err, "Cannot listen for shutdown signals"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl+C")
}
