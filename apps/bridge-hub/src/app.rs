//! Application orchestrator: object store, data channel and hub server.

use std::sync::Arc;

use l4d2_bridge_data_channel::FileStore;
use l4d2_bridge_hub::{BridgeEvent, BridgeServer, EventReceiver};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the bridge until Ctrl-C or a fatal listener error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Object store --
    tokio::fs::create_dir_all(&config.upload_dir).await?;
    let store = Arc::new(FileStore::new(config.store_config()));
    tracing::info!(dir = %config.upload_dir.display(), "object store ready");

    // -- Data channel --
    let router = l4d2_bridge_data_channel::router(
        Arc::clone(&store),
        config.token.clone(),
        &config.file_path,
    );
    let http_listener = tokio::net::TcpListener::bind(config.http_bind).await?;
    tracing::info!(
        "data channel listening on http://{}{}",
        http_listener.local_addr()?,
        config.file_path
    );
    let http_cancel = cancel.clone();
    let http = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    // -- Hub server --
    let (server, events) = BridgeServer::new(config.hub_config(), store);
    tokio::spawn(log_events(events));

    let server_run = Arc::clone(&server);
    let ws = tokio::spawn(async move { server_run.run().await });

    tracing::info!("bridge ready");

    // -- Main loop: wait for shutdown --
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    tracing::info!("stopping services...");
    server.shutdown();
    cancel.cancel();

    match ws.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("hub server error: {e}"),
        Err(e) => tracing::error!("hub server task failed: {e}"),
    }
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("data channel error: {e}"),
        Err(e) => tracing::error!("data channel task failed: {e}"),
    }

    Ok(())
}

/// Logs every bridge event until the server drops its sender.
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        log_event(&event);
    }
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Connected {
            server_id,
            display_name,
        } => tracing::info!(%server_id, %display_name, "agent connected"),
        BridgeEvent::Disconnected {
            server_id,
            code,
            reason,
        } => tracing::info!(%server_id, %code, %reason, "agent disconnected"),
        BridgeEvent::UploadStarted {
            server_id,
            channel,
            file_name,
            size,
        } => tracing::info!(%server_id, %channel, %file_name, size, "upload started"),
        BridgeEvent::FileReceived(file) => tracing::info!(
            server_id = %file.sender,
            channel = %file.channel,
            file_id = %file.file_id,
            file_name = %file.file_name,
            size = file.size,
            path = %file.path.display(),
            "file received"
        ),
        BridgeEvent::TransferFailed {
            server_id,
            channel,
            transfer_id,
            file_name,
            code,
            message,
        } => tracing::warn!(
            %server_id,
            %channel,
            %transfer_id,
            %file_name,
            %code,
            "transfer failed: {message}"
        ),
        BridgeEvent::TaskResult {
            task_id,
            success,
            code,
            message,
        } => {
            if *success {
                tracing::info!(%task_id, "task completed");
            } else {
                tracing::warn!(%task_id, code, "task failed: {message}");
            }
        }
        BridgeEvent::AgentReport {
            server_id,
            channel,
            report,
        } => tracing::info!(
            %server_id,
            %channel,
            task_id = %report.task_id,
            ok = report.ok,
            code = report.code,
            "agent report: {}",
            report.message
        ),
    }
}
