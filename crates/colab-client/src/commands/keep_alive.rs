//! Keep-alive command: runs the keep-alive loop in the foreground.

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use colab_assignments::KeepAlive;

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Keeps every assigned server alive until Ctrl+C.
pub async fn run(config: &ClientConfig) -> ClientResult<()> {
    let manager = super::assignment_manager(config)?;

    match manager.reconcile_assigned_servers().await {
        Ok(removed) if !removed.is_empty() => {
            info!(removed = removed.len(), "dropped servers no longer assigned");
        }
        Ok(_) => {}
        Err(e) => warn!("could not reconcile assignments: {}", e),
    }

    let mut events = manager.subscribe();
    let keep_alive = KeepAlive::new(config.keep_alive.to_keep_alive_config(), manager);
    let handle = keep_alive.handle();
    let task = tokio::spawn(keep_alive.run());

    eprintln!("Keeping assigned servers alive. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    for server in &event.changed {
                        info!(
                            server_id = %server.id,
                            expiry = %server.connection_information.token_expiry,
                            "connection refreshed"
                        );
                    }
                    for removed in &event.removed {
                        info!(
                            server_id = %removed.server.id,
                            user_initiated = removed.user_initiated,
                            "server removed"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed assignment events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("stopping keep-alive");
    if handle.stop().await.is_err() {
        warn!("keep-alive loop already stopped");
    }
    if let Err(e) = task.await {
        warn!("keep-alive task failed: {}", e);
    }
    let state = handle.state().await;
    if let Some(error) = state.last_error {
        eprintln!("Last keep-alive error: {}", error);
    }
    Ok(())
}
