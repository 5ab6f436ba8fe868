use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::scheduler::TestScheduler;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal
/// arrives. The host process watches this token, stops the scheduler, and
/// lets in-flight test runs drain.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

/// Wait for every running job to report back, up to `grace`.
///
/// Called after [`TestScheduler::shutdown`]: the queue is already drained,
/// so this only watches the running table empty out. Returns `false` if jobs
/// were still on hardware when the grace period expired.
pub async fn drain_running(scheduler: &TestScheduler, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let status = scheduler.get_queue_status().await;
        if status.running == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                still_running = status.running,
                "Grace period expired with jobs still running"
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
