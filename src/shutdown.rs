use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Tokens driven by SIGTERM and SIGINT.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// Cancelled by the first signal: stop leasing, finish running tasks
    pub graceful: CancellationToken,
    /// Cancelled by the second signal: abort running tasks right away
    pub force: CancellationToken,
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal cancels [`ShutdownSignals::graceful`]. Execution contexts
/// observe it between tasks; the drone then releases whatever is still in
/// flight before the process exits. Any later signal cancels
/// [`ShutdownSignals::force`], which aborts the remaining contexts without
/// waiting for a grace period. In-flight tasks are released either way.
///
/// Must be called from within a tokio runtime.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownSignals> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signals = ShutdownSignals::default();
    let graceful = signals.graceful.clone();
    let force = signals.force.clone();

    tokio::spawn(async move {
        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(
            signal = name,
            "Initiating graceful shutdown, send the signal again to abort running tasks"
        );
        graceful.cancel();

        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::warn!(signal = name, "Second shutdown signal, aborting running tasks");
        force.cancel();
    });

    Ok(signals)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
