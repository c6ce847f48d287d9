use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal interrupts the drain.
const EXIT_INTERRUPTED: i32 = 130;

/// Watch SIGTERM and SIGINT for a worker process.
///
/// The first signal cancels the returned token: the dispatcher stops acquiring
/// leases and drains in-flight runs. A second signal exits immediately; runs still
/// leased by this process are left for the lease sweeper of another worker.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let drain = CancellationToken::new();
    let token = drain.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };

            if drain.is_cancelled() {
                tracing::warn!(signal = name, "Second signal received, exiting without drain");
                std::process::exit(EXIT_INTERRUPTED);
            }
            tracing::info!(signal = name, "Shutdown requested, draining worker");
            drain.cancel();
        }
    });

    Ok(token)
}
