use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancellation root for the whole process.
///
/// The returned token is cancelled by the first SIGTERM or SIGINT to arrive.
/// Blocking queue takes, the timeout sweeper, and both listeners hang off it
/// and drain when it fires.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
        match signal(kind) {
            Ok(mut stream) => {
                let token = token.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        tracing::info!(signal = kind.as_raw_value(), "Draining scheduler");
                        token.cancel();
                    }
                });
            }
            Err(e) => {
                tracing::error!(signal = kind.as_raw_value(), error = %e,
                    "Could not install signal handler");
            }
        }
    }

    token
}
