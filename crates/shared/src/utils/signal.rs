use tokio::{
    io,
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

// Cancels `cancellation_token` on the first SIGTERM, SIGINT or SIGHUP.
pub fn trigger_cancellation_on_signal(
    cancellation_token: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let signal_handle = tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
            _ = cancellation_token.cancelled() => return,
        };
        log::warn!("Received {received}, finishing in-flight measurements before stopping");
        cancellation_token.cancel();
    });

    Ok(signal_handle)
}
