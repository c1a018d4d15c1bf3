use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Watches for `SIGTERM` and fans it out to any number of shutdown handles.
///
/// The control loop, the remediator and the status ticker all need to learn
/// about the same signal; a single watcher hands each of them a cheap handle.
pub struct ShutdownSignal {
    watch_rx: watch::Receiver<()>,
}

impl ShutdownSignal {
    /// Starts watching `SIGTERM`.
    pub fn sigterm() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let (watch_tx, watch_rx) = watch::channel(());

        tokio::spawn(async move {
            sigterm.recv().await;
            watch_tx.send(())
        });

        Ok(Self { watch_rx })
    }

    /// Acquires a handle which completes once the signal was received.
    pub fn handle(&self) -> impl Future<Output = ()> + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            watch_rx.changed().await.ok();
        }
    }
}
