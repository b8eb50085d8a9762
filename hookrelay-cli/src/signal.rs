use std::io;

use futures_util::{Stream, StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `cancel` on the first SIGINT/SIGTERM (Ctrl+C elsewhere) and `force`
/// on the next one, which skips the drain.
pub async fn watch_signals(cancel: CancellationToken, force: CancellationToken) -> io::Result<()> {
    let signals = Signals::new()?;
    let names = stream::unfold(signals, |mut signals| async move {
        match signals.recv().await {
            Ok(name) => Some((name, signals)),
            Err(e) => {
                warn!("Stopped listening for signals: {}", e);
                None
            }
        }
    });
    escalate(names, cancel, force).await;
    Ok(())
}

async fn escalate<S>(signals: S, cancel: CancellationToken, force: CancellationToken)
where
    S: Stream<Item = &'static str>,
{
    tokio::pin!(signals);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        Some(name) = signals.next() => {
            info!("Received {}, shutting down", name);
            cancel.cancel();
        }
    }
    if let Some(name) = signals.next().await {
        warn!("Received {} while shutting down, exiting without waiting for the drain", name);
        force.cancel();
    }
}

struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> io::Result<&'static str> {
        tokio::select! {
            _ = self.terminate.recv() => Ok("SIGTERM"),
            _ = self.interrupt.recv() => Ok("SIGINT"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> io::Result<&'static str> {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}
