//! Shutdown Protocol
//!
//! Termination is a race between an OS signal and the shared token. A signal
//! is followed by a short grace sleep so sidecars notice the shutdown before
//! the protocol socket disappears; a cancelled token means some sub-service
//! already failed and shutdown proceeds at once.

use crate::domain::ports::ServiceLifecycle;
use futures::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Termination
// =============================================================================

/// Why the driver stopped waiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// An OS signal arrived
    Signal(&'static str),
    /// The shared token was cancelled by a sub-service
    Cancelled,
}

/// Block until `signal` fires or `token` is cancelled, whichever is first.
///
/// After a signal, sleeps for `grace` before returning.
pub async fn wait_for_termination<S>(
    token: &CancellationToken,
    signal: S,
    grace: Duration,
) -> Termination
where
    S: Future<Output = &'static str>,
{
    tokio::select! {
        name = signal => {
            info!(signal = name, "Caught signal, terminating.");
            tokio::time::sleep(grace).await;
            Termination::Signal(name)
        }
        _ = token.cancelled() => Termination::Cancelled,
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed, that signal is never reported.
pub async fn termination_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!(error = %e, "Failed to install SIGINT handler");
                futures::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                futures::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

// =============================================================================
// Force-Stop Guard
// =============================================================================

/// Ensures the protocol server is force-stopped however `run` exits.
///
/// [`finish`](Self::finish) force-stops and waits on the normal path. If the
/// guard is dropped without finishing (early return, panic, or the `run`
/// future itself being dropped) it still force-stops, without waiting.
pub struct ForceStopGuard<'a, S: ServiceLifecycle> {
    server: &'a S,
    armed: bool,
}

impl<'a, S: ServiceLifecycle> ForceStopGuard<'a, S> {
    pub fn new(server: &'a S) -> Self {
        Self {
            server,
            armed: true,
        }
    }

    /// Force-stop the server and wait until it has stopped
    pub async fn finish(mut self) {
        self.armed = false;
        self.server.force_stop();
        self.server.wait().await;
    }
}

impl<S: ServiceLifecycle> Drop for ForceStopGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.server.force_stop();
        }
    }
}
