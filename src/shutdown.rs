//! Shutdown coordination.
//!
//! A [`Trigger`] owned by the server broadcasts the lifecycle [`Phase`] to a
//! [`Watch`] held by every connection:
//!
//! - `Draining`: stop accepting; connections finish the request in flight,
//!   answer it with `connection: close` and end. Idle keep-alive connections
//!   close at once.
//! - `Closing`: the drain deadline passed; remaining connections are dropped
//!   and their handler tasks aborted.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Phase {
    Running,
    Draining,
    Closing,
}

pub(crate) struct Trigger(watch::Sender<Phase>);

impl Trigger {
    pub(crate) fn new() -> (Self, Watch) {
        let (tx, rx) = watch::channel(Phase::Running);
        (Self(tx), Watch(rx))
    }

    /// Moves to `phase` unless a later phase is already in effect.
    pub(crate) fn advance(&self, phase: Phase) {
        self.0.send_if_modified(|current| {
            if phase > *current {
                *current = phase;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Watch(watch::Receiver<Phase>);

impl Watch {
    /// A watch that never leaves `Running`, for connections served outside a
    /// [`Server`](crate::Server).
    pub(crate) fn detached() -> Self {
        let (tx, rx) = watch::channel(Phase::Running);
        // a receiver keeps the last value after its sender is gone
        drop(tx);
        Self(rx)
    }

    pub(crate) fn is_draining(&self) -> bool {
        *self.0.borrow() >= Phase::Draining
    }

    /// Resolves once draining has begun. Pends forever if the trigger is gone.
    pub(crate) async fn draining(&mut self) {
        self.reach(Phase::Draining).await;
    }

    /// Resolves once connections must be dropped.
    pub(crate) async fn closing(&mut self) {
        self.reach(Phase::Closing).await;
    }

    async fn reach(&mut self, phase: Phase) {
        if self.0.wait_for(|p| *p >= phase).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves on the first SIGTERM or Ctrl-C the process receives.
///
/// A handler that cannot be installed is logged and that signal is ignored.
pub(crate) async fn signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
