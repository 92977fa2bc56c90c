//! Tracks the current status of the connection to the server.

use tokio::sync::watch;

use crate::error::Error;

/// Connection lifecycle states, in the order they are reached.
/// Transitions are monotonic within one connection, except that
/// `Shutdown` may be entered from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// No connection established yet.
    Unconnected,
    /// TCP connection established, stream negotiation in progress.
    Connected,
    /// The stream has been upgraded to TLS.
    ConnectedTls,
    /// SASL authentication succeeded.
    Authenticated,
    /// A resource has been bound; the send path is open.
    Bound,
    /// Session established, initial presence sent.
    Running,
    /// The connection is gone.
    Shutdown,
}

/// Publishes status transitions. Every listener queue holds exactly
/// one slot: a newer value overwrites an unread older one, so a slow
/// consumer never blocks the publisher but always sees the latest
/// state. New listeners are primed with the current status.
#[derive(Clone)]
pub(crate) struct StatusMgr {
    tx: watch::Sender<Status>,
}

impl StatusMgr {
    pub(crate) fn new() -> StatusMgr {
        let (tx, _) = watch::channel(Status::Unconnected);
        StatusMgr { tx }
    }

    /// Publish a new status.
    pub(crate) fn set(&self, status: Status) {
        self.tx.send_replace(status);
    }

    /// The status most recently published.
    pub(crate) fn current(&self) -> Status {
        *self.tx.borrow()
    }

    /// A new listener, cold-primed with the current status.
    pub(crate) fn listener(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Wait until the connection has reached `target` (or passed it).
    /// Errors if the connection shuts down first.
    pub(crate) async fn await_status(&self, target: Status) -> Result<(), Error> {
        let mut listener = self.listener();
        let reached = *listener
            .wait_for(|current| *current >= target)
            .await
            .map_err(|_| Error::Disconnected)?;
        if reached == Status::Shutdown && target != Status::Shutdown {
            return Err(Error::Disconnected);
        }
        Ok(())
    }
}
