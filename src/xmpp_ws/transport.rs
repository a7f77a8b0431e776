//! Transport seam: a message-oriented socket with four notifications.
//!
//! A [`Connector`] opens one socket per session and reports what happens to
//! it through the [`TransportSink`] it was given. Every notification is
//! tagged with the session id, so once the connection driver has moved on to
//! a newer session, anything a superseded socket still reports is ignored.

use tokio::sync::mpsc;

use super::connection::DriverInput;

/// Identifies one transport session within a connection.
pub type SessionId = u64;

/// Socket notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

/// Where a socket reports its notifications. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<DriverInput>,
}

impl TransportSink {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<DriverInput>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Deliver a notification. Never blocks; dropped if the driver is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(DriverInput::Transport {
            session: self.session,
            event,
        });
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, data: impl Into<String>) {
        self.emit(TransportEvent::Message(data.into()));
    }

    pub fn close(&self) {
        self.emit(TransportEvent::Close);
    }

    pub fn error(&self, cause: impl Into<String>) {
        self.emit(TransportEvent::Error(cause.into()));
    }
}

/// Outgoing half of one socket.
///
/// Dropping the handle detaches it: the socket is torn down and nothing it
/// reports afterwards reaches the connection.
pub trait Transport: Send {
    /// Queue one text frame.
    fn send(&mut self, text: String);
    /// Start a graceful close; `Close` is reported once it completes.
    fn close(&mut self);
}

/// Opens sockets.
pub trait Connector: Send + 'static {
    /// Begin connecting to `url`. Must not block: progress is reported
    /// through `sink`, starting with `Open` or `Error`/`Close`.
    fn connect(&mut self, url: &str, sink: TransportSink) -> Box<dyn Transport>;
}
