//! XMPP over WebSocket (RFC 7395) client transport.
//!
//! [`Connection`] drives one logical XMPP session over a sequence of
//! transport sessions: it opens the socket through a [`Connector`], frames
//! the stream with `<open/>`/`<close/>`, parses incoming text into
//! [`ConnectionEvent`]s and, when enabled, reconnects within a bounded
//! window after transport loss.

mod bridge;
mod connection;
mod error;
mod framing;
mod options;
mod parser;
mod reconnect;
mod session;
mod transport;
mod websocket;

// Re-exports
pub use jid;
pub use jid::Jid;
pub use minidom;
pub use minidom::Element;

pub use bridge::{BridgeEvent, StreamAttributes, StreamBridge};
pub use connection::{Connection, ConnectionEvent, EventStream};
pub use error::{ConnectionError, ParseError};
pub use framing::{
    build_close, build_open, is_close_frame, is_open_frame, is_stream_error, is_stream_header,
    to_xml, NS_CLIENT, NS_FRAMING, NS_STREAM, NS_STREAM_ERRORS, WS_SUBPROTOCOL, XMPP_VERSION,
};
pub use options::ConnectionOptions;
pub use parser::{ParserEvent, StreamParser, DEFAULT_MAX_STANZA_SIZE};
pub use reconnect::{
    DisconnectOutcome, ReconnectController, ReconnectPolicy, ReconnectState, RetryDecision,
    INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
};
pub use transport::{Connector, SessionId, Transport, TransportEvent, TransportSink};
pub use websocket::{native_tls_config, WebSocketConnector};
