//! One transport session: a socket handle plus, once open, its parser.

use minidom::Element;
use tracing::{debug, warn};

use super::bridge::{BridgeEvent, StreamBridge};
use super::error::ConnectionError;
use super::framing::to_xml;
use super::transport::{SessionId, Transport};

pub(crate) struct TransportSession {
    id: SessionId,
    transport: Box<dyn Transport>,
    bridge: StreamBridge,
    stream_opened: bool,
    /// Set once `disconnect` has been reported for this session.
    disconnected: bool,
}

impl TransportSession {
    pub(crate) fn new(id: SessionId, transport: Box<dyn Transport>, max_stanza_size: usize) -> Self {
        Self {
            id,
            transport,
            bridge: StreamBridge::new(max_stanza_size),
            stream_opened: false,
            disconnected: false,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Record that `disconnect` was reported. True the first time only.
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        !std::mem::replace(&mut self.disconnected, true)
    }

    /// Socket opened: start parsing.
    pub(crate) fn on_open(&mut self) {
        self.bridge.start();
    }

    pub(crate) fn on_message(&mut self, data: &str) -> Vec<BridgeEvent> {
        if data.is_empty() {
            return Vec::new();
        }
        if !self.bridge.is_active() {
            debug!(session = self.id, bytes = data.len(), "No active parser, dropping message");
            return Vec::new();
        }
        debug!(session = self.id, data = %data, "WS<-");
        self.bridge.feed(data)
    }

    pub(crate) fn send(&mut self, stanza: &Element) -> Result<(), ConnectionError> {
        let text = to_xml(stanza).map_err(|e| ConnectionError::Serialize(e.to_string()))?;
        self.send_text(text);
        Ok(())
    }

    /// Send an already serialized frame.
    pub(crate) fn send_text(&mut self, text: String) {
        debug!(session = self.id, data = %text, "WS->");
        self.transport.send(text);
    }

    /// Send `<open/>`. Only the first call per session does anything.
    pub(crate) fn start_stream(&mut self, open: String) -> bool {
        if self.stream_opened {
            warn!(session = self.id, "Stream already opened on this session, ignoring");
            return false;
        }
        self.send_text(open);
        self.stream_opened = true;
        true
    }

    pub(crate) fn stop_parser(&mut self) {
        self.bridge.stop();
    }

    /// Stop parsing and ask the socket to close.
    pub(crate) fn close(&mut self) {
        self.bridge.stop();
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::xmpp_ws::framing::{build_close, build_open, NS_CLIENT};
    use crate::xmpp_ws::parser::DEFAULT_MAX_STANZA_SIZE;

    #[derive(Default)]
    struct Recorded {
        sent: Vec<String>,
        closes: usize,
    }

    struct RecordingTransport(Arc<Mutex<Recorded>>);

    impl Transport for RecordingTransport {
        fn send(&mut self, text: String) {
            self.0.lock().unwrap().sent.push(text);
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    fn session() -> (TransportSession, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let transport = Box::new(RecordingTransport(recorded.clone()));
        (TransportSession::new(7, transport, DEFAULT_MAX_STANZA_SIZE), recorded)
    }

    #[test]
    fn test_messages_ignored_until_open() {
        let (mut session, _) = session();
        assert!(session.on_message("<presence/>").is_empty());
        session.on_open();
        assert_eq!(session.on_message("<presence/>").len(), 1);
    }

    #[test]
    fn test_empty_message_ignored() {
        let (mut session, _) = session();
        session.on_open();
        assert!(session.on_message("").is_empty());
    }

    #[test]
    fn test_start_stream_only_once() {
        let (mut session, recorded) = session();
        let open = build_open(&Default::default(), Some("example.com"));
        assert!(session.start_stream(open.clone()));
        assert!(!session.start_stream(open.clone()));
        assert_eq!(recorded.lock().unwrap().sent, vec![open]);
    }

    #[test]
    fn test_send_serializes_element() {
        let (mut session, recorded) = session();
        let presence = Element::builder("presence", NS_CLIENT).build();
        session.send(&presence).unwrap();
        session.send_text(build_close());
        let sent = recorded.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].parse::<Element>().unwrap(), presence);
        assert_eq!(sent[1], r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#);
    }

    #[test]
    fn test_mark_disconnected_reports_first_time_only() {
        let (mut session, _) = session();
        assert!(!session.is_disconnected());
        assert!(session.mark_disconnected());
        assert!(!session.mark_disconnected());
        assert!(session.is_disconnected());
    }

    #[test]
    fn test_close_stops_parser_and_socket() {
        let (mut session, recorded) = session();
        session.on_open();
        session.close();
        assert!(session.on_message("<presence/>").is_empty());
        assert_eq!(recorded.lock().unwrap().closes, 1);
        assert_eq!(session.id(), 7);
    }
}
