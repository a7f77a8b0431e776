//! Stream event bridge: parser notifications → protocol events.

use std::collections::BTreeMap;

use minidom::Element;
use tracing::debug;

use super::error::ConnectionError;
use super::framing::{is_namespace_declaration, is_stream_error};
use super::parser::{ParserEvent, StreamParser};

/// Attributes of the peer's stream-opening element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamAttributes {
    attrs: Vec<(String, String)>,
}

impl StreamAttributes {
    pub fn new(attrs: Vec<(String, String)>) -> Self {
        Self { attrs }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The namespace declarations (`xmlns`, `xmlns:*`), keyed by attribute name.
    pub fn namespaces(&self) -> BTreeMap<String, String> {
        self.attrs
            .iter()
            .filter(|(k, _)| is_namespace_declaration(k))
            .cloned()
            .collect()
    }

    /// Stream id assigned by the server, if any.
    pub fn id(&self) -> Option<&str> {
        self.get("id")
    }
}

/// Protocol-level outcome of feeding data to the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StreamStart(StreamAttributes),
    Stanza(Element),
    Error(ConnectionError),
    /// Peer ended the stream; the bridge has already stopped itself.
    End,
}

/// Owns at most one parser. Stopping drops it, so nothing more is dispatched.
#[derive(Debug)]
pub struct StreamBridge {
    parser: Option<StreamParser>,
    max_stanza_size: usize,
    stream_attrs: Option<StreamAttributes>,
    stream_ns_attrs: BTreeMap<String, String>,
}

impl StreamBridge {
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            parser: None,
            max_stanza_size,
            stream_attrs: None,
            stream_ns_attrs: BTreeMap::new(),
        }
    }

    /// Start a fresh parser, replacing any previous one.
    pub fn start(&mut self) {
        self.parser = Some(StreamParser::new(self.max_stanza_size));
    }

    /// Tear down the parser. Safe to call repeatedly or when never started.
    pub fn stop(&mut self) {
        if self.parser.take().is_some() {
            debug!("Stream parser stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.parser.is_some()
    }

    /// Attributes of the most recent stream start.
    pub fn stream_attrs(&self) -> Option<&StreamAttributes> {
        self.stream_attrs.as_ref()
    }

    /// Namespace declarations of the most recent stream start.
    pub fn stream_ns_attrs(&self) -> &BTreeMap<String, String> {
        &self.stream_ns_attrs
    }

    /// Feed incoming text. Returns nothing when no parser is active.
    pub fn feed(&mut self, data: &str) -> Vec<BridgeEvent> {
        let Some(parser) = self.parser.as_mut() else {
            return Vec::new();
        };
        let parsed = parser.write(data);

        let mut events = Vec::with_capacity(parsed.len());
        for event in parsed {
            match event {
                ParserEvent::Start(attrs) => {
                    let attrs = StreamAttributes::new(attrs);
                    // Kept separately since the namespaces are needed often.
                    self.stream_ns_attrs = attrs.namespaces();
                    self.stream_attrs = Some(attrs.clone());
                    events.push(BridgeEvent::StreamStart(attrs));
                }
                ParserEvent::Stanza(stanza) if is_stream_error(&stanza) => {
                    events.push(BridgeEvent::Error(ConnectionError::Stream(stanza)));
                }
                ParserEvent::Stanza(stanza) => events.push(BridgeEvent::Stanza(stanza)),
                ParserEvent::Error(e) => events.push(BridgeEvent::Error(e.into())),
                ParserEvent::End => {
                    self.stop();
                    events.push(BridgeEvent::End);
                    break;
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_ws::error::ParseError;
    use crate::xmpp_ws::framing::{build_open, NS_FRAMING, NS_STREAM};
    use crate::xmpp_ws::parser::DEFAULT_MAX_STANZA_SIZE;

    fn started() -> StreamBridge {
        let mut bridge = StreamBridge::new(DEFAULT_MAX_STANZA_SIZE);
        bridge.start();
        bridge
    }

    #[test]
    fn test_stream_start_captures_namespace_subset() {
        let mut bridge = started();
        let events = bridge.feed(
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" xmlns:stream="http://etherx.jabber.org/streams" from="example.com" id="s1" version="1.0"/>"#,
        );
        let [BridgeEvent::StreamStart(attrs)] = events.as_slice() else {
            panic!("expected a single stream start, got {events:?}");
        };
        assert_eq!(attrs.get("from"), Some("example.com"));
        assert_eq!(attrs.id(), Some("s1"));
        assert_eq!(bridge.stream_ns_attrs().len(), 2);
        assert_eq!(bridge.stream_ns_attrs()["xmlns"], NS_FRAMING);
        assert_eq!(bridge.stream_ns_attrs()["xmlns:stream"], NS_STREAM);
        assert_eq!(bridge.stream_attrs(), Some(attrs));
    }

    #[test]
    fn test_open_round_trip_preserves_declared_namespaces() {
        let declared: BTreeMap<String, String> = [
            ("".to_string(), "jabber:client".to_string()),
            ("sm".to_string(), "urn:xmpp:sm:3".to_string()),
        ]
        .into_iter()
        .collect();
        let mut bridge = started();
        let events = bridge.feed(&build_open(&declared, Some("example.com")));
        let [BridgeEvent::StreamStart(attrs)] = events.as_slice() else {
            panic!("expected a single stream start, got {events:?}");
        };
        let namespaces = attrs.namespaces();
        assert_eq!(namespaces["xmlns"], "jabber:client");
        assert_eq!(namespaces["xmlns:sm"], "urn:xmpp:sm:3");
        assert_eq!(namespaces["xmlns:stream"], NS_STREAM);
        assert_eq!(namespaces.len(), declared.len() + 1);
    }

    #[test]
    fn test_open_round_trip_without_default_namespace() {
        let declared: BTreeMap<String, String> =
            [("sm".to_string(), "urn:xmpp:sm:3".to_string())].into_iter().collect();
        let mut bridge = started();
        let events = bridge.feed(&build_open(&declared, None));
        let [BridgeEvent::StreamStart(attrs)] = events.as_slice() else {
            panic!("expected a single stream start, got {events:?}");
        };
        let keys: Vec<String> = attrs.namespaces().into_keys().collect();
        assert_eq!(keys, vec!["xmlns:sm", "xmlns:stream"]);
        assert_eq!(attrs.get("to"), None);
    }

    #[test]
    fn test_stream_error_is_reported_as_error() {
        let mut bridge = started();
        let events = bridge.feed(
            "<stream:error xmlns:stream='http://etherx.jabber.org/streams'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );
        let [BridgeEvent::Error(err)] = events.as_slice() else {
            panic!("expected a single error, got {events:?}");
        };
        assert_eq!(err.stream_condition(), Some("conflict"));
    }

    #[test]
    fn test_regular_stanza_passes_through() {
        let mut bridge = started();
        let events = bridge.feed("<message xmlns='jabber:client'><body>Hi</body></message>");
        assert!(matches!(events.as_slice(), [BridgeEvent::Stanza(el)] if el.is("message", "jabber:client")));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let mut bridge = StreamBridge::new(8);
        bridge.start();
        let events = bridge.feed("<message><body>long</body></message>");
        assert!(matches!(
            events.as_slice(),
            [BridgeEvent::Error(ConnectionError::Parse(ParseError::StanzaTooBig { limit: 8, .. }))]
        ));
        assert!(bridge.is_active());
    }

    #[test]
    fn test_end_stops_the_parser() {
        let mut bridge = started();
        let events = bridge.feed(r#"<presence/><close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#);
        assert!(matches!(events.as_slice(), [BridgeEvent::Stanza(_), BridgeEvent::End]));
        assert!(!bridge.is_active());
        assert!(bridge.feed("<presence/>").is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut bridge = StreamBridge::new(DEFAULT_MAX_STANZA_SIZE);
        bridge.stop();
        bridge.start();
        bridge.stop();
        bridge.stop();
        assert!(!bridge.is_active());
        assert!(bridge.feed("<presence/>").is_empty());
    }

    #[test]
    fn test_feed_without_parser_is_ignored() {
        let mut bridge = StreamBridge::new(DEFAULT_MAX_STANZA_SIZE);
        assert!(bridge.feed("<presence/>").is_empty());
    }
}
