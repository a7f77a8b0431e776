//! Error types surfaced through connection events and caller operations.

use minidom::Element;
use thiserror::Error;

use super::framing::NS_STREAM_ERRORS;

/// Failure reported by the incremental stream parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input is not well-formed XML.
    #[error("malformed XML: {0}")]
    Malformed(String),
    /// A stanza (or pending unterminated input) exceeded the configured limit.
    #[error("stanza of {size} bytes exceeds the {limit} byte limit")]
    StanzaTooBig { size: usize, limit: usize },
    /// Non-whitespace character data between top-level elements.
    #[error("unexpected text outside of a stanza: {0:?}")]
    TextOutsideStanza(String),
}

/// Errors delivered to the caller, either through `ConnectionEvent::Error`
/// or as the result of a caller operation.
///
/// Everything here is `Clone` because events are fanned out over a
/// broadcast channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    /// The socket reported a failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Incoming data could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The peer sent a stream-level error element.
    #[error("stream error: {}", stream_error_condition(.0).unwrap_or("undefined-condition"))]
    Stream(Element),
    /// `send` or `start_stream` was called while no session is live.
    #[error("no live transport session")]
    NotConnected,
    /// The connection driver has stopped; the handle is no longer usable.
    #[error("connection driver is no longer running")]
    DriverGone,
    /// An outgoing element could not be serialized.
    #[error("could not serialize element: {0}")]
    Serialize(String),
    /// TLS client configuration could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ConnectionError {
    /// Name of the stream error condition, when this is a stream error.
    ///
    /// The condition is the first child qualified by
    /// `urn:ietf:params:xml:ns:xmpp-streams` (e.g. `conflict`,
    /// `see-other-host`).
    pub fn stream_condition(&self) -> Option<&str> {
        match self {
            ConnectionError::Stream(element) => stream_error_condition(element),
            _ => None,
        }
    }
}

fn stream_error_condition(element: &Element) -> Option<&str> {
    element
        .children()
        .find(|child| child.ns() == NS_STREAM_ERRORS)
        .map(Element::name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Node;

    use crate::xmpp_ws::framing::NS_STREAM;

    #[test]
    fn test_stream_condition_extracted_from_error_element() {
        let error = Element::builder("error", NS_STREAM)
            .append(Element::builder("conflict", NS_STREAM_ERRORS).build())
            .append(
                Element::builder("text", NS_STREAM_ERRORS)
                    .append(Node::Text("Replaced by new connection".to_string()))
                    .build(),
            )
            .build();
        let err = ConnectionError::Stream(error);
        assert_eq!(err.stream_condition(), Some("conflict"));
        assert_eq!(err.to_string(), "stream error: conflict");
    }

    #[test]
    fn test_stream_condition_absent_for_other_errors() {
        assert_eq!(ConnectionError::NotConnected.stream_condition(), None);
        let err: ConnectionError = ParseError::StanzaTooBig { size: 10, limit: 5 }.into();
        assert_eq!(err.stream_condition(), None);
        assert_eq!(err.to_string(), "stanza of 10 bytes exceeds the 5 byte limit");
    }
}
