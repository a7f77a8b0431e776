//! XMPP WebSocket framing (RFC 7395).
//!
//! Over WebSocket every message is a standalone XML fragment, so the stream
//! lifecycle is carried by dedicated framing elements instead of the TCP
//! `<stream:stream>` document root:
//! - `<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" .../>` opens a stream
//! - `<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>` closes it
//!
//! This module builds those frames as text (attribute layout matters to some
//! servers) and recognises them, and their legacy TCP equivalents, by name on
//! the way in.

use std::collections::BTreeMap;

use minidom::Element;
use quick_xml::escape::escape;

/// RFC 7395 framing namespace.
pub const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
/// Stream namespace (`stream:` prefix in TCP framing).
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
/// Namespace of stream error conditions.
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// Client content namespace, assumed for stanzas that declare none.
pub const NS_CLIENT: &str = "jabber:client";
/// Stream version advertised on `<open/>`.
pub const XMPP_VERSION: &str = "1.0";
/// WebSocket sub-protocol registered for XMPP.
pub const WS_SUBPROTOCOL: &str = "xmpp";

/// Build the `<open/>` frame starting a stream.
///
/// Each `namespaces` entry becomes `xmlns` (empty prefix) or `xmlns:prefix`;
/// nothing else is declared on the caller's behalf.
///
/// Attribute layout: namespace declarations, `version`, `to`, `xmlns:stream`.
pub fn build_open(namespaces: &BTreeMap<String, String>, to: Option<&str>) -> String {
    let mut open = String::from("<open");
    for (prefix, uri) in namespaces {
        if prefix.is_empty() {
            push_attr(&mut open, "xmlns", uri);
        } else {
            push_attr(&mut open, &format!("xmlns:{prefix}"), uri);
        }
    }
    push_attr(&mut open, "version", XMPP_VERSION);
    if let Some(to) = to {
        push_attr(&mut open, "to", to);
    }
    push_attr(&mut open, "xmlns:stream", NS_STREAM);
    open.push_str("/>");
    open
}

/// Build the `<close/>` frame ending a stream.
pub fn build_close() -> String {
    format!(r#"<close xmlns="{NS_FRAMING}"/>"#)
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape(value));
    out.push('"');
}

/// Serialize an element for the wire or a log line.
pub fn to_xml(element: &Element) -> Result<String, minidom::Error> {
    let mut out = Vec::new();
    element.write_to(&mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// True for attribute names that declare a namespace.
pub fn is_namespace_declaration(name: &str) -> bool {
    name == "xmlns" || name.starts_with("xmlns:")
}

/// `<open/>` framing element, by qualified name.
///
/// Matched on the unprefixed name alone: clients commonly qualify `<open/>`
/// with their content namespace (`jabber:client`) rather than the framing one.
pub fn is_open_frame(qname: &str) -> bool {
    qname == "open"
}

/// `<close/>` framing element, matched like [`is_open_frame`].
pub fn is_close_frame(qname: &str) -> bool {
    qname == "close"
}

/// Legacy TCP stream header: `<stream:stream>`, or `<stream>` whose default
/// namespace is the stream namespace.
pub fn is_stream_header(qname: &str, default_ns: Option<&str>) -> bool {
    qname == "stream:stream" || (qname == "stream" && default_ns == Some(NS_STREAM))
}

/// Stream-level error (`<stream:error/>` or `<error xmlns="...streams"/>`).
pub fn is_stream_error(element: &Element) -> bool {
    element.is("error", NS_STREAM)
}
