//! Incremental XMPP stream parser.
//!
//! Accepts text chunks of arbitrary size (one WebSocket frame usually holds
//! one element, but nothing here relies on it) and turns complete top-level
//! units into [`ParserEvent`]s:
//! - `<open/>` or a legacy `<stream:stream>` header → [`ParserEvent::Start`]
//! - `<close/>` or `</stream:stream>` → [`ParserEvent::End`]
//! - any other top-level element → [`ParserEvent::Stanza`]
//!
//! Work happens in two passes. A boundary scan finds where the next
//! top-level unit ends without decoding anything, so a chunk may stop
//! anywhere, even inside an entity. Only once a stanza is complete is it
//! decoded into a [`minidom::Element`], with namespaces resolved against the
//! stream header.
//!
//! Incomplete input stays buffered until the next chunk. A unit larger than
//! the configured limit, or pending input that grows past it, is reported as
//! [`ParseError::StanzaTooBig`] and discarded rather than truncated.

use std::collections::BTreeMap;

use minidom::Element;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::error::ParseError;
use super::framing::{is_close_frame, is_open_frame, is_stream_header, NS_CLIENT};

/// Default upper bound on a single stanza, in bytes.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 65_535;

const STREAM_CLOSE_TAG: &[u8] = b"</stream:stream>";

/// Prefix → namespace URI, `""` being the default namespace.
type Scope = BTreeMap<String, String>;

/// Notification produced by [`StreamParser::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Stream opened by the peer; all attributes of the opening element.
    Start(Vec<(String, String)>),
    /// A complete top-level element.
    Stanza(Element),
    /// The peer ended the stream. No further events follow.
    End,
    /// Malformed or oversized input. Buffered data is dropped.
    Error(ParseError),
}

/// A complete top-level unit found at the front of the buffer.
enum Unit {
    Open { attrs: Vec<(String, String)>, legacy: bool },
    Close,
    /// Byte range of the stanza, relative to the scanned slice.
    Stanza { start: usize, end: usize },
}

#[derive(Debug)]
pub struct StreamParser {
    buffer: Vec<u8>,
    max_stanza_size: usize,
    /// Namespace declarations inherited from the stream header.
    stream_scope: Scope,
    ended: bool,
}

impl StreamParser {
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_stanza_size,
            stream_scope: Scope::new(),
            ended: false,
        }
    }

    pub fn max_stanza_size(&self) -> usize {
        self.max_stanza_size
    }

    /// Bytes held back waiting for the rest of an element.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Feed a chunk and collect every event it completes.
    pub fn write(&mut self, chunk: &str) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if self.ended {
            debug!(bytes = chunk.len(), "Parser already ended, dropping input");
            return events;
        }
        self.buffer.extend_from_slice(chunk.as_bytes());

        // Track consumed offset and compact once at the end.
        let mut consumed = 0;
        while consumed < self.buffer.len() {
            let base = consumed;
            match next_unit(&self.buffer[base..]) {
                Ok(Some((unit, used))) => {
                    consumed += used;
                    match unit {
                        Unit::Open { attrs, legacy } => {
                            // The framing namespace of `<open/>` is not a
                            // content namespace; a legacy header's is.
                            self.stream_scope = declared_scope(&attrs, legacy);
                            events.push(ParserEvent::Start(attrs));
                        }
                        Unit::Close => {
                            self.ended = true;
                            events.push(ParserEvent::End);
                            break;
                        }
                        Unit::Stanza { start, end } => {
                            let size = end - start;
                            if size > self.max_stanza_size {
                                events.push(ParserEvent::Error(ParseError::StanzaTooBig {
                                    size,
                                    limit: self.max_stanza_size,
                                }));
                                continue;
                            }
                            let bytes = &self.buffer[base + start..base + end];
                            match build_element(bytes, &self.stream_scope) {
                                Ok(element) => events.push(ParserEvent::Stanza(element)),
                                Err(e) => events.push(ParserEvent::Error(e)),
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    events.push(ParserEvent::Error(e));
                    self.buffer.clear();
                    return events;
                }
            }
        }

        if self.ended {
            self.buffer.clear();
            return events;
        }
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        // Guard against unbounded growth from input that never completes.
        if self.buffer.len() > self.max_stanza_size {
            events.push(ParserEvent::Error(ParseError::StanzaTooBig {
                size: self.buffer.len(),
                limit: self.max_stanza_size,
            }));
            self.buffer.clear();
        }
        events
    }
}

/// Position of the end of a `</stream:stream>` tag at `pos`, skipping
/// leading whitespace. The reader rejects it as an unmatched end tag.
fn stream_close_at(buffer: &[u8], pos: usize) -> Option<usize> {
    let rest = &buffer[pos..];
    let start = rest.iter().position(|b| !b.is_ascii_whitespace())?;
    rest[start..]
        .starts_with(STREAM_CLOSE_TAG)
        .then(|| pos + start + STREAM_CLOSE_TAG.len())
}

fn malformed(e: impl ToString) -> ParseError {
    ParseError::Malformed(e.to_string())
}

fn qualified_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

/// All attributes of a complete start tag, values decoded.
fn start_attrs(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, ParseError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

fn declared_scope(attrs: &[(String, String)], keep_default: bool) -> Scope {
    let mut scope = Scope::new();
    for (key, value) in attrs {
        if key == "xmlns" {
            if keep_default {
                scope.insert(String::new(), value.clone());
            }
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(prefix.to_string(), value.clone());
        }
    }
    scope
}

/// `Some` when a top-level start tag opens the stream.
fn stream_opening(start: &BytesStart<'_>) -> Result<Option<Unit>, ParseError> {
    let qname = qualified_name(start);
    if !matches!(qname.as_str(), "open" | "stream" | "stream:stream") {
        return Ok(None);
    }
    let attrs = start_attrs(start)?;
    let default_ns = attrs
        .iter()
        .find(|(k, _)| k == "xmlns")
        .map(|(_, v)| v.as_str());
    let legacy = is_stream_header(&qname, default_ns);
    if legacy || is_open_frame(&qname) {
        Ok(Some(Unit::Open { attrs, legacy }))
    } else {
        Ok(None)
    }
}

/// Find the first complete top-level unit in `buffer`.
///
/// Returns `Ok(None)` when more data is needed, otherwise the unit and the
/// number of bytes it (and any leading whitespace/prolog) occupied. Text is
/// never decoded here.
fn next_unit(buffer: &[u8]) -> Result<Option<(Unit, usize)>, ParseError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);

    let mut depth: usize = 0;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;
        if depth == 0 {
            if let Some(end) = stream_close_at(buffer, pos) {
                return Ok(Some((Unit::Close, end)));
            }
        }

        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    // Stream headers are never closed by a matching end tag.
                    if let Some(unit) = stream_opening(&e)? {
                        return Ok(Some((unit, reader.buffer_position() as usize)));
                    }
                    stanza_start = pos;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) if depth == 0 => {
                let end = reader.buffer_position() as usize;
                if let Some(unit) = stream_opening(&e)? {
                    return Ok(Some((unit, end)));
                }
                let unit = if is_close_frame(&qualified_name(&e)) {
                    Unit::Close
                } else {
                    Unit::Stanza { start: pos, end }
                };
                return Ok(Some((unit, end)));
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Err(malformed("unmatched end tag"));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Unit::Stanza { start: stanza_start, end }, end)));
                }
            }
            Ok(Event::Text(t)) if depth == 0 => {
                // Whitespace keepalives between stanzas are allowed.
                if !t.iter().all(u8::is_ascii_whitespace) {
                    let text = String::from_utf8_lossy(&t).trim().to_string();
                    return Err(ParseError::TextOutsideStanza(text));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(malformed("invalid markup after '<!'"));
            }
            Err(quick_xml::Error::Syntax(_)) => {
                // Unclosed tag/comment/CDATA: the rest arrives with a later chunk.
                return Ok(None);
            }
            Err(e) => return Err(malformed(e)),
        }
    }
}

/// Build the element for one start tag, resolving its namespace in `parent`
/// scope extended by the tag's own declarations.
///
/// Unqualified names with no default namespace in scope are taken to be in
/// the client namespace.
fn open_element(start: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope), ParseError> {
    let qname = qualified_name(start);
    let mut scope = parent.clone();
    let mut attrs = Vec::new();
    for (key, value) in start_attrs(start)? {
        if key == "xmlns" {
            scope.insert(String::new(), value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(prefix.to_string(), value);
        } else {
            attrs.push((key, value));
        }
    }

    let (prefix, local) = qname.split_once(':').unwrap_or(("", qname.as_str()));
    let ns = match scope.get(prefix) {
        Some(ns) => ns.clone(),
        None if prefix.is_empty() => NS_CLIENT.to_string(),
        None => return Err(malformed(format!("unbound namespace prefix '{prefix}'"))),
    };
    let element = attrs
        .into_iter()
        .fold(Element::builder(local, ns), |builder, (key, value)| builder.attr(key, value))
        .build();
    Ok((element, scope))
}

/// Decode one complete top-level element.
fn build_element(bytes: &[u8], stream_scope: &Scope) -> Result<Element, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<(Element, Scope)> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(stream_scope);
                let opened = open_element(&e, parent)?;
                stack.push(opened);
            }
            Ok(Event::Empty(e)) => {
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(stream_scope);
                let (element, _) = open_element(&e, parent)?;
                match stack.last_mut() {
                    Some((parent, _)) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Ok(Event::End(_)) => {
                let Some((element, _)) = stack.pop() else {
                    return Err(malformed("unmatched end tag"));
                };
                match stack.last_mut() {
                    Some((parent, _)) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some((parent, _)) = stack.last_mut() {
                    let text = t.unescape().map_err(malformed)?;
                    if !text.is_empty() {
                        parent.append_text_node(text.into_owned());
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some((parent, _)) = stack.last_mut() {
                    parent.append_text_node(String::from_utf8_lossy(&c).into_owned());
                }
            }
            Ok(Event::Eof) => return Err(malformed("element ended early")),
            Ok(_) => {}
            Err(e) => return Err(malformed(e)),
        }
    }
}
