//! Connection configuration.
//!
//! Option names follow the established client configuration keys
//! (`reconnect`, `maxDelay`, `initialReconnectDelay`/`reconnectDelay`), so a
//! JSON configuration can be shared with web clients.

use std::collections::BTreeMap;
use std::time::Duration;

use jid::Jid;
use serde::Deserialize;

use super::parser::DEFAULT_MAX_STANZA_SIZE;
use super::reconnect::{ReconnectPolicy, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY};

const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// WebSocket endpoint, e.g. `wss://example.com/xmpp-websocket`.
    pub url: String,
    /// Account JID; its domain becomes the stream `to`.
    pub jid: Option<Jid>,
    /// Stream `to` used when no JID is configured.
    pub stream_to: Option<String>,
    /// Namespace declarations for `<open/>`, prefix → URI (`""` for `xmlns`).
    pub xmlns: BTreeMap<String, String>,
    /// Reconnect autonomously after transport loss.
    pub reconnect: bool,
    /// Retry window in milliseconds.
    pub max_delay: Option<u64>,
    /// Delay between attempts in milliseconds; takes precedence over
    /// `reconnect_delay`.
    pub initial_reconnect_delay: Option<u64>,
    pub reconnect_delay: Option<u64>,
    pub max_stanza_size: usize,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            jid: None,
            stream_to: None,
            xmlns: BTreeMap::new(),
            reconnect: false,
            max_delay: None,
            initial_reconnect_delay: None,
            reconnect_delay: None,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_jid(mut self, jid: Jid) -> Self {
        self.jid = Some(jid);
        self
    }

    pub fn with_stream_to(mut self, to: impl Into<String>) -> Self {
        self.stream_to = Some(to.into());
        self
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.xmlns.insert(prefix.into(), uri.into());
        self
    }

    /// Enable reconnection with the given inter-attempt delay and window.
    pub fn with_reconnect(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.reconnect = true;
        self.reconnect_delay = Some(delay.as_millis() as u64);
        self.max_delay = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn with_max_stanza_size(mut self, size: usize) -> Self {
        self.max_stanza_size = size;
        self
    }

    /// Value for the stream `to`: the JID's domain, else `stream_to`.
    pub fn stream_to(&self) -> Option<&str> {
        self.jid
            .as_ref()
            .map(|jid| jid.domain().as_str())
            .or(self.stream_to.as_deref())
    }

    /// Zero values fall back to the defaults, as unset ones do.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = self
            .initial_reconnect_delay
            .filter(|ms| *ms > 0)
            .or(self.reconnect_delay.filter(|ms| *ms > 0))
            .map(Duration::from_millis)
            .unwrap_or(INITIAL_RECONNECT_DELAY);
        let max_delay = self
            .max_delay
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(MAX_RECONNECT_DELAY);
        ReconnectPolicy { delay, max_delay }
    }
}
