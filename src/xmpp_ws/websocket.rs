//! WebSocket transport over tokio-tungstenite.
//!
//! Each [`Connector::connect`] spawns one socket task. The task reports
//! `Open`, `Message`, `Error` and `Close` through the session's sink and
//! writes whatever the [`Transport`] handle queues. Only text frames carry
//! XMPP (RFC 7395 §3.2); binary frames are dropped.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::error::ConnectionError;
use super::framing::WS_SUBPROTOCOL;
use super::transport::{Connector, Transport, TransportSink};

/// TCP connect plus WebSocket handshake (and TLS for `wss://`).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for the peer to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Initialize rustls crypto provider (must be called once before building
/// a client config).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS client configuration trusting the system's native root certificates.
pub fn native_tls_config() -> Result<Arc<ClientConfig>, ConnectionError> {
    init_crypto_provider();

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(ConnectionError::Tls(
            "No system root certificates found. Ensure CA certificates are installed \
             (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ConnectionError::Tls(format!("Failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Opens `ws://` and `wss://` sockets requesting the `xmpp` sub-protocol.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    close_timeout: Duration,
    tls: Option<Arc<ClientConfig>>,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
            tls: None,
        }
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Use this TLS configuration for `wss://` instead of native roots.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>, ConnectionError> {
        match &self.tls {
            Some(config) => Ok(config.clone()),
            None => native_tls_config(),
        }
    }

    async fn open_socket(&self, url: &str) -> Result<WsStream, String> {
        let mut request = url
            .into_client_request()
            .map_err(|e| format!("Invalid WebSocket URL {}: {}", url, e))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));

        let tls = if request.uri().scheme_str() == Some("wss") {
            Some(TlsConnector::Rustls(
                self.tls_config().map_err(|e| e.to_string())?,
            ))
        } else {
            None
        };

        let (ws, response) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_tls_with_config(request, None, false, tls),
        )
        .await
        .map_err(|_| {
            format!(
                "Connection to {} timed out after {}s",
                url,
                self.connect_timeout.as_secs()
            )
        })?
        .map_err(|e| format!("WebSocket handshake with {} failed: {}", url, e))?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if protocol != Some(WS_SUBPROTOCOL) {
            warn!(url = %url, protocol = ?protocol, "Server did not select the xmpp sub-protocol");
        }
        Ok(ws)
    }

    async fn run(self, url: String, sink: TransportSink, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let session = sink.session();
        let ws = match self.open_socket(&url).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(session, error = %e, "WebSocket connect failed");
                sink.error(e);
                sink.close();
                return;
            }
        };
        info!(session, url = %url, "WebSocket connected");
        sink.open();

        let (mut write, mut read) = ws.split();
        let mut close_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                out = outgoing.recv(), if close_deadline.is_none() => match out {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(session, error = %e, "WebSocket write error");
                            sink.error(e.to_string());
                            break;
                        }
                    }
                    // A dropped handle closes the socket the same way.
                    Some(Outgoing::Close) | None => {
                        debug!(session, "Sending WebSocket close frame");
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!(session, error = %e, "WebSocket close frame send failed");
                            break;
                        }
                        close_deadline = Some(Instant::now() + self.close_timeout);
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => sink.message(text),
                    Some(Ok(Message::Binary(data))) => {
                        warn!(session, bytes = data.len(), "Ignoring binary WebSocket frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(session, frame = ?frame, "WebSocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                        debug!(session, "WebSocket stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session, error = %e, "WebSocket read error");
                        sink.error(e.to_string());
                        break;
                    }
                },
                _ = sleep_until_some(close_deadline), if close_deadline.is_some() => {
                    debug!(session, "Server did not acknowledge close in time");
                    break;
                }
            }
        }

        // Flush a pending close reply, bounded so a dead peer cannot hold us.
        if tokio::time::timeout(self.close_timeout, write.close()).await.is_err() {
            debug!(session, "WebSocket close timed out");
        }
        sink.close();
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

impl Connector for WebSocketConnector {
    fn connect(&mut self, url: &str, sink: TransportSink) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().run(url.to_string(), sink, rx));
        Box::new(WebSocketTransport { outgoing: tx })
    }
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// Handle to one socket task. Dropping it makes the task close the socket.
struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, text: String) {
        if self.outgoing.send(Outgoing::Text(text)).is_err() {
            debug!("WebSocket task gone, dropping outgoing frame");
        }
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use super::*;
    use crate::xmpp_ws::connection::{Connection, ConnectionEvent, EventStream};
    use crate::xmpp_ws::options::ConnectionOptions;

    async fn next_event(rx: &mut EventStream) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Accept one client, answering the `xmpp` sub-protocol.
    async fn accept_one(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_hdr_async(stream, |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            assert_eq!(
                req.headers().get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok()),
                Some("xmpp")
            );
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("xmpp"));
            Ok(resp)
        })
        .await
        .unwrap()
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/xmpp-websocket", listener.local_addr().unwrap());
        (listener, url)
    }

    /// Minimal RFC 7395 peer: answers the open, pushes one message, then
    /// records everything until the client closes.
    fn spawn_server(listener: TcpListener) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut ws = accept_one(&listener).await;
            let mut received = Vec::new();
            if let Some(Ok(Message::Text(open))) = ws.next().await {
                received.push(open);
            }
            ws.send(Message::Text(
                r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="localhost" id="srv-1" version="1.0" xml:lang="en"/>"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                "<message xmlns='jabber:client' from='localhost'><body>hello</body></message>".to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    received.push(text);
                }
            }
            received
        })
    }

    #[tokio::test]
    async fn test_stream_lifecycle_over_websocket() {
        let (listener, url) = listen().await;
        let server = spawn_server(listener);

        let options = ConnectionOptions::new(url)
            .with_stream_to("localhost")
            .with_namespace("", "jabber:client");
        let (conn, mut rx) = Connection::open(options, WebSocketConnector::new());

        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        conn.start_stream().unwrap();

        let ConnectionEvent::StreamStart(attrs) = next_event(&mut rx).await else {
            panic!("expected stream start");
        };
        assert_eq!(attrs.id(), Some("srv-1"));
        assert_eq!(attrs.get("xml:lang"), Some("en"));

        let ConnectionEvent::Stanza(message) = next_event(&mut rx).await else {
            panic!("expected stanza");
        };
        assert!(message.is("message", "jabber:client"));
        assert_eq!(message.children().next().map(|b| b.text()), Some("hello".to_string()));

        conn.end();
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disconnect);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::End);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Close);

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 2);
        assert!(received[0].starts_with("<open "));
        assert!(received[0].contains(r#"to="localhost""#));
        assert_eq!(received[1], r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#);

        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_close_without_reconnect() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept_one(&listener).await;
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (_conn, mut rx) = Connection::open(ConnectionOptions::new(url), WebSocketConnector::new());
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disconnect);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Close);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        // Bind and drop to get a port nothing listens on.
        let (listener, url) = listen().await;
        drop(listener);

        let (_conn, mut rx) = Connection::open(ConnectionOptions::new(url), WebSocketConnector::new());
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Error(ConnectionError::Transport(_))
        ));
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disconnect);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Close);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut first = accept_one(&listener).await;
            first.close(None).await.unwrap();
            while first.next().await.is_some() {}

            let mut second = accept_one(&listener).await;
            while second.next().await.is_some() {}
        });

        let options = ConnectionOptions::new(url)
            .with_reconnect(Duration::from_millis(100), Duration::from_secs(5));
        let (conn, mut rx) = Connection::open(options, WebSocketConnector::new());
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disconnect);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Reconnect);

        conn.end();
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disconnect);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::End);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Close);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_connecting() {
        let err = WebSocketConnector::new()
            .open_socket("not a url")
            .await
            .unwrap_err();
        assert!(err.starts_with("Invalid WebSocket URL"));
    }
}
