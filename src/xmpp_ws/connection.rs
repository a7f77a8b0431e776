//! Connection facade and its driver task.
//!
//! [`Connection::open`] spawns a driver that owns the live transport session,
//! the reconnection controller and the retry timer. Caller commands, socket
//! notifications and timer expiries all reach it as messages, so state is
//! only ever touched from that one task. Events are fanned out to every
//! subscriber over a broadcast channel.

use std::collections::BTreeMap;
use std::time::Duration;

use minidom::Element;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bridge::{BridgeEvent, StreamAttributes};
use super::error::ConnectionError;
use super::framing::{build_close, build_open};
use super::options::ConnectionOptions;
use super::reconnect::{DisconnectOutcome, ReconnectController, RetryDecision};
use super::session::TransportSession;
use super::transport::{Connector, SessionId, TransportEvent, TransportSink};

/// Protocol-level notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A transport session opened.
    Connected,
    /// The session that just opened concluded a reconnection episode.
    /// Always follows `Connected`.
    Reconnect,
    /// The peer opened its stream.
    StreamStart(StreamAttributes),
    Stanza(Element),
    Error(ConnectionError),
    /// A transport session went away, or `end()` was called.
    Disconnect,
    /// Terminal close. Not emitted while a reconnection episode runs.
    Close,
    /// The stream was ended, locally or by the peer.
    End,
}

pub type EventStream = broadcast::Receiver<ConnectionEvent>;

/// Input to the driver from sockets and the retry timer.
#[derive(Debug)]
pub(crate) enum DriverInput {
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    RetryDue {
        token: u64,
    },
}

#[derive(Debug)]
enum Command {
    Send(Element),
    StartStream,
    End,
}

/// Handle to a running connection.
///
/// Dropping the handle shuts the driver down and closes the socket without
/// sending a close frame; call [`Connection::end`] for a graceful end.
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Start connecting. Must be called within a tokio runtime.
    ///
    /// The returned receiver is subscribed before the first connection
    /// attempt, so it observes every event.
    pub fn open<C: Connector>(options: ConnectionOptions, connector: C) -> (Self, EventStream) {
        let (events, event_rx) = broadcast::channel(options.event_buffer.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(&options, Box::new(connector), events.clone(), inputs_tx);
        let task = tokio::spawn(driver.run(command_rx, inputs_rx));

        (
            Self {
                commands,
                events,
                task,
            },
            event_rx,
        )
    }

    /// Another independent event receiver. Only sees events emitted after
    /// this call.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Serialize and transmit a stanza on the live session.
    ///
    /// With no live session an `Error(NotConnected)` event is emitted.
    pub fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        self.command(Command::Send(stanza))
    }

    /// Send the `<open/>` framing element on the live session.
    pub fn start_stream(&self) -> Result<(), ConnectionError> {
        self.command(Command::StartStream)
    }

    /// Graceful local end: disables reconnection, sends `<close/>`, emits
    /// `Disconnect` then `End` and closes the socket. Repeated calls, or calls
    /// after the driver stopped, do nothing.
    pub fn end(&self) {
        if self.command(Command::End).is_err() {
            debug!("end() after driver stopped, ignoring");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Give up the handle and wait until the driver has stopped.
    ///
    /// After [`end`](Self::end) the driver still waits for the socket to
    /// close, so `Close` is delivered. Otherwise the live socket is dropped
    /// without a `<close/>` frame.
    pub async fn closed(self) {
        let Connection {
            commands,
            events: _,
            task,
        } = self;
        drop(commands);
        if let Err(e) = task.await {
            warn!(error = %e, "Connection driver task failed");
        }
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::DriverGone)
    }
}

struct PendingRetry {
    token: u64,
    handle: JoinHandle<()>,
}

struct Driver {
    url: String,
    stream_to: Option<String>,
    xmlns: BTreeMap<String, String>,
    max_stanza_size: usize,
    reconnect_enabled: bool,
    controller: ReconnectController,
    connector: Box<dyn Connector>,
    session: Option<TransportSession>,
    next_session: SessionId,
    pending_retry: Option<PendingRetry>,
    next_retry_token: u64,
    ended: bool,
    events: broadcast::Sender<ConnectionEvent>,
    inputs: mpsc::UnboundedSender<DriverInput>,
}

impl Driver {
    fn new(
        options: &ConnectionOptions,
        connector: Box<dyn Connector>,
        events: broadcast::Sender<ConnectionEvent>,
        inputs: mpsc::UnboundedSender<DriverInput>,
    ) -> Self {
        Self {
            url: options.url.clone(),
            stream_to: options.stream_to().map(str::to_string),
            xmlns: options.xmlns.clone(),
            max_stanza_size: options.max_stanza_size,
            reconnect_enabled: options.reconnect,
            controller: ReconnectController::new(options.reconnect_policy()),
            connector,
            session: None,
            next_session: 0,
            pending_retry: None,
            next_retry_token: 0,
            ended: false,
            events,
            inputs,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<DriverInput>,
    ) {
        let policy = self.controller.policy();
        info!(
            url = %self.url,
            reconnect = self.reconnect_enabled,
            delay_ms = policy.delay.as_millis() as u64,
            max_delay_ms = policy.max_delay.as_millis() as u64,
            "Connection driver started"
        );
        self.connect();

        let mut handle_dropped = false;
        loop {
            tokio::select! {
                command = commands.recv(), if !handle_dropped => match command {
                    Some(command) => self.handle_command(command),
                    None if self.ended && self.session.is_some() => {
                        debug!("Connection handle dropped, waiting for the socket to close");
                        handle_dropped = true;
                    }
                    None => {
                        info!("Connection handle dropped, shutting down");
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input),
            }

            if self.ended && self.session.is_none() {
                info!("Connection ended");
                break;
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(stanza) => match self.session.as_mut() {
                Some(session) if !session.is_disconnected() => {
                    if let Err(e) = session.send(&stanza) {
                        warn!(error = %e, "Dropping stanza");
                        self.emit(ConnectionEvent::Error(e));
                    }
                }
                _ => {
                    warn!("send() with no live session");
                    self.emit(ConnectionEvent::Error(ConnectionError::NotConnected));
                }
            },
            Command::StartStream => match self.session.as_mut() {
                Some(session) if !session.is_disconnected() => {
                    session.start_stream(build_open(&self.xmlns, self.stream_to.as_deref()));
                }
                _ => {
                    warn!("start_stream() with no live session");
                    self.emit(ConnectionEvent::Error(ConnectionError::NotConnected));
                }
            },
            Command::End => self.end_stream(),
        }
    }

    fn handle_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::Transport { session, event } => {
                let live = self.session.as_ref().map(TransportSession::id);
                if live != Some(session) {
                    debug!(session, live = ?live, event = ?event, "Notification from detached session, ignoring");
                    return;
                }
                match event {
                    TransportEvent::Open => self.on_transport_open(),
                    TransportEvent::Message(data) => self.on_transport_message(&data),
                    TransportEvent::Close => self.on_transport_close(),
                    TransportEvent::Error(cause) => self.on_transport_error(cause),
                }
            }
            DriverInput::RetryDue { token } => self.on_retry_due(token),
        }
    }

    fn on_transport_open(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.is_disconnected() {
            // end() was called before the socket finished connecting.
            debug!(session = session.id(), "Transport opened after end, ignoring");
            return;
        }
        session.on_open();
        let id = session.id();

        let reconnected = self.controller.on_open();
        info!(session = id, reconnected, "Transport open");
        self.emit(ConnectionEvent::Connected);
        if reconnected {
            self.emit(ConnectionEvent::Reconnect);
        }
    }

    fn on_transport_message(&mut self, data: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        for event in session.on_message(data) {
            match event {
                BridgeEvent::StreamStart(attrs) => {
                    info!(id = ?attrs.id(), from = ?attrs.get("from"), "Stream started");
                    self.emit(ConnectionEvent::StreamStart(attrs));
                }
                BridgeEvent::Stanza(stanza) => self.emit(ConnectionEvent::Stanza(stanza)),
                BridgeEvent::Error(e) => {
                    warn!(error = %e, "Stream error");
                    self.emit(ConnectionEvent::Error(e));
                }
                BridgeEvent::End => {
                    info!("Peer ended the stream");
                    self.end_stream();
                }
            }
        }
    }

    fn on_transport_close(&mut self) {
        // Detach first: nothing the old socket reports from here on is seen.
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stop_parser();
        let id = session.id();
        let first_disconnect = session.mark_disconnected();
        drop(session);

        if !first_disconnect {
            info!(session = id, "Transport closed after end");
            if !self.controller.is_retrying() {
                self.emit(ConnectionEvent::Close);
            }
            return;
        }

        self.emit(ConnectionEvent::Disconnect);
        let now = Instant::now();
        let elapsed_ms = self.controller.elapsed(now).map(|d| d.as_millis() as u64);
        match self.controller.on_disconnect(self.reconnect_enabled, now) {
            DisconnectOutcome::Disabled => {
                info!(session = id, "Transport closed");
                self.emit(ConnectionEvent::Close);
            }
            DisconnectOutcome::Retry(delay) => {
                info!(
                    session = id,
                    delay_ms = delay.as_millis() as u64,
                    elapsed_ms = elapsed_ms.unwrap_or(0),
                    "Transport lost, scheduling reconnect"
                );
                self.schedule_retry(delay);
            }
            DisconnectOutcome::Exhausted => self.log_exhausted(),
        }
    }

    fn on_transport_error(&mut self, cause: String) {
        warn!(error = %cause, "Transport error");
        self.emit(ConnectionEvent::Error(ConnectionError::Transport(cause)));
    }

    fn on_retry_due(&mut self, token: u64) {
        let due = matches!(&self.pending_retry, Some(pending) if pending.token == token);
        if !due {
            debug!(token, "Stale retry timer, ignoring");
            return;
        }
        self.pending_retry = None;

        let now = Instant::now();
        let elapsed_ms = self.controller.elapsed(now).map(|d| d.as_millis() as u64);
        match self.controller.on_retry_due(self.reconnect_enabled && !self.ended, now) {
            RetryDecision::Connect => {
                info!(elapsed_ms = elapsed_ms.unwrap_or(0), "Reconnecting");
                self.connect();
            }
            RetryDecision::Exhausted => self.log_exhausted(),
            RetryDecision::Cancelled => debug!("Reconnect cancelled"),
        }
    }

    fn log_exhausted(&self) {
        warn!(
            max_delay_ms = self.controller.policy().max_delay.as_millis() as u64,
            "Reconnect window exhausted, giving up"
        );
    }

    /// Local `end()` and peer end of stream both land here.
    fn end_stream(&mut self) {
        if self.ended {
            debug!("Connection already ended");
            return;
        }
        self.ended = true;
        self.reconnect_enabled = false;
        self.controller.cancel();
        self.cancel_retry();

        if let Some(session) = self.session.as_mut() {
            if !session.is_disconnected() {
                session.send_text(build_close());
            }
            session.stop_parser();
            session.mark_disconnected();
        }

        self.emit(ConnectionEvent::Disconnect);
        self.emit(ConnectionEvent::End);

        if let Some(session) = self.session.as_mut() {
            info!(session = session.id(), "Closing transport");
            session.close();
        }
    }

    /// Replace the live session with a fresh connection attempt.
    fn connect(&mut self) {
        if let Some(old) = self.session.take() {
            debug!(session = old.id(), "Detaching superseded session");
        }
        self.next_session += 1;
        let id = self.next_session;
        info!(session = id, url = %self.url, "Connecting");

        let sink = TransportSink::new(id, self.inputs.clone());
        let transport = self.connector.connect(&self.url, sink);
        self.session = Some(TransportSession::new(id, transport, self.max_stanza_size));
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        self.next_retry_token += 1;
        let token = self.next_retry_token;
        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(DriverInput::RetryDue { token });
        });
        self.pending_retry = Some(PendingRetry { token, handle });
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            debug!(token = pending.token, "Cancelling pending reconnect");
            pending.handle.abort();
        }
    }

    fn shutdown(&mut self) {
        self.cancel_retry();
        if let Some(mut session) = self.session.take() {
            debug!(session = session.id(), "Dropping live session");
            session.close();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine: nobody is listening.
        let _ = self.events.send(event);
    }
}
