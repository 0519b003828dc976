//! Transport Connection actor.
//!
//! One task owns the WebSocket and all membership state. Callers talk to it
//! through a cloneable [`TransportHandle`]; inbound frames are normalized and
//! forwarded on an `mpsc` channel. On network loss the task reconnects with
//! exponential backoff, replays registration, and re-joins the conversation
//! that was active before the drop.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;

use super::backoff::Backoff;
use super::protocol::{ClientEvent, TransportEvent, decode};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// `disconnected → connecting → connected → registered → joined(id)`.
/// Network loss returns to `disconnected` from any state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Joined(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Registered => write!(f, "registered"),
            Self::Joined(id) => write!(f, "joined({id})"),
        }
    }
}

type Reply = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug)]
enum TransportCommand {
    Register {
        display_name: String,
        market_id: String,
        respond_to: Reply,
    },
    Join {
        conversation_id: String,
        respond_to: Reply,
    },
    Leave {
        respond_to: Reply,
    },
    Send {
        body: String,
        respond_to: Reply,
    },
}

/// Outbound operations of the transport, as seen by the session.
#[async_trait]
pub trait TransportControl: Send + Sync + 'static {
    /// Remembered and replayed after every reconnect.
    async fn register(&self, display_name: &str, market_id: &str) -> Result<(), TransportError>;

    /// Idempotent. Leaves any other joined conversation first.
    async fn join(&self, conversation_id: &str) -> Result<(), TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;

    /// Only valid while joined.
    async fn send(&self, body: &str) -> Result<(), TransportError>;
}

/// Handle to the connection task.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the socket and stops reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> TransportCommand,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl TransportControl for TransportHandle {
    async fn register(&self, display_name: &str, market_id: &str) -> Result<(), TransportError> {
        self.request(|respond_to| TransportCommand::Register {
            display_name: display_name.to_string(),
            market_id: market_id.to_string(),
            respond_to,
        })
        .await
    }

    async fn join(&self, conversation_id: &str) -> Result<(), TransportError> {
        self.request(|respond_to| TransportCommand::Join {
            conversation_id: conversation_id.to_string(),
            respond_to,
        })
        .await
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.request(|respond_to| TransportCommand::Leave { respond_to })
            .await
    }

    async fn send(&self, body: &str) -> Result<(), TransportError> {
        self.request(|respond_to| TransportCommand::Send {
            body: body.to_string(),
            respond_to,
        })
        .await
    }
}

enum Exit {
    /// Cancelled, or every handle was dropped.
    Stopped,
    Lost,
}

pub struct TransportConnection {
    config: TransportConfig,
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    backoff: Backoff,
    registration: Option<(String, String)>,
    /// Conversation to be in once registered.
    desired_room: Option<String>,
    joined: Option<String>,
    registered: bool,
}

impl TransportConnection {
    /// Starts the connection task. Inbound events go to `events`.
    pub fn spawn(config: TransportConfig, events: mpsc::Sender<TransportEvent>) -> TransportHandle {
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let actor = Self {
            backoff: Backoff::from_config(&config),
            config,
            commands: command_rx,
            events,
            state: state_tx,
            cancel: cancel.clone(),
            registration: None,
            desired_room: None,
            joined: None,
            registered: false,
        };
        tokio::spawn(actor.run());

        TransportHandle {
            commands: command_tx,
            state: state_rx,
            cancel,
        }
    }

    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting).await;

            let Some(connected) = self.connect().await else {
                break;
            };

            match connected {
                Ok(ws) => {
                    info!(url = %self.config.url, "transport connected");
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected).await;
                    match self.drive(ws).await {
                        Exit::Stopped => break,
                        Exit::Lost => info!("transport connection lost, will attempt reconnection"),
                    }
                }
                Err(e) => warn!(url = %self.config.url, error = %e, "transport connect failed"),
            }

            self.registered = false;
            self.joined = None;
            self.set_state(ConnectionState::Disconnected).await;

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                warn!(attempts, "giving up on transport reconnection");
                self.emit(TransportEvent::GaveUp { attempts }).await;
                self.idle().await;
                break;
            };

            info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnection attempt scheduled"
            );
            if !self.wait(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        debug!("transport connection task stopped");
    }

    /// Opens the socket, answering commands as offline until the handshake
    /// completes. Returns `None` when the task should stop.
    async fn connect(&mut self) -> Option<Result<WsStream, String>> {
        let handshake = tokio::time::timeout(
            self.config.connect_timeout(),
            connect_async(self.config.url.clone()),
        );
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = &mut handshake => {
                    return Some(match result {
                        Ok(Ok((ws, _))) => Ok(ws),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "handshake timed out after {}ms",
                            self.config.connect_timeout_ms
                        )),
                    });
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_offline(cmd),
                    None => return None,
                }
            }
        }
    }

    /// Services commands while online until the socket drops or the task stops.
    async fn drive(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();

        if let Some((display_name, market_id)) = self.registration.clone() {
            debug!("replaying registration");
            let event = ClientEvent::Register {
                display_name,
                market_id,
            };
            if let Err(e) = write(&mut sink, &event).await {
                warn!(error = %e, "failed to replay registration");
                return Exit::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Exit::Stopped;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = sink.close().await;
                        return Exit::Stopped;
                    };
                    if let Err(e) = self.handle_online(cmd, &mut sink).await {
                        warn!(error = %e, "transport write failed");
                        return Exit::Lost;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_frame(text.as_str(), &mut sink).await {
                            warn!(error = %e, "transport write failed");
                            return Exit::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "transport read failed");
                        return Exit::Lost;
                    }
                }
            }
        }
    }

    /// Sleeps for the backoff delay while still answering commands.
    /// Returns false when the task should stop.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_offline(cmd),
                    None => return false,
                }
            }
        }
    }

    async fn idle(&mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_offline(cmd),
                    None => return,
                }
            }
        }
    }

    fn handle_offline(&mut self, cmd: TransportCommand) {
        match cmd {
            TransportCommand::Register {
                display_name,
                market_id,
                respond_to,
            } => {
                self.registration = Some((display_name, market_id));
                let _ = respond_to.send(Ok(()));
            }
            TransportCommand::Join {
                conversation_id,
                respond_to,
            } => {
                debug!(conversation_id = %conversation_id, "join remembered until reconnect");
                self.desired_room = Some(conversation_id);
                let _ = respond_to.send(Ok(()));
            }
            TransportCommand::Leave { respond_to } => {
                self.desired_room = None;
                let _ = respond_to.send(Ok(()));
            }
            TransportCommand::Send { respond_to, .. } => {
                let _ = respond_to.send(Err(TransportError::Disconnected));
            }
        }
    }

    /// Answers one command. Returns `Err` only when the socket itself failed.
    async fn handle_online(
        &mut self,
        cmd: TransportCommand,
        sink: &mut WsSink,
    ) -> Result<(), TransportError> {
        let (result, respond_to) = match cmd {
            TransportCommand::Register {
                display_name,
                market_id,
                respond_to,
            } => {
                let registration = (display_name, market_id);
                if self.registered && self.registration.as_ref() == Some(&registration) {
                    let _ = respond_to.send(Ok(()));
                    return Ok(());
                }
                self.registered = false;
                self.registration = Some(registration.clone());
                let event = ClientEvent::Register {
                    display_name: registration.0,
                    market_id: registration.1,
                };
                (write(sink, &event).await, respond_to)
            }
            TransportCommand::Join {
                conversation_id,
                respond_to,
            } => (self.join_room(conversation_id, sink).await, respond_to),
            TransportCommand::Leave { respond_to } => {
                self.desired_room = None;
                (self.leave_room(sink).await, respond_to)
            }
            TransportCommand::Send { body, respond_to } => {
                if self.joined.is_none() {
                    let _ = respond_to.send(Err(TransportError::NotJoined));
                    return Ok(());
                }
                (write(sink, &ClientEvent::Send { body }).await, respond_to)
            }
        };

        let _ = respond_to.send(result.clone());
        result
    }

    async fn handle_frame(&mut self, text: &str, sink: &mut WsSink) -> Result<(), TransportError> {
        match decode(text) {
            Ok(Some(TransportEvent::Registered)) => {
                self.registered = true;
                self.set_state(ConnectionState::Registered).await;
                self.emit(TransportEvent::Registered).await;
                if let Some(room) = self.desired_room.clone() {
                    self.join_room(room, sink).await?;
                }
            }
            Ok(Some(TransportEvent::Error { message })) => {
                warn!(%message, "transport reported an error");
                self.emit(TransportEvent::Error { message }).await;
            }
            Ok(Some(event)) => self.emit(event).await,
            Ok(None) => debug!("ignoring unknown transport event"),
            Err(e) => warn!(error = %e, "malformed transport frame"),
        }
        Ok(())
    }

    async fn join_room(
        &mut self,
        conversation_id: String,
        sink: &mut WsSink,
    ) -> Result<(), TransportError> {
        self.desired_room = Some(conversation_id.clone());

        if self.joined.as_deref() == Some(conversation_id.as_str()) {
            debug!(conversation_id = %conversation_id, "already joined");
            return Ok(());
        }
        if !self.registered {
            debug!(conversation_id = %conversation_id, "join deferred until registered");
            return Ok(());
        }
        self.leave_room(sink).await?;

        write(
            sink,
            &ClientEvent::Join {
                conversation_id: conversation_id.clone(),
            },
        )
        .await?;
        self.joined = Some(conversation_id.clone());
        self.set_state(ConnectionState::Joined(conversation_id)).await;
        Ok(())
    }

    async fn leave_room(&mut self, sink: &mut WsSink) -> Result<(), TransportError> {
        if self.joined.take().is_none() {
            return Ok(());
        }
        write(sink, &ClientEvent::Leave).await?;
        self.set_state(ConnectionState::Registered).await;
        Ok(())
    }

    async fn set_state(&self, next: ConnectionState) {
        if *self.state.borrow() == next {
            return;
        }
        info!(state = %next, "transport state changed");
        self.state.send_replace(next.clone());
        self.emit(TransportEvent::StateChanged(next)).await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("transport event receiver dropped");
        }
    }
}

async fn write(sink: &mut WsSink, event: &ClientEvent) -> Result<(), TransportError> {
    debug!(event = event.name(), "sending transport event");
    sink.send(Message::Text(event.to_frame().into()))
        .await
        .map_err(TransportError::from)
}
