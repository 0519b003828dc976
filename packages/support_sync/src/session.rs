//! Sync Session
//!
//! Owns the [`ConversationStore`] and drains a single queue of
//! [`SessionInput`]s: UI commands, transport events, and gateway completions.
//! Gateway calls run in spawned tasks whose results re-enter the same queue,
//! so every store mutation happens sequentially, one unit at a time.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{GatewayError, SyncError};
use crate::gateway::{HttpGateway, PersistenceGateway};
use crate::reconciler::{Incoming, MergeOutcome, resolve_author};
use crate::status::{StatusUpdate, create_draft};
use crate::store::{ConversationStore, StoreEvent};
use crate::transport::{TransportConnection, TransportControl, TransportEvent};
use crate::types::{AuthorRole, ConversationRecord, ConversationSummary, PersistedMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Load the conversation list and register with the transport.
    Start,
    /// Make a conversation active.
    Select(String),
    /// Send a message to the active conversation.
    Send(String),
    /// Reload the list and the active conversation's history.
    Refresh,
}

#[derive(Debug)]
pub enum SessionInput {
    Command(SessionCommand),
    Transport(TransportEvent),
    ConversationsLoaded(Result<Vec<ConversationSummary>, GatewayError>),
    HistoryLoaded {
        conversation_id: String,
        result: Result<ConversationRecord, GatewayError>,
    },
    IdentityLoaded {
        conversation_id: String,
        result: Result<ConversationRecord, GatewayError>,
    },
    SendCompleted {
        conversation_id: String,
        provisional_id: String,
        result: Result<PersistedMessage, GatewayError>,
    },
    MarkReadCompleted {
        conversation_id: String,
        result: Result<(), GatewayError>,
    },
    Shutdown,
}

pub struct SyncSession<G, T> {
    config: SyncConfig,
    gateway: Arc<G>,
    transport: T,
    store: ConversationStore,
    inputs: mpsc::UnboundedSender<SessionInput>,
    list_loaded: bool,
    snapshot_fallback: bool,
    pending_snapshot: Option<Vec<ConversationSummary>>,
    identity_requested: HashSet<String>,
}

impl<G, T> SyncSession<G, T>
where
    G: PersistenceGateway,
    T: TransportControl,
{
    /// `inputs` must feed the queue this session is driven from.
    pub fn new(
        config: SyncConfig,
        gateway: G,
        transport: T,
        inputs: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            config,
            gateway: Arc::new(gateway),
            transport,
            store: ConversationStore::default(),
            inputs,
            list_loaded: false,
            snapshot_fallback: false,
            pending_snapshot: None,
            identity_requested: HashSet::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        cancel: CancellationToken,
    ) {
        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if matches!(input, SessionInput::Shutdown) {
                break;
            }
            self.handle(input).await;
        }
        debug!("sync session stopped");
    }

    /// Processes one queued unit to completion.
    pub async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Transport(event) => self.handle_transport(event),
            SessionInput::ConversationsLoaded(result) => self.on_conversations(result),
            SessionInput::HistoryLoaded {
                conversation_id,
                result,
            } => self.on_history(&conversation_id, result),
            SessionInput::IdentityLoaded {
                conversation_id,
                result,
            } => self.on_identity(&conversation_id, result),
            SessionInput::SendCompleted {
                conversation_id,
                provisional_id,
                result,
            } => self.on_send_completed(&conversation_id, provisional_id, result),
            SessionInput::MarkReadCompleted {
                conversation_id,
                result,
            } => {
                if let Err(e) = result {
                    debug!(conversation_id = %conversation_id, error = %e, "mark-read failed");
                }
            }
            SessionInput::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        if let Some(reason) = self.store.blocked() {
            warn!(?command, reason, "session is blocked, ignoring command");
            return;
        }

        match command {
            SessionCommand::Start => {
                let agent = &self.config.agent;
                if let Err(e) = self
                    .transport
                    .register(&agent.display_name, &agent.market_id)
                    .await
                {
                    warn!(error = %e, "transport registration failed");
                }
                self.request_list();
            }
            SessionCommand::Refresh => {
                self.request_list();
                if let Some(active) = self.store.active().map(str::to_string) {
                    self.request_history(&active);
                }
            }
            SessionCommand::Select(conversation_id) => self.select(conversation_id).await,
            SessionCommand::Send(body) => self.send(body).await,
        }
    }

    async fn select(&mut self, conversation_id: String) {
        if self.store.active() == Some(conversation_id.as_str()) {
            debug!(conversation_id = %conversation_id, "conversation already active");
            return;
        }

        let previous = self.store.select(Some(conversation_id.clone()));
        if let Some(previous) = previous {
            debug!(conversation_id = %previous, "leaving previous conversation");
            if let Err(e) = self.transport.leave().await {
                warn!(error = %e, "transport leave failed");
            }
        }
        if let Err(e) = self.transport.join(&conversation_id).await {
            warn!(conversation_id = %conversation_id, error = %e, "transport join failed");
        }

        self.store.mark_seen(&conversation_id);
        self.identity_requested.insert(conversation_id.clone());
        self.request_history(&conversation_id);
        self.request_mark_read(&conversation_id);
        info!(conversation_id = %conversation_id, "conversation selected");
    }

    async fn send(&mut self, body: String) {
        let Some(conversation_id) = self.store.active().map(str::to_string) else {
            warn!("no active conversation, message not sent");
            return;
        };
        if body.trim().is_empty() {
            return;
        }

        let draft = create_draft(body.clone(), &self.config.agent, Utc::now());
        let provisional_id = draft.id.as_str().to_string();
        self.store.apply(&conversation_id, Incoming::Draft(draft));

        match self.transport.send(&body).await {
            Ok(()) => {
                self.store.apply_status(
                    &conversation_id,
                    &StatusUpdate::Sent {
                        provisional_id: provisional_id.clone(),
                    },
                );
            }
            Err(e) => warn!(conversation_id = %conversation_id, error = %e, "transport send failed"),
        }

        let gateway = Arc::clone(&self.gateway);
        let id = conversation_id.clone();
        self.spawn_completion(async move {
            let result = gateway.send_message(&id, &body).await;
            SessionInput::SendCompleted {
                conversation_id: id,
                provisional_id,
                result,
            }
        });
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.store.publish_connection(state),
            TransportEvent::Registered => debug!("registered with transport"),
            TransportEvent::History {
                conversation_id,
                messages,
            } => {
                if self.store.active() != Some(conversation_id.as_str()) {
                    debug!(conversation_id = %conversation_id, "discarding stale history snapshot");
                    return;
                }
                self.store
                    .apply(&conversation_id, Incoming::InboundBatch(messages));
                self.ensure_identity(&conversation_id);
            }
            TransportEvent::Message {
                conversation_id,
                message,
            } => {
                self.ensure_identity(&conversation_id);
                let author = resolve_author(
                    message.author_id.as_deref(),
                    self.store.customer_id(&conversation_id),
                );
                let outcome = self
                    .store
                    .apply(&conversation_id, Incoming::InboundSingle(message));

                if outcome == MergeOutcome::Appended && author == AuthorRole::Customer {
                    if self.store.active() == Some(conversation_id.as_str()) {
                        self.request_mark_read(&conversation_id);
                    } else {
                        self.store.increment_unread(&conversation_id);
                    }
                }
            }
            TransportEvent::Read {
                conversation_id,
                read_by,
                read_at,
            } => {
                if read_by.as_deref() == Some(self.config.agent.owner_id.as_str()) {
                    debug!(conversation_id = %conversation_id, "ignoring own read receipt");
                    return;
                }
                self.store
                    .apply_status(&conversation_id, &StatusUpdate::ReadReceipt { read_at });
            }
            TransportEvent::ConversationsSnapshot(conversations) => {
                if self.list_loaded {
                    debug!("authoritative list loaded, ignoring snapshot");
                } else if self.snapshot_fallback {
                    info!(count = conversations.len(), "using transport conversation snapshot");
                    self.store.load_summaries(&conversations);
                } else {
                    self.pending_snapshot = Some(conversations);
                }
            }
            TransportEvent::Presence {
                conversation_id,
                online,
            } => self.store.set_presence(&conversation_id, online),
            TransportEvent::Error { message } => {
                debug!(%message, "transport error event, store unchanged");
            }
            TransportEvent::GaveUp { attempts } => {
                warn!(attempts, "transport stopped reconnecting");
            }
        }
    }

    fn on_conversations(&mut self, result: Result<Vec<ConversationSummary>, GatewayError>) {
        match result {
            Ok(conversations) => {
                info!(count = conversations.len(), "conversation list loaded");
                self.list_loaded = true;
                self.pending_snapshot = None;
                self.store.load_summaries(&conversations);
            }
            Err(e) => {
                self.gateway_failed("list-conversations", &e);
                if !self.list_loaded && !self.store.is_blocked() {
                    self.snapshot_fallback = true;
                    if let Some(snapshot) = self.pending_snapshot.take() {
                        info!(count = snapshot.len(), "using transport conversation snapshot");
                        self.store.load_summaries(&snapshot);
                    }
                }
            }
        }
    }

    fn on_history(&mut self, conversation_id: &str, result: Result<ConversationRecord, GatewayError>) {
        match result {
            Ok(record) => {
                self.store.cache_customer(&record);
                if self.store.active() != Some(conversation_id) {
                    debug!(conversation_id, "discarding stale history response");
                    return;
                }
                self.store
                    .apply(conversation_id, Incoming::InboundBatch(record.messages));
            }
            Err(e) => {
                // Identity is still unknown; let the next inbound message fetch it.
                self.identity_requested.remove(conversation_id);
                self.gateway_failed("fetch-conversation", &e);
            }
        }
    }

    fn on_identity(&mut self, conversation_id: &str, result: Result<ConversationRecord, GatewayError>) {
        match result {
            Ok(record) => {
                self.store.cache_customer(&record);
                if self.store.active() == Some(conversation_id) {
                    self.store
                        .apply(conversation_id, Incoming::InboundBatch(record.messages));
                }
            }
            Err(e) => {
                self.identity_requested.remove(conversation_id);
                self.gateway_failed("fetch-conversation", &e);
            }
        }
    }

    fn on_send_completed(
        &mut self,
        conversation_id: &str,
        provisional_id: String,
        result: Result<PersistedMessage, GatewayError>,
    ) {
        match result {
            Ok(record) => {
                self.store.apply(
                    conversation_id,
                    Incoming::PersistedConfirmation {
                        provisional_id,
                        record,
                    },
                );
            }
            // The optimistic message stays as it is.
            Err(e) => self.gateway_failed("send-message", &e),
        }
    }

    fn gateway_failed(&mut self, operation: &str, err: &GatewayError) {
        match err {
            GatewayError::Unauthorized => {
                warn!(operation, "persistence service rejected the session");
                self.store.set_blocked(err.to_string());
            }
            _ => warn!(operation, error = %err, "persistence operation failed"),
        }
    }

    fn ensure_identity(&mut self, conversation_id: &str) {
        if self.store.customer_id(conversation_id).is_some()
            || !self.identity_requested.insert(conversation_id.to_string())
        {
            return;
        }
        debug!(conversation_id, "fetching customer identity");
        let gateway = Arc::clone(&self.gateway);
        let id = conversation_id.to_string();
        self.spawn_completion(async move {
            let result = gateway.fetch_conversation(&id).await;
            SessionInput::IdentityLoaded {
                conversation_id: id,
                result,
            }
        });
    }

    fn request_list(&self) {
        let gateway = Arc::clone(&self.gateway);
        let owner_id = self.config.agent.owner_id.clone();
        self.spawn_completion(async move {
            SessionInput::ConversationsLoaded(gateway.list_conversations(&owner_id).await)
        });
    }

    fn request_history(&self, conversation_id: &str) {
        let gateway = Arc::clone(&self.gateway);
        let id = conversation_id.to_string();
        self.spawn_completion(async move {
            let result = gateway.fetch_conversation(&id).await;
            SessionInput::HistoryLoaded {
                conversation_id: id,
                result,
            }
        });
    }

    fn request_mark_read(&self, conversation_id: &str) {
        let gateway = Arc::clone(&self.gateway);
        let id = conversation_id.to_string();
        self.spawn_completion(async move {
            let result = gateway.mark_read(&id).await;
            SessionInput::MarkReadCompleted {
                conversation_id: id,
                result,
            }
        });
    }

    fn spawn_completion<F>(&self, fut: F)
    where
        F: Future<Output = SessionInput> + Send + 'static,
    {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let _ = inputs.send(fut.await);
        });
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    events: broadcast::Sender<StoreEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn start(&self) -> Result<(), SyncError> {
        self.command(SessionCommand::Start)
    }

    pub fn select(&self, conversation_id: impl Into<String>) -> Result<(), SyncError> {
        self.command(SessionCommand::Select(conversation_id.into()))
    }

    pub fn send(&self, body: impl Into<String>) -> Result<(), SyncError> {
        self.command(SessionCommand::Send(body.into()))
    }

    pub fn refresh(&self) -> Result<(), SyncError> {
        self.command(SessionCommand::Refresh)
    }

    /// Stops the session and the tasks it owns.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(SessionInput::Shutdown);
        self.cancel.cancel();
    }

    fn command(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.inputs
            .send(SessionInput::Command(command))
            .map_err(|_| SyncError::SessionClosed)
    }
}

/// Spawns a session over the given gateway and transport.
///
/// `transport_events` is forwarded into the session queue by a separate task,
/// so the transport never waits on the session.
pub fn spawn_session<G, T>(
    config: SyncConfig,
    gateway: G,
    transport: T,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) -> SessionHandle
where
    G: PersistenceGateway,
    T: TransportControl,
{
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let session = SyncSession::new(config, gateway, transport, inputs_tx.clone());
    let events = session.store().event_sender();

    let forward = inputs_tx.clone();
    let forward_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = forward_cancel.cancelled() => break,
                event = transport_events.recv() => match event {
                    Some(event) => {
                        if forward.send(SessionInput::Transport(event)).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    tokio::spawn(session.run(inputs_rx, cancel.clone()));

    SessionHandle {
        inputs: inputs_tx,
        events,
        cancel,
    }
}

/// Builds the HTTP gateway and the transport connection from config and
/// spawns a session over them.
pub fn connect(config: SyncConfig) -> Result<SessionHandle, SyncError> {
    let gateway = HttpGateway::new(&config.gateway)?;
    let (events_tx, events_rx) = mpsc::channel(config.transport.channel_capacity.max(1));
    let transport = TransportConnection::spawn(config.transport.clone(), events_tx);

    let cancel = CancellationToken::new();
    let transport_cancel = cancel.clone();
    let transport_handle = transport.clone();
    tokio::spawn(async move {
        transport_cancel.cancelled().await;
        transport_handle.shutdown();
    });

    Ok(spawn_session(config, gateway, transport, events_rx, cancel))
}
