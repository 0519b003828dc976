//! Conversation Store
//!
//! Holds every conversation seen by the session, the active-conversation
//! selector, and the status transition log. Message lists change only by
//! applying [`reconcile`] or [`status::apply`] output; observers get owned
//! snapshots through a broadcast channel and never touch the store itself.

use tokio::sync::broadcast;

use crate::reconciler::{self, Incoming, MergeOutcome, reconcile};
use crate::status::{self, StatusTracker, StatusUpdate};
use crate::transport::ConnectionState;
use crate::types::{Conversation, ConversationRecord, ConversationSummary, Message};

/// Default capacity of the observer broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Snapshot published to observers after each change.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ConversationsChanged {
        conversations: Vec<ConversationSummary>,
    },
    MessagesChanged {
        conversation_id: String,
        messages: Vec<Message>,
    },
    ActiveChanged {
        conversation_id: Option<String>,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
    /// The session can no longer talk to the persistence service.
    Blocked {
        reason: String,
    },
}

pub struct ConversationStore {
    /// Sorted by last interaction, newest first.
    conversations: Vec<Conversation>,
    active: Option<String>,
    tracker: StatusTracker,
    blocked: Option<String>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ConversationStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            conversations: Vec::new(),
            active: None,
            tracker: StatusTracker::new(),
            blocked: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Sender side, for handles that subscribe after the store moved into its task.
    pub fn event_sender(&self) -> broadcast::Sender<StoreEvent> {
        self.events.clone()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn messages(&self, id: &str) -> &[Message] {
        self.conversation(id)
            .map(|c| c.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn customer_id(&self, id: &str) -> Option<&str> {
        self.conversation(id).and_then(|c| c.customer_id())
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn blocked(&self) -> Option<&str> {
        self.blocked.as_deref()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Merges list metadata, creating conversations not seen before.
    pub fn load_summaries(&mut self, summaries: &[ConversationSummary]) {
        for summary in summaries {
            let convo = self.entry(&summary.id);
            let known = convo.customer_id().map(str::to_string);
            convo.apply_summary(summary);
            let installed = summary
                .customer
                .as_ref()
                .map(|c| c.id.as_str())
                .filter(|id| known.as_deref() != Some(*id));
            if let Some(customer_id) = installed {
                self.reresolve_authorship(&summary.id, customer_id);
            }
        }
        self.sort_conversations();
        self.publish_conversations();
    }

    /// Caches the customer identity from a fetched record and re-derives
    /// authorship of messages that arrived before it was known.
    pub fn cache_customer(&mut self, record: &ConversationRecord) {
        let convo = self.entry(&record.id);
        convo.customer = Some(record.customer.clone());
        if !record.channel.is_empty() {
            convo.channel = record.channel.clone();
        }
        convo.status = record.status;

        self.reresolve_authorship(&record.id, &record.customer.id);
        self.publish_conversations();
    }

    /// Re-derives authorship of messages that arrived before the customer
    /// identity was known.
    fn reresolve_authorship(&mut self, conversation_id: &str, customer_id: &str) {
        let convo = self.entry(conversation_id);
        let before = std::mem::take(&mut convo.messages);
        let after = reconciler::reresolve(&before, customer_id);
        let changed = before != after;
        convo.messages = after;

        if changed {
            let after = convo.messages.clone();
            self.tracker.observe(conversation_id, &before, &after);
            self.publish_messages(conversation_id);
        }
    }

    /// Runs one incoming unit through the reconciler and stores the result.
    pub fn apply(&mut self, conversation_id: &str, unit: Incoming) -> MergeOutcome {
        let convo = self.entry(conversation_id);
        let result = reconcile(&convo.messages, unit, convo.customer_id());

        if !result.changed_list() {
            return result.outcome;
        }

        let before = std::mem::replace(&mut convo.messages, result.messages);
        if let Some(at) = result.last_interaction {
            convo.last_interaction_at = Some(at);
            convo.last_message_preview = convo.messages.last().map(|m| m.body.clone());
        }
        let after = convo.messages.clone();

        self.tracker.observe(conversation_id, &before, &after);
        self.sort_conversations();
        self.publish_messages(conversation_id);
        if result.last_interaction.is_some() {
            self.publish_conversations();
        }
        result.outcome
    }

    /// Applies a status signal. Returns whether any message changed.
    pub fn apply_status(&mut self, conversation_id: &str, update: &StatusUpdate) -> bool {
        let Some(convo) = self.conversations.iter_mut().find(|c| c.id == conversation_id) else {
            return false;
        };

        let after = status::apply(&convo.messages, update);
        if after == convo.messages {
            return false;
        }
        let before = std::mem::replace(&mut convo.messages, after);
        let after = convo.messages.clone();

        self.tracker.observe(conversation_id, &before, &after);
        self.publish_messages(conversation_id);
        true
    }

    /// Changes the active conversation and returns the previous one.
    pub fn select(&mut self, conversation_id: Option<String>) -> Option<String> {
        if let Some(id) = conversation_id.as_deref() {
            self.entry(id);
        }
        let previous = std::mem::replace(&mut self.active, conversation_id);
        if previous != self.active {
            let _ = self.events.send(StoreEvent::ActiveChanged {
                conversation_id: self.active.clone(),
            });
        }
        previous
    }

    pub fn increment_unread(&mut self, conversation_id: &str) {
        self.entry(conversation_id).unread_count += 1;
        self.publish_conversations();
    }

    pub fn mark_seen(&mut self, conversation_id: &str) {
        let convo = self.entry(conversation_id);
        if convo.unread_count > 0 {
            convo.unread_count = 0;
            self.publish_conversations();
        }
    }

    pub fn set_presence(&mut self, conversation_id: &str, online: bool) {
        let convo = self.entry(conversation_id);
        if convo.is_active != online {
            convo.is_active = online;
            self.publish_conversations();
        }
    }

    pub fn set_blocked(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.blocked = Some(reason.clone());
        let _ = self.events.send(StoreEvent::Blocked { reason });
    }

    pub fn publish_connection(&self, state: ConnectionState) {
        let _ = self.events.send(StoreEvent::ConnectionChanged { state });
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations.iter().map(Conversation::summary).collect()
    }

    fn entry(&mut self, id: &str) -> &mut Conversation {
        let pos = match self.conversations.iter().position(|c| c.id == id) {
            Some(pos) => pos,
            None => {
                tracing::debug!(conversation_id = %id, "first sighting of conversation");
                self.conversations.push(Conversation::new(id));
                self.conversations.len() - 1
            }
        };
        &mut self.conversations[pos]
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_interaction_at.cmp(&a.last_interaction_at));
    }

    fn publish_messages(&self, conversation_id: &str) {
        let _ = self.events.send(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
            messages: self.messages(conversation_id).to_vec(),
        });
    }

    fn publish_conversations(&self) {
        let _ = self.events.send(StoreEvent::ConversationsChanged {
            conversations: self.summaries(),
        });
    }
}
