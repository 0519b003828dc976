//! Delivery status of agent-authored messages.
//!
//! Drafts start at `not-sent`, move to `sent` once the transport accepted
//! them, to `delivered` when persistence (or a durable echo) confirms them,
//! and to `read` on a read receipt. Every transition is funneled through
//! [`DeliveryStatus::advance_to`], so no path can move a message backwards.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use crate::config::AgentConfig;
use crate::types::{AuthorRole, DeliveryStatus, Message, MessageId};

/// Default maximum number of transitions retained in the log.
const DEFAULT_MAX_TRANSITIONS: usize = 1000;

/// A status signal that is not itself a message.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The transport accepted the send call for this draft.
    Sent { provisional_id: String },
    /// The customer read the conversation.
    ReadReceipt { read_at: Option<DateTime<Utc>> },
}

/// Creates a locally authored draft at `not-sent`.
pub fn create_draft(body: impl Into<String>, agent: &AgentConfig, now: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::provisional(),
        author: AuthorRole::Agent,
        author_id: Some(agent.owner_id.clone()),
        author_name: Some(agent.display_name.clone()),
        body: body.into(),
        created_at: now,
        status: Some(DeliveryStatus::NotSent),
        read_at: None,
        client_ref: None,
    }
}

/// Applies a status signal to a conversation's message list.
pub fn apply(current: &[Message], update: &StatusUpdate) -> Vec<Message> {
    current
        .iter()
        .cloned()
        .map(|mut message| {
            match update {
                StatusUpdate::Sent { provisional_id } => {
                    if message.id.as_str() == provisional_id
                        && message.status == Some(DeliveryStatus::NotSent)
                    {
                        message.status = Some(DeliveryStatus::Sent);
                    }
                }
                StatusUpdate::ReadReceipt { read_at } => {
                    if message.is_agent()
                        && matches!(
                            message.status,
                            Some(DeliveryStatus::Sent) | Some(DeliveryStatus::Delivered)
                        )
                    {
                        message.status = message.status.map(|s| s.advance_to(DeliveryStatus::Read));
                        if message.read_at.is_none() {
                            message.read_at = *read_at;
                        }
                    }
                }
            }
            message
        })
        .collect()
}

/// One observed status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub conversation_id: String,
    pub lineage_key: String,
    /// `None` when the message first appeared with this status.
    pub from: Option<DeliveryStatus>,
    pub to: DeliveryStatus,
}

/// Bounded log of status transitions observed in the store.
#[derive(Debug)]
pub struct StatusTracker {
    log: VecDeque<StatusTransition>,
    max_entries: usize,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRANSITIONS)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            log: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Diffs two versions of a conversation's list and records every status change.
    pub fn observe(&mut self, conversation_id: &str, before: &[Message], after: &[Message]) {
        let previous: HashMap<&str, Option<DeliveryStatus>> = before
            .iter()
            .map(|m| (m.lineage_key(), m.status))
            .collect();

        for message in after {
            let Some(to) = message.status else {
                continue;
            };
            let from = previous.get(message.lineage_key()).copied().flatten();
            if from == Some(to) {
                continue;
            }
            if from.is_some_and(|from| to < from) {
                tracing::warn!(
                    conversation_id,
                    lineage_key = message.lineage_key(),
                    ?from,
                    ?to,
                    "delivery status moved backwards"
                );
            }
            self.push(StatusTransition {
                conversation_id: conversation_id.to_string(),
                lineage_key: message.lineage_key().to_string(),
                from,
                to,
            });
        }
    }

    fn push(&mut self, transition: StatusTransition) {
        while self.log.len() >= self.max_entries {
            self.log.pop_front();
        }
        self.log.push_back(transition);
    }

    pub fn transitions(&self) -> impl Iterator<Item = &StatusTransition> {
        self.log.iter()
    }

    /// Statuses one message passed through, oldest first.
    pub fn history(&self, lineage_key: &str) -> Vec<DeliveryStatus> {
        self.log
            .iter()
            .filter(|t| t.lineage_key == lineage_key)
            .map(|t| t.to)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
