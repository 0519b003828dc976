//! Wire format of the real-time channel.
//!
//! Every frame is a JSON text message `{"event": "<name>", "data": {...}}`
//! with camelCase payload keys. Inbound frames are normalized into
//! [`TransportEvent`]s carrying the core's own types.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::reconciler::InboundMessage;
use crate::types::{ConversationSummary, PersistedMessage};

use super::connection::ConnectionState;

pub const AGENT_REGISTER: &str = "agent:register";
pub const AGENT_REGISTERED: &str = "agent:registered";
pub const AGENT_JOIN: &str = "agent:join";
pub const AGENT_LEAVE: &str = "agent:leave";
pub const MESSAGE_SEND: &str = "message:send";
pub const CONVERSATION_HISTORY: &str = "conversation:history";
pub const MESSAGE_RECEIVED: &str = "message:received";
pub const MESSAGES_READ: &str = "messages:read";
pub const CONVERSATIONS_SNAPSHOT: &str = "conversations:snapshot";
pub const CUSTOMER_PRESENCE: &str = "customer:presence";
pub const ERROR: &str = "error";

/// Outbound intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Register {
        display_name: String,
        market_id: String,
    },
    Join {
        conversation_id: String,
    },
    Leave,
    /// Target is the currently joined conversation.
    Send {
        body: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => AGENT_REGISTER,
            Self::Join { .. } => AGENT_JOIN,
            Self::Leave => AGENT_LEAVE,
            Self::Send { .. } => MESSAGE_SEND,
        }
    }

    pub fn to_frame(&self) -> String {
        let data = match self {
            Self::Register {
                display_name,
                market_id,
            } => json!({ "displayName": display_name, "marketId": market_id }),
            Self::Join { conversation_id } => json!({ "conversationId": conversation_id }),
            Self::Leave => json!({}),
            Self::Send { body } => json!({ "body": body }),
        };
        json!({ "event": self.name(), "data": data }).to_string()
    }
}

/// Inbound events, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Synthesized by the connection task on every state change.
    StateChanged(ConnectionState),
    Registered,
    History {
        conversation_id: String,
        messages: Vec<PersistedMessage>,
    },
    Message {
        conversation_id: String,
        message: InboundMessage,
    },
    Read {
        conversation_id: String,
        read_by: Option<String>,
        read_at: Option<DateTime<Utc>>,
    },
    ConversationsSnapshot(Vec<ConversationSummary>),
    Presence {
        conversation_id: String,
        online: bool,
    },
    Error {
        message: String,
    },
    /// Reconnection stopped after the configured number of attempts.
    GaveUp {
        attempts: u32,
    },
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPayload {
    conversation_id: String,
    #[serde(default)]
    messages: Vec<PersistedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    id: String,
    conversation_id: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    body: String,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadPayload {
    conversation_id: String,
    #[serde(default)]
    read_by: Option<String>,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct SnapshotPayload {
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    conversation_id: String,
    online: bool,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

/// Decodes one text frame. Unknown event names yield `Ok(None)`.
pub fn decode(text: &str) -> Result<Option<TransportEvent>, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;

    let event = match frame.event.as_str() {
        AGENT_REGISTERED => TransportEvent::Registered,
        CONVERSATION_HISTORY => {
            let p: HistoryPayload = serde_json::from_value(frame.data)?;
            TransportEvent::History {
                conversation_id: p.conversation_id,
                messages: p.messages,
            }
        }
        MESSAGE_RECEIVED => {
            let p: MessagePayload = serde_json::from_value(frame.data)?;
            TransportEvent::Message {
                conversation_id: p.conversation_id,
                message: InboundMessage {
                    id: p.id,
                    author_id: p.author_id,
                    author_name: p.author_name,
                    body: p.body,
                    created_at: p.timestamp,
                },
            }
        }
        MESSAGES_READ => {
            let p: ReadPayload = serde_json::from_value(frame.data)?;
            TransportEvent::Read {
                conversation_id: p.conversation_id,
                read_by: p.read_by,
                read_at: p.read_at,
            }
        }
        CONVERSATIONS_SNAPSHOT => {
            let p: SnapshotPayload = serde_json::from_value(frame.data)?;
            TransportEvent::ConversationsSnapshot(p.conversations)
        }
        CUSTOMER_PRESENCE => {
            let p: PresencePayload = serde_json::from_value(frame.data)?;
            TransportEvent::Presence {
                conversation_id: p.conversation_id,
                online: p.online,
            }
        }
        ERROR => {
            let p: ErrorPayload = serde_json::from_value(frame.data)?;
            TransportEvent::Error { message: p.message }
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}
