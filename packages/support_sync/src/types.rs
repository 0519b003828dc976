use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix that marks a locally generated message id.
pub const PROVISIONAL_PREFIX: &str = "temp-";

/// Identity of a message: either generated locally before the persistence
/// service confirmed it, or assigned by that service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Provisional(String),
    Durable(String),
}

impl MessageId {
    /// Generates a fresh provisional id (`temp-<uuid>`).
    pub fn provisional() -> Self {
        Self::Provisional(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    /// Classifies a raw id by its prefix.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with(PROVISIONAL_PREFIX) {
            Self::Provisional(raw)
        } else {
            Self::Durable(raw)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisional(id) | Self::Durable(id) => id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn durable(&self) -> Option<&str> {
        match self {
            Self::Durable(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(MessageId::parse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    Customer,
    Agent,
}

impl fmt::Display for AuthorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer => write!(f, "customer"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Outbound delivery status of an agent-authored message.
///
/// Variants are declared in progression order, so `Ord` doubles as the
/// monotonicity check: a message may only move to a status that compares
/// greater than or equal to its current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    NotSent,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Returns the later of the two statuses.
    pub fn advance_to(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSent => write!(f, "not-sent"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-sent" => Ok(Self::NotSent),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            _ => Err(format!("unknown delivery status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Open,
    WaitingOnCustomer,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: AuthorRole,
    /// Identity reported by the source, kept so authorship can be
    /// re-resolved once the customer identity is known.
    pub author_id: Option<String>,
    /// Display only. Never used to decide authorship.
    pub author_name: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// `None` for customer-authored messages.
    pub status: Option<DeliveryStatus>,
    pub read_at: Option<DateTime<Utc>>,
    /// Provisional id this message superseded, if any.
    pub client_ref: Option<String>,
}

impl Message {
    /// Key that stays the same when a draft is superseded by its durable record.
    pub fn lineage_key(&self) -> &str {
        self.client_ref.as_deref().unwrap_or_else(|| self.id.as_str())
    }

    pub fn is_agent(&self) -> bool {
        self.author == AuthorRole::Agent
    }
}

/// A message as stored by the persistence service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Conversation list item returned by the persistence service or carried by
/// a transport snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub unread_count: u32,
}

/// Full conversation as returned by fetch-conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub customer: Customer,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub messages: Vec<PersistedMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Equal to the transport room identifier.
    pub id: String,
    pub customer: Option<Customer>,
    pub channel: String,
    pub status: ConversationStatus,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    /// Whether the customer is currently connected.
    pub is_active: bool,
    pub unread_count: u32,
    pub last_message_preview: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            customer: None,
            channel: String::new(),
            status: ConversationStatus::Open,
            last_interaction_at: None,
            messages: Vec::new(),
            is_active: false,
            unread_count: 0,
            last_message_preview: None,
        }
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id.as_str())
    }

    /// Overwrites list metadata from a summary. Messages are left untouched
    /// and a known customer identity is never cleared.
    pub fn apply_summary(&mut self, summary: &ConversationSummary) {
        if summary.customer.is_some() {
            self.customer = summary.customer.clone();
        }
        self.channel = summary.channel.clone();
        self.status = summary.status;
        self.is_active = summary.is_active;
        self.unread_count = summary.unread_count;
        if summary.last_interaction_at > self.last_interaction_at {
            self.last_interaction_at = summary.last_interaction_at;
            self.last_message_preview = summary.last_message_preview.clone();
        } else if self.last_message_preview.is_none() {
            self.last_message_preview = summary.last_message_preview.clone();
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            customer: self.customer.clone(),
            channel: self.channel.clone(),
            status: self.status,
            last_interaction_at: self.last_interaction_at,
            last_message_preview: self.last_message_preview.clone(),
            is_active: self.is_active,
            unread_count: self.unread_count,
        }
    }
}
