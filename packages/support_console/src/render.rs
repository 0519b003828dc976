//! Turns store events into terminal lines.

use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};
use support_sync::{
    AuthorRole, ConversationStatus, ConversationSummary, DeliveryStatus, Message, StoreEvent,
};

/// Marker shown after an agent message for its delivery status.
pub fn status_marker(status: Option<DeliveryStatus>) -> &'static str {
    match status {
        None => "",
        Some(DeliveryStatus::NotSent) => "·",
        Some(DeliveryStatus::Sent) => "✓",
        Some(DeliveryStatus::Delivered) => "✓✓",
        Some(DeliveryStatus::Read) => "✓✓ read",
    }
}

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

fn conversation_status(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Open => "open",
        ConversationStatus::WaitingOnCustomer => "waiting",
        ConversationStatus::Resolved => "resolved",
    }
}

pub fn format_message(message: &Message) -> String {
    let who = match message.author {
        AuthorRole::Agent => "You".to_string(),
        AuthorRole::Customer => message
            .author_name
            .clone()
            .or_else(|| message.author_id.clone())
            .unwrap_or_else(|| "Customer".to_string()),
    };
    let marker = status_marker(message.status);
    if marker.is_empty() {
        format!("[{}] {}: {}", clock(message.created_at), who, message.body)
    } else {
        format!(
            "[{}] {}: {} {}",
            clock(message.created_at),
            who,
            message.body,
            marker
        )
    }
}

pub fn format_summary(summary: &ConversationSummary) -> String {
    let name = summary
        .customer
        .as_ref()
        .map(|c| c.display_name.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("unknown customer");
    let presence = if summary.is_active { "●" } else { "○" };

    let mut line = format!(
        "{presence} {}  {name} [{}]",
        summary.id,
        conversation_status(summary.status)
    );
    if !summary.channel.is_empty() {
        line.push_str(&format!(" via {}", summary.channel));
    }
    if summary.unread_count > 0 {
        line.push_str(&format!(" ({} unread)", summary.unread_count));
    }
    if let Some(preview) = &summary.last_message_preview {
        line.push_str(&format!(": {}", truncate(preview, 40)));
    }
    line
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Remembers what has been printed so each store snapshot only produces the
/// lines that are new to the reader.
#[derive(Debug, Default)]
pub struct Renderer {
    active: Option<String>,
    /// lineage key → last printed status
    printed: HashMap<String, Option<DeliveryStatus>>,
    unread: HashMap<String, u32>,
    conversations: Vec<ConversationSummary>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest conversation list seen on the event stream.
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn render(&mut self, event: &StoreEvent) -> Vec<String> {
        match event {
            StoreEvent::ConversationsChanged { conversations } => {
                self.conversations_changed(conversations)
            }
            StoreEvent::MessagesChanged {
                conversation_id,
                messages,
            } => {
                if self.active.as_deref() == Some(conversation_id.as_str()) {
                    self.messages_changed(messages)
                } else {
                    Vec::new()
                }
            }
            StoreEvent::ActiveChanged { conversation_id } => {
                self.active = conversation_id.clone();
                self.printed.clear();
                match conversation_id {
                    Some(id) => vec![format!("== {id} ==")],
                    None => vec!["== no conversation ==".to_string()],
                }
            }
            StoreEvent::ConnectionChanged { state } => vec![format!("-- connection: {state}")],
            StoreEvent::Blocked { reason } => vec![format!("!! session blocked: {reason}")],
        }
    }

    fn conversations_changed(&mut self, conversations: &[ConversationSummary]) -> Vec<String> {
        let mut lines = Vec::new();
        for summary in conversations {
            let before = self.unread.get(&summary.id).copied().unwrap_or(0);
            if summary.unread_count > before && self.active.as_deref() != Some(summary.id.as_str())
            {
                lines.push(format!("* new message in {}", format_summary(summary)));
            }
            self.unread.insert(summary.id.clone(), summary.unread_count);
        }
        self.conversations = conversations.to_vec();
        lines
    }

    fn messages_changed(&mut self, messages: &[Message]) -> Vec<String> {
        let mut lines = Vec::new();
        for message in messages {
            let key = message.lineage_key().to_string();
            match self.printed.get(&key) {
                None => lines.push(format_message(message)),
                Some(previous) if *previous != message.status => {
                    lines.push(format!(
                        "  {} {}",
                        status_marker(message.status),
                        truncate(&message.body, 30)
                    ));
                }
                Some(_) => continue,
            }
            self.printed.insert(key, message.status);
        }
        lines
    }
}
