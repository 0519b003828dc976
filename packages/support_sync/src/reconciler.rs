//! Message Reconciler
//!
//! Pure merge logic for one conversation's message list. Every call takes the
//! current list by reference and one incoming unit, and returns a new list; no
//! state is read from anywhere else, so repeated or reordered application is
//! safe to reason about.
//!
//! ## Deduplication
//!
//! Applied in order, first match wins:
//!
//! 1. **Durable id match**: the unit's durable id is already present, so it is a no-op.
//!    A confirmation that lands here still drops its draft, keeping a provisional
//!    id and its durable successor from coexisting.
//! 2. **Provisional supersession**: a confirmation replaces its draft in place,
//!    taking the durable id and server timestamp and moving the status to at
//!    least `delivered`.
//! 3. **Echo match**: an agent-authored unit with the same body as an existing
//!    agent message less than [`ECHO_WINDOW_MS`] apart is the transport
//!    rebroadcasting our own message and is discarded.
//! 4. **Append**.
//!
//! A history batch bypasses the rules and replaces the persisted part of the
//! list wholesale. Drafts still awaiting confirmation survive it.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::types::{AuthorRole, DeliveryStatus, Message, MessageId, PersistedMessage};

/// Maximum distance between an agent message and its transport echo.
pub const ECHO_WINDOW_MS: i64 = 10_000;

/// A message as delivered by the real-time transport, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One unit of incoming information for a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Locally authored message, not yet acknowledged by anyone.
    Draft(Message),
    /// Single message pushed by the transport.
    InboundSingle(InboundMessage),
    /// Full persisted history for the conversation.
    InboundBatch(Vec<PersistedMessage>),
    /// The persistence service stored a draft.
    PersistedConfirmation {
        provisional_id: String,
        record: PersistedMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    AlreadyPresent,
    Superseded,
    EchoDiscarded,
    Replaced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub messages: Vec<Message>,
    pub outcome: MergeOutcome,
    /// New last-interaction timestamp, set only when it advanced.
    pub last_interaction: Option<DateTime<Utc>>,
}

impl Reconciled {
    pub fn changed_list(&self) -> bool {
        !matches!(
            self.outcome,
            MergeOutcome::AlreadyPresent | MergeOutcome::EchoDiscarded
        )
    }
}

/// Decides authorship from identity alone.
///
/// With no cached customer identity (or no reported author) the unit is treated
/// as customer-authored until [`reresolve`] runs.
pub fn resolve_author(reported: Option<&str>, customer_id: Option<&str>) -> AuthorRole {
    match (reported, customer_id) {
        (Some(reported), Some(customer)) if reported != customer => AuthorRole::Agent,
        _ => AuthorRole::Customer,
    }
}

pub fn reconcile(current: &[Message], unit: Incoming, customer_id: Option<&str>) -> Reconciled {
    let mut messages = current.to_vec();

    let outcome = match unit {
        Incoming::Draft(draft) => merge_draft(&mut messages, draft),
        Incoming::InboundSingle(inbound) => {
            merge_inbound(&mut messages, inbound_to_message(inbound, customer_id))
        }
        Incoming::InboundBatch(batch) => {
            messages = replace_with_batch(current, batch, customer_id);
            MergeOutcome::Replaced
        }
        Incoming::PersistedConfirmation {
            provisional_id,
            record,
        } => merge_confirmation(&mut messages, &provisional_id, record),
    };

    sort_by_time(&mut messages);
    let last_interaction = advanced_interaction(current, &messages);

    Reconciled {
        messages,
        outcome,
        last_interaction,
    }
}

/// Re-derives authorship for transport-sourced messages once the customer
/// identity is cached, then collapses any echoes that the bootstrap rule let
/// through as customer messages.
///
/// Drafts and confirmed drafts carry authoritative authorship and are kept as is.
pub fn reresolve(current: &[Message], customer_id: &str) -> Vec<Message> {
    let mut resolved: Vec<Message> = Vec::with_capacity(current.len());
    let mut promoted = Vec::new();

    for message in current {
        let mut message = message.clone();
        let reported = message.author_id.clone();
        let authoritative = message.id.is_provisional() || message.client_ref.is_some();

        if let (Some(reported), false) = (reported, authoritative) {
            let role = resolve_author(Some(&reported), Some(customer_id));
            if role != message.author {
                message.author = role;
                message.status = match role {
                    AuthorRole::Agent => Some(derived_status(message.read_at.is_some())),
                    AuthorRole::Customer => None,
                };
                if role == AuthorRole::Agent {
                    promoted.push(message);
                    continue;
                }
            }
        }
        resolved.push(message);
    }

    for message in promoted {
        if find_echo_target(&resolved, &message).is_none() {
            resolved.push(message);
        }
    }

    sort_by_time(&mut resolved);
    resolved
}

fn merge_draft(messages: &mut Vec<Message>, draft: Message) -> MergeOutcome {
    if messages.iter().any(|m| m.id == draft.id) {
        return MergeOutcome::AlreadyPresent;
    }
    messages.push(draft);
    MergeOutcome::Appended
}

fn merge_inbound(messages: &mut Vec<Message>, incoming: Message) -> MergeOutcome {
    // Rule 1
    if let Some(durable) = incoming.id.durable() {
        if messages.iter().any(|m| m.id.durable() == Some(durable)) {
            return MergeOutcome::AlreadyPresent;
        }
    }

    // Rule 3
    if incoming.is_agent() && find_echo_target(messages, &incoming).is_some() {
        tracing::debug!(id = %incoming.id, "discarding transport echo");
        return MergeOutcome::EchoDiscarded;
    }

    // Rule 4
    messages.push(incoming);
    MergeOutcome::Appended
}

fn merge_confirmation(
    messages: &mut Vec<Message>,
    provisional_id: &str,
    record: PersistedMessage,
) -> MergeOutcome {
    let floor = derived_status(record.read_at.is_some());
    let draft_pos = messages
        .iter()
        .position(|m| m.id.is_provisional() && m.id.as_str() == provisional_id);

    // Rule 1: the durable record already arrived by another path.
    if messages.iter().any(|m| m.id.durable() == Some(record.id.as_str())) {
        let draft = draft_pos.map(|pos| messages.remove(pos));
        let Some(existing) = messages
            .iter_mut()
            .find(|m| m.id.durable() == Some(record.id.as_str()))
        else {
            return MergeOutcome::AlreadyPresent;
        };

        let untouched = existing.clone();
        let floor = draft
            .as_ref()
            .and_then(|d| d.status)
            .map_or(floor, |s| s.advance_to(floor));
        existing.status = Some(existing.status.map_or(floor, |s| s.advance_to(floor)));
        existing.author = AuthorRole::Agent;
        if existing.client_ref.is_none() {
            existing.client_ref = Some(provisional_id.to_string());
        }

        return if draft.is_some() || *existing != untouched {
            MergeOutcome::Superseded
        } else {
            MergeOutcome::AlreadyPresent
        };
    }

    // Rule 2
    if let Some(pos) = draft_pos {
        let entry = &mut messages[pos];
        entry.id = MessageId::Durable(record.id);
        entry.client_ref = Some(provisional_id.to_string());
        entry.created_at = record.created_at;
        entry.author_id = Some(record.author_id);
        if record.author_name.is_some() {
            entry.author_name = record.author_name;
        }
        if record.read_at.is_some() {
            entry.read_at = record.read_at;
        }
        entry.status = Some(entry.status.map_or(floor, |s| s.advance_to(floor)));
        return MergeOutcome::Superseded;
    }

    let confirmed = Message {
        id: MessageId::Durable(record.id),
        author: AuthorRole::Agent,
        author_id: Some(record.author_id),
        author_name: record.author_name,
        body: record.body,
        created_at: record.created_at,
        status: Some(floor),
        read_at: record.read_at,
        client_ref: Some(provisional_id.to_string()),
    };

    // Rule 3
    if find_echo_target(messages, &confirmed).is_some() {
        return MergeOutcome::EchoDiscarded;
    }

    // Rule 4
    messages.push(confirmed);
    MergeOutcome::Appended
}

fn replace_with_batch(
    current: &[Message],
    batch: Vec<PersistedMessage>,
    customer_id: Option<&str>,
) -> Vec<Message> {
    let mut seen = HashSet::new();

    let mut messages: Vec<Message> = batch
        .into_iter()
        .filter(|p| seen.insert(p.id.clone()))
        .map(|p| {
            let author = resolve_author(Some(&p.author_id), customer_id);
            let previous = current
                .iter()
                .find(|m| m.id.durable() == Some(p.id.as_str()));

            let status = match author {
                AuthorRole::Agent => {
                    let derived = derived_status(p.read_at.is_some());
                    // Never step back below what the list already showed.
                    Some(
                        previous
                            .and_then(|m| m.status)
                            .map_or(derived, |prev| derived.advance_to(prev)),
                    )
                }
                AuthorRole::Customer => None,
            };

            Message {
                id: MessageId::Durable(p.id),
                author,
                author_id: Some(p.author_id),
                author_name: p.author_name,
                body: p.body,
                created_at: p.created_at,
                status,
                read_at: p.read_at,
                client_ref: previous.and_then(|m| m.client_ref.clone()),
            }
        })
        .collect();

    // Drafts are not persisted data: one whose stored copy is in the batch
    // hands over its lineage, the rest stay until confirmed.
    for draft in current.iter().filter(|m| m.id.is_provisional()) {
        let stored = messages.iter().position(|m| {
            m.client_ref.is_none() && m.id.durable().is_some() && is_echo_of(m, draft)
        });
        match stored {
            Some(pos) => {
                let entry = &mut messages[pos];
                entry.client_ref = Some(draft.id.as_str().to_string());
                if let (Some(current), Some(held)) = (entry.status, draft.status) {
                    entry.status = Some(current.advance_to(held));
                }
            }
            None => messages.push(draft.clone()),
        }
    }

    messages
}

fn inbound_to_message(inbound: InboundMessage, customer_id: Option<&str>) -> Message {
    let author = resolve_author(inbound.author_id.as_deref(), customer_id);
    Message {
        id: MessageId::parse(inbound.id),
        author,
        author_id: inbound.author_id,
        author_name: inbound.author_name,
        body: inbound.body,
        created_at: inbound.created_at,
        status: match author {
            AuthorRole::Agent => Some(DeliveryStatus::Delivered),
            AuthorRole::Customer => None,
        },
        read_at: None,
        client_ref: None,
    }
}

fn find_echo_target(messages: &[Message], incoming: &Message) -> Option<usize> {
    messages.iter().position(|m| is_echo_of(m, incoming))
}

fn is_echo_of(a: &Message, b: &Message) -> bool {
    a.is_agent()
        && b.is_agent()
        && a.body == b.body
        && (a.created_at - b.created_at).num_milliseconds().abs() < ECHO_WINDOW_MS
}

fn derived_status(read: bool) -> DeliveryStatus {
    if read {
        DeliveryStatus::Read
    } else {
        DeliveryStatus::Delivered
    }
}

fn sort_by_time(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
}

fn advanced_interaction(before: &[Message], after: &[Message]) -> Option<DateTime<Utc>> {
    let previous = before.iter().map(|m| m.created_at).max();
    let latest = after.iter().map(|m| m.created_at).max();
    if latest > previous { latest } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn draft(id: &str, body: &str, secs: i64) -> Message {
        Message {
            id: MessageId::parse(id),
            author: AuthorRole::Agent,
            author_id: Some("agent-1".into()),
            author_name: Some("Agent".into()),
            body: body.into(),
            created_at: at(secs),
            status: Some(DeliveryStatus::Sent),
            read_at: None,
            client_ref: None,
        }
    }

    fn persisted(id: &str, author: &str, body: &str, secs: i64) -> PersistedMessage {
        PersistedMessage {
            id: id.into(),
            author_id: author.into(),
            author_name: None,
            body: body.into(),
            created_at: at(secs),
            read_at: None,
        }
    }

    fn inbound(id: &str, author: &str, body: &str, secs: i64) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            author_id: Some(author.into()),
            author_name: Some("Someone".into()),
            body: body.into(),
            created_at: at(secs),
        }
    }

    fn confirmation(provisional: &str, durable: &str, body: &str, secs: i64) -> Incoming {
        Incoming::PersistedConfirmation {
            provisional_id: provisional.into(),
            record: persisted(durable, "agent-1", body, secs),
        }
    }

    const CUSTOMER: Option<&str> = Some("cust-1");

    #[test]
    fn confirmation_supersedes_draft() {
        let list = vec![draft("temp-1", "Olá", 0)];
        let out = reconcile(&list, confirmation("temp-1", "m-500", "Olá", 1), CUSTOMER);

        assert_eq!(out.outcome, MergeOutcome::Superseded);
        assert_eq!(out.messages.len(), 1);
        let msg = &out.messages[0];
        assert_eq!(msg.id, MessageId::Durable("m-500".into()));
        assert_eq!(msg.status, Some(DeliveryStatus::Delivered));
        assert_eq!(msg.created_at, at(1));
        assert_eq!(msg.lineage_key(), "temp-1");
    }

    #[test]
    fn echo_before_confirmation_is_discarded() {
        let list = vec![draft("temp-1", "Olá", 0)];
        let out = reconcile(
            &list,
            Incoming::InboundSingle(inbound("m-500", "agent-1", "Olá", 2)),
            CUSTOMER,
        );

        assert_eq!(out.outcome, MergeOutcome::EchoDiscarded);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Sent));

        let out = reconcile(&out.messages, confirmation("temp-1", "m-500", "Olá", 2), CUSTOMER);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].id.as_str(), "m-500");
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Delivered));
    }

    #[test]
    fn echo_after_confirmation_matches_durable_id() {
        let list = vec![draft("temp-1", "Olá", 0)];
        let out = reconcile(&list, confirmation("temp-1", "m-500", "Olá", 1), CUSTOMER);
        let out = reconcile(
            &out.messages,
            Incoming::InboundSingle(inbound("m-500", "agent-1", "Olá", 1)),
            CUSTOMER,
        );
        assert_eq!(out.outcome, MergeOutcome::AlreadyPresent);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn late_echo_then_confirmation_drops_draft() {
        // Echo arrives outside the window and is appended on its own.
        let list = vec![draft("temp-1", "Olá", 0)];
        let out = reconcile(
            &list,
            Incoming::InboundSingle(inbound("m-500", "agent-1", "Olá", 30)),
            CUSTOMER,
        );
        assert_eq!(out.outcome, MergeOutcome::Appended);
        assert_eq!(out.messages.len(), 2);

        let out = reconcile(&out.messages, confirmation("temp-1", "m-500", "Olá", 30), CUSTOMER);
        assert_eq!(out.outcome, MergeOutcome::Superseded);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].id.as_str(), "m-500");
        assert_eq!(out.messages[0].lineage_key(), "temp-1");
    }

    #[test]
    fn confirmation_never_lowers_read() {
        let mut read_draft = draft("temp-1", "Olá", 0);
        read_draft.status = Some(DeliveryStatus::Read);
        let out = reconcile(&[read_draft], confirmation("temp-1", "m-1", "Olá", 1), CUSTOMER);
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Read));
    }

    #[test]
    fn confirmation_without_draft_is_appended() {
        let out = reconcile(&[], confirmation("temp-9", "m-9", "hi", 0), CUSTOMER);
        assert_eq!(out.outcome, MergeOutcome::Appended);
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Delivered));
        assert_eq!(out.messages[0].author, AuthorRole::Agent);
    }

    #[test]
    fn customer_message_with_same_body_is_not_an_echo() {
        let list = vec![draft("temp-1", "ok", 0)];
        let out = reconcile(
            &list,
            Incoming::InboundSingle(inbound("m-2", "cust-1", "ok", 1)),
            CUSTOMER,
        );
        assert_eq!(out.outcome, MergeOutcome::Appended);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[1].author, AuthorRole::Customer);
        assert_eq!(out.messages[1].status, None);
    }

    #[test]
    fn agent_message_from_transport_starts_delivered() {
        let out = reconcile(
            &[],
            Incoming::InboundSingle(inbound("m-3", "agent-2", "from a colleague", 0)),
            CUSTOMER,
        );
        assert_eq!(out.messages[0].author, AuthorRole::Agent);
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Delivered));
    }

    #[test]
    fn duplicate_inbound_is_a_noop() {
        let unit = Incoming::InboundSingle(inbound("m-1", "cust-1", "hello", 0));
        let once = reconcile(&[], unit.clone(), CUSTOMER);
        let twice = reconcile(&once.messages, unit, CUSTOMER);
        assert_eq!(twice.outcome, MergeOutcome::AlreadyPresent);
        assert_eq!(once.messages, twice.messages);
        assert!(twice.last_interaction.is_none());
    }

    #[test]
    fn duplicate_draft_is_a_noop() {
        let list = vec![draft("temp-1", "a", 0)];
        let out = reconcile(&list, Incoming::Draft(draft("temp-1", "a", 0)), CUSTOMER);
        assert_eq!(out.outcome, MergeOutcome::AlreadyPresent);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn authorship_ignores_display_name() {
        let mut unit = inbound("m-1", "cust-1", "hi", 0);
        unit.author_name = Some("Support Agent".into());
        let out = reconcile(&[], Incoming::InboundSingle(unit), CUSTOMER);
        assert_eq!(out.messages[0].author, AuthorRole::Customer);

        assert_eq!(resolve_author(Some("cust-1"), Some("cust-1")), AuthorRole::Customer);
        assert_eq!(resolve_author(Some("agent-9"), Some("cust-1")), AuthorRole::Agent);
        assert_eq!(resolve_author(Some("agent-9"), None), AuthorRole::Customer);
        assert_eq!(resolve_author(None, Some("cust-1")), AuthorRole::Customer);
    }

    #[test]
    fn batch_replaces_and_derives_status() {
        let mut read_reply = persisted("m-3", "agent-1", "how can I help?", 3);
        read_reply.read_at = Some(at(5));
        let batch = vec![
            persisted("m-2", "cust-1", "second", 2),
            read_reply,
            persisted("m-1", "cust-1", "first", 1),
        ];

        let out = reconcile(&[draft("m-0", "stale", 0)], Incoming::InboundBatch(batch), CUSTOMER);

        assert_eq!(out.outcome, MergeOutcome::Replaced);
        let ids: Vec<_> = out.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
        assert_eq!(out.messages[0].status, None);
        assert_eq!(out.messages[2].author, AuthorRole::Agent);
        assert_eq!(out.messages[2].status, Some(DeliveryStatus::Read));
    }

    #[test]
    fn batch_keeps_higher_local_status() {
        let mut local = draft("m-1", "hello", 0);
        local.status = Some(DeliveryStatus::Read);
        local.client_ref = Some("temp-1".into());

        let out = reconcile(
            &[local],
            Incoming::InboundBatch(vec![persisted("m-1", "agent-1", "hello", 0)]),
            CUSTOMER,
        );
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Read));
        assert_eq!(out.messages[0].lineage_key(), "temp-1");
    }

    #[test]
    fn batch_keeps_unconfirmed_drafts() {
        let mut pending = draft("temp-1", "did it arrive?", 10);
        pending.status = Some(DeliveryStatus::Sent);
        let out = reconcile(
            &[pending],
            Incoming::InboundBatch(vec![persisted("m-1", "cust-1", "hello", 0)]),
            CUSTOMER,
        );
        let ids: Vec<_> = out.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "temp-1"]);
        assert_eq!(out.messages[1].status, Some(DeliveryStatus::Sent));
    }

    #[test]
    fn batch_copy_of_a_draft_takes_its_lineage() {
        let mut pending = draft("temp-1", "Olá", 0);
        pending.status = Some(DeliveryStatus::Read);
        let out = reconcile(
            &[pending],
            Incoming::InboundBatch(vec![persisted("m-500", "agent-1", "Olá", 1)]),
            CUSTOMER,
        );
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].id.as_str(), "m-500");
        assert_eq!(out.messages[0].lineage_key(), "temp-1");
        assert_eq!(out.messages[0].status, Some(DeliveryStatus::Read));

        // The late confirmation changes nothing further.
        let again = reconcile(&out.messages, confirmation("temp-1", "m-500", "Olá", 1), CUSTOMER);
        assert_eq!(again.outcome, MergeOutcome::AlreadyPresent);
        assert_eq!(again.messages, out.messages);
    }

    #[test]
    fn batch_drops_duplicate_ids() {
        let out = reconcile(
            &[],
            Incoming::InboundBatch(vec![
                persisted("m-1", "cust-1", "a", 0),
                persisted("m-1", "cust-1", "a", 0),
            ]),
            CUSTOMER,
        );
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn out_of_order_arrivals_stay_sorted() {
        let list = vec![draft("temp-1", "later", 10)];
        let out = reconcile(
            &list,
            Incoming::InboundSingle(inbound("m-1", "cust-1", "earlier", 5)),
            CUSTOMER,
        );
        assert_eq!(out.messages[0].body, "earlier");
        assert_eq!(out.messages[1].body, "later");
        assert!(out.last_interaction.is_none());
    }

    #[test]
    fn last_interaction_advances_with_newer_messages() {
        let out = reconcile(
            &[],
            Incoming::InboundSingle(inbound("m-1", "cust-1", "hi", 7)),
            CUSTOMER,
        );
        assert_eq!(out.last_interaction, Some(at(7)));
    }

    #[test]
    fn bootstrap_echo_collapses_after_reresolve() {
        // Without a cached customer id the echo is taken for a customer message.
        let list = vec![draft("temp-1", "Olá", 0)];
        let out = reconcile(
            &list,
            Incoming::InboundSingle(inbound("m-500", "agent-1", "Olá", 1)),
            None,
        );
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[1].author, AuthorRole::Customer);

        let resolved = reresolve(&out.messages, "cust-1");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id.as_str(), "temp-1");
    }

    #[test]
    fn reresolve_promotes_colleague_messages() {
        let out = reconcile(
            &[],
            Incoming::InboundSingle(inbound("m-1", "agent-2", "handing over", 0)),
            None,
        );
        let resolved = reresolve(&out.messages, "cust-1");
        assert_eq!(resolved[0].author, AuthorRole::Agent);
        assert_eq!(resolved[0].status, Some(DeliveryStatus::Delivered));

        // Running it again changes nothing.
        assert_eq!(reresolve(&resolved, "cust-1"), resolved);
    }
}
