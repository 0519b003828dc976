use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

use support_sync::reconciler::{InboundMessage, Incoming, reconcile};
use support_sync::status::StatusUpdate;
use support_sync::store::ConversationStore;
use support_sync::types::{
    AuthorRole, ConversationRecord, Customer, DeliveryStatus, Message, MessageId, PersistedMessage,
};

const ROOM: &str = "room-1";
const CUSTOMER: &str = "cust-1";
const AGENT: &str = "agent-1";

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

fn is_sorted(messages: &[Message]) -> bool {
    messages.windows(2).all(|w| w[0].created_at <= w[1].created_at)
}

// --- Reconciler: idempotence, ordering, authorship ---

fn arb_author() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(CUSTOMER), Just(AGENT), Just("agent-2")]
}

fn arb_inbound() -> impl Strategy<Value = InboundMessage> {
    (0u32..20, arb_author(), "[a-z]{1,8}", 0i64..60_000).prop_map(|(n, author, body, ms)| {
        InboundMessage {
            id: format!("m-{n}"),
            author_id: Some(author.to_string()),
            author_name: None,
            body,
            created_at: at(ms),
        }
    })
}

fn build(units: &[InboundMessage]) -> Vec<Message> {
    units.iter().fold(Vec::new(), |list, unit| {
        reconcile(&list, Incoming::InboundSingle(unit.clone()), Some(CUSTOMER)).messages
    })
}

proptest! {
    #[test]
    fn inbound_merge_is_idempotent(
        history in prop::collection::vec(arb_inbound(), 0..20),
        unit in arb_inbound(),
    ) {
        let list = build(&history);
        let once = reconcile(&list, Incoming::InboundSingle(unit.clone()), Some(CUSTOMER));
        let twice = reconcile(&once.messages, Incoming::InboundSingle(unit), Some(CUSTOMER));
        prop_assert_eq!(once.messages, twice.messages);
    }

    #[test]
    fn reconciled_lists_stay_sorted(units in prop::collection::vec(arb_inbound(), 0..30)) {
        let list = build(&units);
        prop_assert!(is_sorted(&list));

        let durable: Vec<_> = list.iter().filter_map(|m| m.id.durable()).collect();
        let unique: HashSet<_> = durable.iter().collect();
        prop_assert_eq!(durable.len(), unique.len());
    }

    #[test]
    fn authorship_depends_on_identity_only(
        author in "[a-z0-9-]{1,10}",
        name in "[A-Za-z ]{0,16}",
    ) {
        let unit = InboundMessage {
            id: "m-1".into(),
            author_id: Some(author.clone()),
            author_name: Some(name),
            body: "x".into(),
            created_at: at(0),
        };
        let out = reconcile(&[], Incoming::InboundSingle(unit), Some(CUSTOMER));
        let expected = if author == CUSTOMER { AuthorRole::Customer } else { AuthorRole::Agent };
        prop_assert_eq!(out.messages[0].author, expected);
    }

    #[test]
    fn customer_identity_wins_over_agent_looking_names(name in "(Support|Agent|Admin)[a-z ]{0,8}") {
        let unit = InboundMessage {
            id: "m-1".into(),
            author_id: Some(CUSTOMER.into()),
            author_name: Some(name),
            body: "x".into(),
            created_at: at(0),
        };
        let out = reconcile(&[], Incoming::InboundSingle(unit), Some(CUSTOMER));
        prop_assert_eq!(out.messages[0].author, AuthorRole::Customer);
        prop_assert_eq!(out.messages[0].status, None);
    }
}

// --- Confirmation order ---

proptest! {
    #[test]
    fn confirmation_and_echo_commute(
        body in "[a-zA-Z ]{1,20}",
        skew_ms in -30_000i64..30_000,
        accepted in any::<bool>(),
    ) {
        let draft = Message {
            id: MessageId::Provisional("temp-1".into()),
            author: AuthorRole::Agent,
            author_id: Some(AGENT.into()),
            author_name: Some("Agent".into()),
            body: body.clone(),
            created_at: at(0),
            status: Some(if accepted { DeliveryStatus::Sent } else { DeliveryStatus::NotSent }),
            read_at: None,
            client_ref: None,
        };
        let confirm = Incoming::PersistedConfirmation {
            provisional_id: "temp-1".into(),
            record: PersistedMessage {
                id: "m-500".into(),
                author_id: AGENT.into(),
                author_name: Some("Agent".into()),
                body: body.clone(),
                created_at: at(skew_ms),
                read_at: None,
            },
        };
        let echo = Incoming::InboundSingle(InboundMessage {
            id: "m-500".into(),
            author_id: Some(AGENT.into()),
            author_name: Some("Agent".into()),
            body,
            created_at: at(skew_ms),
        });
        let customer = Some(CUSTOMER);

        let start = reconcile(&[], Incoming::Draft(draft), customer).messages;
        let confirm_first = reconcile(
            &reconcile(&start, confirm.clone(), customer).messages,
            echo.clone(),
            customer,
        )
        .messages;
        let echo_first = reconcile(
            &reconcile(&start, echo, customer).messages,
            confirm,
            customer,
        )
        .messages;

        prop_assert_eq!(&confirm_first, &echo_first);
        prop_assert_eq!(confirm_first.len(), 1);
        prop_assert_eq!(confirm_first[0].id.as_str(), "m-500");
        prop_assert_eq!(confirm_first[0].status, Some(DeliveryStatus::Delivered));
    }
}

// --- Store-level model: status monotonicity and identity uniqueness ---

#[derive(Debug, Clone)]
enum Op {
    /// Agent writes a draft.
    Send,
    /// Transport accepted the nth draft.
    Accept(usize),
    /// Server stored the nth unstored draft (no notification yet).
    Persist(usize),
    /// Confirmation for the nth stored draft reaches the client.
    Confirm(usize),
    /// Transport echo of the nth stored draft.
    Echo(usize),
    Customer,
    Read,
    History,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Send),
        2 => any::<usize>().prop_map(Op::Accept),
        2 => any::<usize>().prop_map(Op::Persist),
        2 => any::<usize>().prop_map(Op::Confirm),
        2 => any::<usize>().prop_map(Op::Echo),
        1 => Just(Op::Customer),
        1 => Just(Op::Read),
        1 => Just(Op::History),
    ]
}

/// Server-side truth plus the client store it feeds.
struct Model {
    store: ConversationStore,
    clock: i64,
    drafts: Vec<Message>,
    server: Vec<PersistedMessage>,
    /// provisional id -> index into `server`
    stored: Vec<(String, usize)>,
    counter: u32,
}

impl Model {
    fn new() -> Self {
        let mut store = ConversationStore::default();
        store.cache_customer(&ConversationRecord {
            id: ROOM.into(),
            customer: Customer {
                id: CUSTOMER.into(),
                display_name: "Ana".into(),
            },
            channel: "web".into(),
            status: Default::default(),
            messages: Vec::new(),
        });
        Self {
            store,
            clock: 0,
            drafts: Vec::new(),
            server: Vec::new(),
            stored: Vec::new(),
            counter: 0,
        }
    }

    fn next(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    fn apply(&mut self, op: &Op) {
        self.clock += 4_000;
        match *op {
            Op::Send => {
                let n = self.next();
                let draft = Message {
                    id: MessageId::Provisional(format!("temp-{n}")),
                    author: AuthorRole::Agent,
                    author_id: Some(AGENT.into()),
                    author_name: Some("Agent".into()),
                    body: format!("message {n}"),
                    created_at: at(self.clock),
                    status: Some(DeliveryStatus::NotSent),
                    read_at: None,
                    client_ref: None,
                };
                self.drafts.push(draft.clone());
                self.store.apply(ROOM, Incoming::Draft(draft));
            }
            Op::Accept(k) => {
                if self.drafts.is_empty() {
                    return;
                }
                let provisional_id = self.drafts[k % self.drafts.len()].id.as_str().to_string();
                self.store
                    .apply_status(ROOM, &StatusUpdate::Sent { provisional_id });
            }
            Op::Persist(k) => {
                let stored: HashSet<&str> = self.stored.iter().map(|(p, _)| p.as_str()).collect();
                let pending: Vec<Message> = self
                    .drafts
                    .iter()
                    .filter(|d| !stored.contains(d.id.as_str()))
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    return;
                }
                let draft = &pending[k % pending.len()];
                let n = self.next();
                self.server.push(PersistedMessage {
                    id: format!("m-{n}"),
                    author_id: AGENT.into(),
                    author_name: Some("Agent".into()),
                    body: draft.body.clone(),
                    created_at: at(self.clock),
                    read_at: None,
                });
                self.stored
                    .push((draft.id.as_str().to_string(), self.server.len() - 1));
            }
            Op::Confirm(k) => {
                if self.stored.is_empty() {
                    return;
                }
                let (provisional_id, idx) = self.stored[k % self.stored.len()].clone();
                let record = self.server[idx].clone();
                self.store.apply(
                    ROOM,
                    Incoming::PersistedConfirmation {
                        provisional_id,
                        record,
                    },
                );
            }
            Op::Echo(k) => {
                if self.stored.is_empty() {
                    return;
                }
                let (_, idx) = self.stored[k % self.stored.len()].clone();
                let record = &self.server[idx];
                let echo = InboundMessage {
                    id: record.id.clone(),
                    author_id: Some(record.author_id.clone()),
                    author_name: record.author_name.clone(),
                    body: record.body.clone(),
                    created_at: record.created_at,
                };
                self.store.apply(ROOM, Incoming::InboundSingle(echo));
            }
            Op::Customer => {
                let n = self.next();
                let message = PersistedMessage {
                    id: format!("c-{n}"),
                    author_id: CUSTOMER.into(),
                    author_name: Some("Ana".into()),
                    body: format!("question {n}"),
                    created_at: at(self.clock),
                    read_at: None,
                };
                self.server.push(message.clone());
                self.store.apply(
                    ROOM,
                    Incoming::InboundSingle(InboundMessage {
                        id: message.id,
                        author_id: Some(message.author_id),
                        author_name: message.author_name,
                        body: message.body,
                        created_at: message.created_at,
                    }),
                );
            }
            Op::Read => {
                let read_at = at(self.clock);
                for message in self.server.iter_mut().filter(|m| m.author_id == AGENT) {
                    message.read_at.get_or_insert(read_at);
                }
                self.store.apply_status(
                    ROOM,
                    &StatusUpdate::ReadReceipt {
                        read_at: Some(read_at),
                    },
                );
            }
            Op::History => {
                self.store
                    .apply(ROOM, Incoming::InboundBatch(self.server.clone()));
            }
        }
    }
}

proptest! {
    #[test]
    fn store_invariants_hold_for_any_interleaving(ops in prop::collection::vec(arb_op(), 1..60)) {
        let mut model = Model::new();

        for op in &ops {
            model.apply(op);
            let messages = model.store.messages(ROOM);

            prop_assert!(is_sorted(messages), "unsorted after {:?}", op);

            let durable: Vec<_> = messages.iter().filter_map(|m| m.id.durable()).collect();
            let unique: HashSet<_> = durable.iter().collect();
            prop_assert_eq!(durable.len(), unique.len(), "duplicate durable id after {:?}", op);

            let superseded: HashSet<&str> = messages
                .iter()
                .filter(|m| m.id.durable().is_some())
                .filter_map(|m| m.client_ref.as_deref())
                .collect();
            for message in messages.iter().filter(|m| m.id.is_provisional()) {
                prop_assert!(
                    !superseded.contains(message.id.as_str()),
                    "{} coexists with its durable record after {:?}",
                    message.id,
                    op
                );
            }
        }

        let mut last: HashMap<&str, DeliveryStatus> = HashMap::new();
        for transition in model.store.tracker().transitions() {
            if let Some(from) = transition.from {
                prop_assert!(from <= transition.to, "{:?}", transition);
            }
            if let Some(previous) = last.insert(transition.lineage_key.as_str(), transition.to) {
                prop_assert!(previous <= transition.to, "{:?} after {:?}", transition, previous);
            }
        }
    }
}
