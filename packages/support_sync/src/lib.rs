//! Message synchronization core for support chat.
//!
//! Keeps a locally consistent view of each conversation's messages and their
//! delivery status, merging three unordered sources: optimistic local drafts,
//! real-time transport pushes, and authoritative persistence fetches.
//!
//! Layering, leaves first:
//!
//! - [`gateway`]: persistence service access
//! - [`transport`]: WebSocket connection actor
//! - [`reconciler`]: pure merge/dedup of one incoming unit into a message list
//! - [`store`]: process-wide state, mutated only through reconciler output
//! - [`status`]: delivery status progression and its transition log
//! - [`session`]: the sequential queue wiring all of the above

pub mod config;
pub mod error;
pub mod gateway;
pub mod reconciler;
pub mod session;
pub mod status;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{AgentConfig, GatewayConfig, SyncConfig, TransportConfig};
pub use error::{GatewayError, SyncError, TransportError};
pub use gateway::{HttpGateway, PersistenceGateway};
pub use reconciler::{InboundMessage, Incoming, MergeOutcome, Reconciled, reconcile, resolve_author};
pub use session::{SessionCommand, SessionHandle, SessionInput, SyncSession, connect, spawn_session};
pub use status::{StatusTracker, StatusTransition, StatusUpdate};
pub use store::{ConversationStore, StoreEvent};
pub use transport::{ConnectionState, TransportConnection, TransportControl, TransportEvent, TransportHandle};
pub use types::{
    AuthorRole, Conversation, ConversationRecord, ConversationStatus, ConversationSummary, Customer,
    DeliveryStatus, Message, MessageId, PersistedMessage,
};
