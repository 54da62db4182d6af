//! Durable, message-driven sagas over a globally ordered message store.
//!
//! Ironsaga routes inbound messages to long-running saga instances, runs
//! pure saga logic against each instance, and persists the new state together
//! with the messages the saga produced:
//!
//! - **Pure saga logic**: [`Saga::handle_message`] maps data and a message
//!   to a [`Reaction`] with no side effects
//! - **Pluggable mapping**: [`DirectMapper`] reads the instance ID from the
//!   message, [`KeySetMapper`] routes through disjoint key sets
//! - **Pluggable persistence**: [`CrudPersister`] stores full instance data,
//!   [`EventSourcedPersister`] stores the events the saga publishes
//! - **Transactional outbox**: produced messages commit with the state change
//!   and are published by [`OutboxRelay`]s
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SagaMessageHandler<G, S, M, P>                      │
//! │                                                                         │
//! │   1. Decode the envelope into G::Message                                │
//! │   2. Map the message to an instance ID (M)                              │
//! │   3. Load the instance into a unit of work (P)                          │
//! │   4. handle_message(data, message) → reaction                           │
//! │   5. Save (or save and complete) under a revision check                 │
//! │   6. Update (or delete) the mapping                                     │
//! │   7. Enqueue produced messages to the outbox                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steps 3 to 7 share the caller's transaction. Concurrent handlers for one
//! instance race on the revision; the loser fails with a conflict and its
//! message is retried.
//!
//! # Example
//!
//! ```ignore
//! use ironsaga::{CrudPersister, DirectMapper, HasInstanceId, Reaction, Saga, SagaRuntime};
//!
//! #[derive(Deserialize, HasInstanceId)]
//! #[serde(tag = "type")]
//! #[instance_id(order_id)]
//! enum OrderMessage {
//!     OrderPlaced { order_id: String },
//!     OrderShipped { order_id: String },
//! }
//!
//! struct OrderSaga;
//!
//! impl Saga for OrderSaga {
//!     type Data = OrderState;
//!     type Message = OrderMessage;
//!     const PERSISTENCE_KEY: &'static str = "order";
//!     // ...
//! }
//!
//! let runtime = SagaRuntime::builder(MemoryStore::new())
//!     .register::<OrderSaga, _, _>(DirectMapper, CrudPersister)
//!     .build()?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: Enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

// Allow the crate to reference itself as `ironsaga` for macro-generated code
extern crate self as ironsaga;

mod envelope;
mod error;
pub mod handler;
pub mod mapper;
pub mod persistence;
mod projection;
pub mod runtime;
mod saga;
pub mod store;
mod stream;

pub use envelope::{Envelope, Message, MessageId, MessageKind};
pub use error::{Error, Result};
pub use handler::{HandleOutcome, SagaMessageHandler};
pub use mapper::{DirectMapper, InstanceMapper, KeySetMapper};
pub use nonempty::NonEmpty;
pub use persistence::{
    CrudPersister, EventSourcedPersister, Outbound, Persister, SaveOutcome, UnitOfWork,
};
pub use projection::{Projection, ProjectionConfig, ProjectionWorker};
pub use runtime::{
    Acknowledgement, InboundDelivery, InboundPipeline, OutboxRelay, RetryPolicy, RuntimeConfig,
    SagaRuntime, SagaRuntimeBuilder, Transport,
};
pub use saga::{
    EventSourcedSaga, HasInstanceId, InstanceId, KeySetSaga, MessageTypes, Outgoing, Reaction,
    Saga, SagaInstance,
};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{
    DeadLetter, DeadLetterQuery, InstanceRepository, KeySetRepository, MemoryStore, MessageStore,
    OutboxRepository, ProjectionStore, SnapshotRepository, Store, StreamRecord, Transaction,
};
pub use stream::{Stream, StreamConfig};

// Re-export derive macros
pub use ironsaga_macros::HasInstanceId;
