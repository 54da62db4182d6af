//! Runtime for processing inbound messages and relaying outbound ones.
//!
//! - [`SagaRuntime`]: Main coordinator that runs the inbound pipeline and outbox relays
//! - [`SagaRuntimeBuilder`]: Builder for registering sagas and configuring the runtime
//! - [`InboundPipeline`]: Routes each inbound message to the sagas that declare it
//! - [`OutboxRelay`]: Publishes outbox messages through a [`Transport`]
//! - [`RuntimeConfig`]: Configuration for concurrency, polling, timeouts and retries
//!
//! # Example
//!
//! ```ignore
//! use ironsaga::runtime::{RuntimeConfig, SagaRuntime};
//!
//! let runtime = SagaRuntime::builder(store)
//!     .register::<OrderSaga, _, _>(DirectMapper, CrudPersister)
//!     .register::<ShippingSaga, _, _>(KeySetMapper, EventSourcedPersister::new())
//!     .config(RuntimeConfig::default())
//!     .build()?;
//!
//! runtime.run(deliveries, transport, shutdown_signal).await?;
//! ```

mod config;
mod outbox_relay;
pub(crate) mod pipeline;
mod registry;
mod retry;

pub use config::RuntimeConfig;
pub use outbox_relay::{OutboxRelay, Transport};
pub use pipeline::{Acknowledgement, InboundDelivery, InboundPipeline};
pub use registry::{SagaRuntime, SagaRuntimeBuilder};
pub use retry::RetryPolicy;
