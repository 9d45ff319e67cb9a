//! Replica-side consumer core for the Database Change Protocol.
//!
//! A [`consumer::DcpConsumer`] receives a live stream of mutations from a
//! primary for a set of partitions. For each partition it negotiates a
//! start point against the branching failover history, receives ordered
//! snapshots of mutations, buffers them against memory pressure, applies
//! them through the storage bridge, and cooperates with the producer via
//! windowed flow control and noop liveness checks.
//!
//! Transport framing, authentication, and the storage engine itself are the
//! host's business; the crate reaches them only through the traits in
//! [`engine`] and [`producers`].

#![forbid(unsafe_code)]

pub mod config;
pub mod consumer;
pub mod control;
pub mod engine;
pub mod error;
pub mod executor;
pub mod failover;
pub mod flow_control;
pub mod message;
pub mod metrics;
pub mod opaque;
mod processor;
pub mod producers;
pub mod stream;
pub mod wire;

pub use config::{Config, ConfigError};
pub use consumer::{ConsumerHandles, ConsumerStats, DcpConsumer};
pub use engine::{
    ConnectionNotifier, EngineBridge, HostAllocScope, MemoryTracker, NullNotifier, NullTracker,
    RollbackStatus, SnapshotInfo, SnapshotPriority, SnapshotRange, StoreError, VBucket,
};
pub use error::{DcpError, EngineResult, ProcessResult, StepOutcome};
pub use executor::{Task, TaskControl, TaskId, TaskPool, TaskPools};
pub use failover::{FailoverEntry, FailoverTable};
pub use flow_control::FlowControl;
pub use message::{
    DcpMessage, MarkerFlags, MutationKind, MutationPayload, StreamEndReason, VBucketState, Vbid,
};
pub use producers::MessageProducers;
pub use stream::{PassiveStream, SnapshotType, StreamState, StreamStats};
pub use wire::{ProducerResponse, ResponseOpcode, ResponseStatus, WireError};
