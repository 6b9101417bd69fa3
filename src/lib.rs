//! Bifrost Sync: a client-side real-time synchronization engine.
//!
//! The engine keeps a durable link to a sync server, tracks local changes
//! until the server acknowledges them, resolves conflicts with pluggable
//! strategies, and buffers outbound frames while disconnected. A separate
//! priority work queue batches and retries application-defined jobs.
//!
//! ```no_run
//! use bifrost_sync::{SyncEngine, SyncOptions, TcpTransport};
//!
//! # async fn demo() -> Result<(), bifrost_sync::SyncError> {
//! let transport = TcpTransport::new("127.0.0.1:9400");
//! let engine = SyncEngine::new(transport, "client-1", SyncOptions::default())?;
//! engine.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod changes;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod offline;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use config::{Settings, SyncOptions};
pub use conflict::{Conflict, ConflictResolver, Resolution};
pub use connection::{ConnectionState, EngineStats, FrameDecorator};
pub use engine::SyncEngine;
pub use error::{SyncError, TransportError};
pub use events::{EventBus, SubscriptionId, SyncEvent};
pub use metrics::SyncMetrics;
pub use offline::OverflowPolicy;
pub use protocol::{Change, ChangeKind, Frame, FrameBody};
pub use queue::{Priority, QueueItem, QueueOptions, QueueProcessor, SyncQueueManager};
pub use transport::{TcpTransport, Transport, TransportConn};
