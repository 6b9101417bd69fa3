use std::time::Duration;

use thiserror::Error;

/// Errors raised by a transport implementation. All of these are non-fatal
/// to the engine: they drive the reconnect backoff.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("transport closed")]
	Closed,

	#[error("frame size {size} exceeds maximum {max}")]
	FrameTooLarge { size: usize, max: usize },

	#[error("frame codec error: {0}")]
	Codec(#[from] serde_json::Error),
}

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("unknown conflict strategy: {0}")]
	UnknownStrategy(String),

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("connection failed after {0} attempts")]
	ConnectFailed(u32),

	#[error("sync did not complete within {0:?}")]
	SyncTimeout(Duration),

	#[error("unknown conflict id: {0}")]
	UnknownConflict(String),

	#[error("engine is shut down")]
	Closed,
}
