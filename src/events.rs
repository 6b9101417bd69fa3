use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, trace};

use crate::conflict::Conflict;
use crate::protocol::Change;

/// Typed engine events fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
	/// The connection reached `Connected`; `epoch` increments per connect.
	Connected { epoch: u64 },
	/// Explicit disconnect completed.
	Disconnected,
	/// A reconnect attempt has been scheduled.
	Reconnecting { attempt: u32 },
	/// Reconnect attempts are exhausted; the connection is `Failed`.
	ConnectionFailed { attempts: u32 },
	/// The environment signalled connectivity loss or recovery.
	Online,
	Offline,
	/// A server change with no pending local counterpart was applied.
	ChangeApplied { change: Change },
	/// The server acknowledged a local change.
	ChangeAcked { change_id: String },
	/// A server change collided with a pending local change.
	ConflictDetected { conflict: Conflict },
	/// A conflict was resolved (automatically or manually).
	ConflictResolved {
		conflict_id: String,
		resolution: Change,
	},
	/// The `manual` strategy requires a caller-supplied resolution.
	ManualConflict { conflict: Conflict },
	/// A server `sync` batch for the current epoch was processed.
	Synced { epoch: u64, changes: usize },
	/// The server reported an error; connection state is unaffected.
	ServerError { message: String, code: String },
	/// A bounded queue evicted an item or frame.
	ItemDropped { item_id: String },
	OfflineFrameDropped { frame_type: &'static str },
	/// A queue item exhausted its retry budget.
	ItemFailed { item_id: String, attempts: u32 },
}

impl SyncEvent {
	/// Short event name, for logging.
	pub fn name(&self) -> &'static str {
		match self {
			SyncEvent::Connected { .. } => "connected",
			SyncEvent::Disconnected => "disconnected",
			SyncEvent::Reconnecting { .. } => "reconnecting",
			SyncEvent::ConnectionFailed { .. } => "connection_failed",
			SyncEvent::Online => "online",
			SyncEvent::Offline => "offline",
			SyncEvent::ChangeApplied { .. } => "change_applied",
			SyncEvent::ChangeAcked { .. } => "change_acked",
			SyncEvent::ConflictDetected { .. } => "conflict_detected",
			SyncEvent::ConflictResolved { .. } => "conflict_resolved",
			SyncEvent::ManualConflict { .. } => "manual_conflict",
			SyncEvent::Synced { .. } => "synced",
			SyncEvent::ServerError { .. } => "server_error",
			SyncEvent::ItemDropped { .. } => "item_dropped",
			SyncEvent::OfflineFrameDropped { .. } => "offline_frame_dropped",
			SyncEvent::ItemFailed { .. } => "item_failed",
		}
	}
}

/// Handle returned by [`EventBus::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = std::sync::Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Synchronous fan-out bus. Listeners run in subscription order; a panicking
/// listener is caught and logged so later listeners still receive the event.
#[derive(Default)]
pub struct EventBus {
	listeners: Mutex<Vec<(u64, Listener)>>,
	next_id: AtomicU64,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a listener; returns the id used to unsubscribe.
	pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
	where
		F: Fn(&SyncEvent) + Send + Sync + 'static,
	{
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let mut listeners = self.listeners.lock().expect("event bus lock poisoned");
		listeners.push((id, std::sync::Arc::new(listener)));
		SubscriptionId(id)
	}

	/// Remove a listener. Unknown ids are ignored.
	pub fn unsubscribe(&self, id: SubscriptionId) {
		let mut listeners = self.listeners.lock().expect("event bus lock poisoned");
		listeners.retain(|(lid, _)| *lid != id.0);
	}

	/// Number of active subscriptions.
	pub fn len(&self) -> usize {
		self.listeners.lock().expect("event bus lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Deliver an event to every listener, in subscription order.
	pub fn emit(&self, event: &SyncEvent) {
		trace!("emit event: {}", event.name());

		// Snapshot under the lock so listeners may subscribe/unsubscribe
		// reentrantly without deadlocking.
		let snapshot: Vec<Listener> = {
			let listeners = self.listeners.lock().expect("event bus lock poisoned");
			listeners.iter().map(|(_, l)| l.clone()).collect()
		};

		for listener in snapshot {
			if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
				let msg = panic
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| panic.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "non-string panic".to_string());
				error!("listener panicked on {}: {}", event.name(), msg);
			}
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn test_delivery_in_subscription_order() {
		let bus = EventBus::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for tag in ["first", "second", "third"] {
			let order = order.clone();
			bus.subscribe(move |_| order.lock().unwrap().push(tag));
		}

		bus.emit(&SyncEvent::Disconnected);
		assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
	}

	#[test]
	fn test_panicking_listener_is_isolated() {
		let bus = EventBus::new();
		let delivered = Arc::new(AtomicUsize::new(0));

		bus.subscribe(|_| panic!("listener blew up"));
		let counter = delivered.clone();
		bus.subscribe(move |_| {
			counter.fetch_add(1, Ordering::Relaxed);
		});

		bus.emit(&SyncEvent::Disconnected);
		assert_eq!(delivered.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn test_unsubscribe_stops_delivery() {
		let bus = EventBus::new();
		let count = Arc::new(AtomicUsize::new(0));

		let counter = count.clone();
		let id = bus.subscribe(move |_| {
			counter.fetch_add(1, Ordering::Relaxed);
		});

		bus.emit(&SyncEvent::Disconnected);
		bus.unsubscribe(id);
		bus.emit(&SyncEvent::Disconnected);

		assert_eq!(count.load(Ordering::Relaxed), 1);
		assert!(bus.is_empty());
	}
}
