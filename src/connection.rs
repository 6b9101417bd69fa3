use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::changes::ChangeTracker;
use crate::config::SyncOptions;
use crate::conflict::{Conflict, ConflictResolver};
use crate::error::{SyncError, TransportError};
use crate::events::{EventBus, SyncEvent};
use crate::metrics::SyncMetrics;
use crate::offline::{OfflineQueue, PushOutcome};
use crate::protocol::{Change, ChangeKind, Frame, FrameBody, now_millis};
use crate::transport::{Transport, TransportConn};

/// Connection lifecycle states. Exactly one connection exists per engine;
/// only the actor task mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Connecting,
	Connected,
	Reconnecting,
	Disconnecting,
	Disconnected,
	/// Reconnect attempts exhausted; terminal until an explicit `connect()`.
	Failed,
}

impl ConnectionState {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionState::Idle => "idle",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
			ConnectionState::Disconnecting => "disconnecting",
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Failed => "failed",
		}
	}
}

impl std::fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Hook applied to every outbound frame before send, e.g. to attach
/// authentication metadata. Token handling itself is external.
pub type FrameDecorator = Arc<dyn Fn(&mut Frame) + Send + Sync>;

/// Snapshot returned by `SyncEngine::stats`.
#[derive(Debug, Clone)]
pub struct EngineStats {
	pub state: ConnectionState,
	pub is_connected: bool,
	pub epoch: u64,
	pub pending_changes: usize,
	/// Conflicts parked for manual resolution.
	pub open_conflicts: usize,
	pub offline_queue_depth: usize,
}

/// Commands from the engine facade to the actor task.
pub(crate) enum Command {
	Connect {
		done: oneshot::Sender<Result<(), SyncError>>,
	},
	Disconnect {
		done: oneshot::Sender<()>,
	},
	AddChange {
		kind: ChangeKind,
		payload: Map<String, Value>,
		done: oneshot::Sender<String>,
	},
	SendFrame {
		body: FrameBody,
		done: oneshot::Sender<bool>,
	},
	RequestSync {
		done: oneshot::Sender<bool>,
	},
	ResolveManually {
		conflict_id: String,
		chosen: Change,
		done: oneshot::Sender<Result<Change, SyncError>>,
	},
	SetOnline {
		online: bool,
	},
	Stats {
		done: oneshot::Sender<EngineStats>,
	},
	Shutdown,
}

enum SendResult {
	Sent,
	Full,
	Closed,
}

/// The coordinating task. All mutation of the connection, the pending-change
/// set, and the offline buffer happens here, serialized over the command
/// channel: the inbound-frame path and the outbound-enqueue path can never
/// race.
pub(crate) struct ConnectionActor {
	opts: SyncOptions,
	transport: Box<dyn Transport>,
	state: ConnectionState,
	conn: Option<TransportConn>,
	epoch: u64,
	reconnect_attempt: u32,
	/// Environment connectivity signal; retries are suppressed while false.
	online: bool,
	explicit_disconnect: bool,
	tracker: ChangeTracker,
	resolver: ConflictResolver,
	offline: OfflineQueue,
	events: Arc<EventBus>,
	metrics: Arc<SyncMetrics>,
	decorator: Option<FrameDecorator>,
	/// Server-side timestamp of the last processed sync batch.
	last_sync_time: u64,
	// Timer deadlines; None means cancelled. Every state transition that
	// invalidates a timer clears its field, so a stale deadline can never
	// fire against a new connection epoch.
	heartbeat_due: Option<Instant>,
	heartbeat_deadline: Option<Instant>,
	retry_at: Option<Instant>,
	connect_waiters: Vec<oneshot::Sender<Result<(), SyncError>>>,
}

impl ConnectionActor {
	pub(crate) fn new(
		transport: Box<dyn Transport>,
		tracker: ChangeTracker,
		resolver: ConflictResolver,
		events: Arc<EventBus>,
		metrics: Arc<SyncMetrics>,
		decorator: Option<FrameDecorator>,
		opts: SyncOptions,
	) -> Self {
		let offline = OfflineQueue::new(opts.offline_buffer_size, opts.overflow_policy);
		Self {
			opts,
			transport,
			state: ConnectionState::Idle,
			conn: None,
			epoch: 0,
			reconnect_attempt: 0,
			online: true,
			explicit_disconnect: false,
			tracker,
			resolver,
			offline,
			events,
			metrics,
			decorator,
			last_sync_time: 0,
			heartbeat_due: None,
			heartbeat_deadline: None,
			retry_at: None,
			connect_waiters: Vec::new(),
		}
	}

	pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
		loop {
			// Disabled timers park on a far-future deadline behind a guard.
			let far = Instant::now() + Duration::from_secs(86_400);
			let heartbeat_due = self.heartbeat_due.unwrap_or(far);
			let heartbeat_deadline = self.heartbeat_deadline.unwrap_or(far);
			let retry_at = self.retry_at.unwrap_or(far);

			tokio::select! {
				cmd = commands.recv() => match cmd {
					None | Some(Command::Shutdown) => {
						self.teardown();
						break;
					}
					Some(cmd) => self.handle_command(cmd).await,
				},
				inbound = recv_inbound(&mut self.conn), if self.conn.is_some() => {
					self.handle_inbound(inbound);
				}
				_ = sleep_until(heartbeat_due), if self.heartbeat_due.is_some() => {
					self.on_heartbeat_tick();
				}
				_ = sleep_until(heartbeat_deadline), if self.heartbeat_deadline.is_some() => {
					self.on_heartbeat_timeout();
				}
				_ = sleep_until(retry_at), if self.retry_at.is_some() => {
					self.try_connect().await;
				}
			}
		}
		info!("connection actor stopped");
	}

	async fn handle_command(&mut self, cmd: Command) {
		match cmd {
			Command::Connect { done } => match self.state {
				ConnectionState::Connected => {
					let _ = done.send(Ok(()));
				}
				ConnectionState::Connecting | ConnectionState::Reconnecting => {
					self.connect_waiters.push(done);
				}
				_ => {
					self.connect_waiters.push(done);
					self.reconnect_attempt = 0;
					self.explicit_disconnect = false;
					self.try_connect().await;
				}
			},
			Command::Disconnect { done } => {
				self.disconnect();
				let _ = done.send(());
			}
			Command::AddChange { kind, payload, done } => {
				let change = self.tracker.add_change(kind, payload);
				self.metrics.changes_tracked.fetch_add(1, Ordering::Relaxed);
				let _ = done.send(change.id.clone());
				self.dispatch(Frame::new(FrameBody::Change(change)));
			}
			Command::SendFrame { body, done } => {
				let sent = self.dispatch(Frame::new(body));
				let _ = done.send(sent);
			}
			Command::RequestSync { done } => {
				let sent = self.dispatch(Frame::new(FrameBody::SyncRequest {
					last_sync_time: self.last_sync_time,
				}));
				let _ = done.send(sent);
			}
			Command::ResolveManually {
				conflict_id,
				chosen,
				done,
			} => {
				let result = self.resolver.resolve_manually(&conflict_id, chosen);
				match result {
					Ok(resolution) => {
						self.finish_resolution(conflict_id, resolution.clone());
						let _ = done.send(Ok(resolution));
					}
					Err(e) => {
						let _ = done.send(Err(e));
					}
				}
			}
			Command::SetOnline { online } => self.set_online(online),
			Command::Stats { done } => {
				let _ = done.send(EngineStats {
					state: self.state,
					is_connected: self.state == ConnectionState::Connected,
					epoch: self.epoch,
					pending_changes: self.tracker.len(),
					open_conflicts: self.resolver.open_conflicts(),
					offline_queue_depth: self.offline.len(),
				});
			}
			// Matched in the run loop before dispatch.
			Command::Shutdown => {}
		}
	}

	// ---- connection lifecycle ------------------------------------------

	async fn try_connect(&mut self) {
		self.state = ConnectionState::Connecting;
		self.retry_at = None;
		debug!("opening transport (attempt {})", self.reconnect_attempt + 1);

		match self.transport.open().await {
			Ok(conn) => {
				self.conn = Some(conn);
				self.on_connected();
			}
			Err(e) => {
				warn!("transport open failed: {}", e);
				self.on_open_failed();
			}
		}
	}

	fn on_connected(&mut self) {
		self.state = ConnectionState::Connected;
		self.epoch += 1;
		self.reconnect_attempt = 0;
		self.explicit_disconnect = false;
		self.retry_at = None;
		self.heartbeat_deadline = None;
		self.heartbeat_due = Some(Instant::now() + self.opts.heartbeat_interval);
		info!("connected (epoch {})", self.epoch);

		for waiter in self.connect_waiters.drain(..) {
			let _ = waiter.send(Ok(()));
		}
		self.events.emit(&SyncEvent::Connected { epoch: self.epoch });

		// Flush buffered frames in arrival order. Buffered change frames
		// whose id is still pending are skipped: the ordered retransmission
		// below supersedes them, keeping delivery exactly-once.
		for frame in self.offline.drain() {
			if let FrameBody::Change(change) = &frame.body {
				if self.tracker.is_pending(&change.id) {
					continue;
				}
			}
			match self.send_live(frame) {
				SendResult::Sent | SendResult::Full => {}
				SendResult::Closed => {
					self.on_link_down();
					return;
				}
			}
		}

		for change in self.tracker.retransmit_set() {
			debug!("retransmitting change {} v{}", change.id, change.version);
			match self.send_live(Frame::new(FrameBody::Change(change))) {
				SendResult::Sent | SendResult::Full => {}
				SendResult::Closed => {
					self.on_link_down();
					return;
				}
			}
		}
	}

	fn on_open_failed(&mut self) {
		self.conn = None;
		self.reconnect_attempt += 1;

		if self.reconnect_attempt >= self.opts.reconnect_attempts {
			error!(
				"connection failed after {} attempts; giving up until connect() is called again",
				self.reconnect_attempt
			);
			self.state = ConnectionState::Failed;
			self.clear_timers();
			let attempts = self.reconnect_attempt;
			for waiter in self.connect_waiters.drain(..) {
				let _ = waiter.send(Err(SyncError::ConnectFailed(attempts)));
			}
			self.events.emit(&SyncEvent::ConnectionFailed { attempts });
			return;
		}

		self.enter_reconnecting(self.backoff_delay());
	}

	/// Unexpected link loss while connected (transport close or heartbeat
	/// timeout). Explicit disconnects never arrive here.
	fn on_link_down(&mut self) {
		if self.explicit_disconnect
			|| matches!(
				self.state,
				ConnectionState::Disconnected | ConnectionState::Idle | ConnectionState::Failed
			) {
			return;
		}
		warn!("connection lost");
		self.conn = None;
		self.heartbeat_due = None;
		self.heartbeat_deadline = None;
		self.enter_reconnecting(self.opts.reconnect_delay.min(self.opts.max_reconnect_delay));
	}

	fn enter_reconnecting(&mut self, delay: Duration) {
		self.state = ConnectionState::Reconnecting;
		self.metrics.reconnections.fetch_add(1, Ordering::Relaxed);
		self.retry_at = if self.online {
			debug!("reconnecting in {:?}", delay);
			Some(Instant::now() + delay)
		} else {
			// Offline environment: hold the retry until handle_online.
			debug!("offline; reconnect deferred until connectivity returns");
			None
		};
		self.events.emit(&SyncEvent::Reconnecting {
			attempt: self.reconnect_attempt,
		});
	}

	fn backoff_delay(&self) -> Duration {
		let attempt = self.reconnect_attempt.max(1);
		let scaled = self.opts.reconnect_delay.saturating_mul(attempt);
		scaled.min(self.opts.max_reconnect_delay)
	}

	fn disconnect(&mut self) {
		if self.state == ConnectionState::Disconnected {
			return;
		}
		self.state = ConnectionState::Disconnecting;
		self.explicit_disconnect = true;
		self.conn = None;
		self.clear_timers();
		self.state = ConnectionState::Disconnected;
		info!("disconnected");
		self.events.emit(&SyncEvent::Disconnected);
	}

	fn set_online(&mut self, online: bool) {
		if online == self.online {
			return;
		}
		self.online = online;

		if online {
			info!("environment reports online");
			self.events.emit(&SyncEvent::Online);
			if self.state == ConnectionState::Reconnecting
				&& self.retry_at.is_none()
				&& !self.explicit_disconnect
			{
				self.retry_at = Some(Instant::now());
			}
		} else {
			info!("environment reports offline");
			self.events.emit(&SyncEvent::Offline);
			if self.state == ConnectionState::Connected {
				self.conn = None;
				self.heartbeat_due = None;
				self.heartbeat_deadline = None;
				self.enter_reconnecting(self.opts.reconnect_delay);
			} else {
				// Suspend any pending retry until connectivity returns.
				self.retry_at = None;
			}
		}
	}

	fn clear_timers(&mut self) {
		self.heartbeat_due = None;
		self.heartbeat_deadline = None;
		self.retry_at = None;
	}

	fn teardown(&mut self) {
		self.conn = None;
		self.clear_timers();
		for waiter in self.connect_waiters.drain(..) {
			let _ = waiter.send(Err(SyncError::Closed));
		}
	}

	// ---- heartbeat ------------------------------------------------------

	fn on_heartbeat_tick(&mut self) {
		self.heartbeat_due = Some(Instant::now() + self.opts.heartbeat_interval);
		if self.heartbeat_deadline.is_none() {
			self.heartbeat_deadline = Some(Instant::now() + self.opts.heartbeat_timeout);
		}
		let frame = Frame::new(FrameBody::Heartbeat {
			timestamp: now_millis(),
		});
		if let SendResult::Closed = self.send_live(frame) {
			self.on_link_down();
		}
	}

	/// No heartbeat response within the window: treat the link as dead even
	/// though the transport has not reported an error. This bounds detection
	/// latency for silent failures such as NAT timeouts.
	fn on_heartbeat_timeout(&mut self) {
		warn!("heartbeat response missing; forcing reconnect");
		self.metrics.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
		self.on_link_down();
	}

	// ---- outbound -------------------------------------------------------

	/// Send live when connected, otherwise buffer. A given frame goes to
	/// exactly one of the two destinations. Returns true when handed to the
	/// live transport.
	fn dispatch(&mut self, frame: Frame) -> bool {
		if self.state == ConnectionState::Connected && self.conn.is_some() {
			match self.send_live(frame) {
				SendResult::Sent => return true,
				SendResult::Full => return false,
				SendResult::Closed => {
					self.on_link_down();
					return false;
				}
			}
		}
		self.buffer_frame(frame);
		false
	}

	fn send_live(&mut self, mut frame: Frame) -> SendResult {
		let Some(conn) = self.conn.as_ref() else {
			return SendResult::Closed;
		};
		if let Some(decorate) = &self.decorator {
			decorate(&mut frame);
		}

		match conn.outbound.try_send(frame) {
			Ok(()) => {
				self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
				SendResult::Sent
			}
			Err(mpsc::error::TrySendError::Full(frame)) => {
				warn!("outbound channel full; dropping {} frame", frame.body.type_name());
				SendResult::Full
			}
			Err(mpsc::error::TrySendError::Closed(_)) => SendResult::Closed,
		}
	}

	fn buffer_frame(&mut self, frame: Frame) {
		if !self.opts.enable_offline_mode {
			// Pending changes survive in the tracker and are retransmitted
			// on reconnect; everything else is dropped by configuration.
			debug!(
				"offline mode disabled; not buffering {} frame",
				frame.body.type_name()
			);
			return;
		}

		let frame_type = frame.body.type_name();
		match self.offline.push(frame) {
			PushOutcome::Buffered => {
				self.metrics.offline_buffered.fetch_add(1, Ordering::Relaxed);
			}
			PushOutcome::Evicted(old) => {
				self.metrics.offline_buffered.fetch_add(1, Ordering::Relaxed);
				self.metrics.offline_dropped.fetch_add(1, Ordering::Relaxed);
				self.events.emit(&SyncEvent::OfflineFrameDropped {
					frame_type: old.body.type_name(),
				});
			}
			PushOutcome::Rejected(_) => {
				self.metrics.offline_dropped.fetch_add(1, Ordering::Relaxed);
				self.events
					.emit(&SyncEvent::OfflineFrameDropped { frame_type });
			}
		}
	}

	// ---- inbound --------------------------------------------------------

	fn handle_inbound(&mut self, item: Option<Result<Frame, TransportError>>) {
		match item {
			None => self.on_link_down(),
			Some(Err(e)) => {
				// Malformed frames never affect connection state.
				warn!("protocol error on inbound frame: {}", e);
				self.events.emit(&SyncEvent::ServerError {
					message: e.to_string(),
					code: "protocol".to_string(),
				});
			}
			Some(Ok(frame)) => {
				self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
				self.route_frame(frame);
			}
		}
	}

	fn route_frame(&mut self, frame: Frame) {
		match frame.body {
			FrameBody::Sync { changes } => {
				let count = changes.len();
				debug!("sync batch of {} server changes", count);
				for server_change in changes {
					self.apply_server_change(server_change);
				}
				self.last_sync_time = frame.timestamp;
				self.dispatch(Frame::new(FrameBody::SyncAck {
					received_changes: count as u64,
					change_ids: Vec::new(),
				}));
				self.events.emit(&SyncEvent::Synced {
					epoch: self.epoch,
					changes: count,
				});
			}
			FrameBody::SyncAck { change_ids, .. } => {
				for change_id in change_ids {
					if self.tracker.ack(&change_id) {
						self.metrics.changes_acked.fetch_add(1, Ordering::Relaxed);
						self.events.emit(&SyncEvent::ChangeAcked { change_id });
					} else {
						// Redelivered ack for an already-removed change.
						debug!("duplicate ack for {}; ignored", change_id);
					}
				}
			}
			FrameBody::Conflict {
				client_change,
				server_change,
			} => self.on_conflict(client_change, server_change),
			FrameBody::HeartbeatResponse { .. } => {
				self.heartbeat_deadline = None;
			}
			FrameBody::Heartbeat { timestamp } => {
				// Server-initiated probe; answer in kind.
				self.dispatch(Frame::new(FrameBody::HeartbeatResponse { timestamp }));
			}
			FrameBody::Error { message, code } => {
				warn!("server error {}: {}", code, message);
				self.events.emit(&SyncEvent::ServerError { message, code });
			}
			other => {
				warn!("unexpected inbound frame type {}", other.type_name());
				self.events.emit(&SyncEvent::ServerError {
					message: format!("unexpected inbound frame type {}", other.type_name()),
					code: "protocol".to_string(),
				});
			}
		}
	}

	fn apply_server_change(&mut self, server_change: Change) {
		match self.tracker.get(&server_change.id).cloned() {
			Some(client_change) => self.on_conflict(client_change, server_change),
			None => {
				self.events.emit(&SyncEvent::ChangeApplied {
					change: server_change,
				});
			}
		}
	}

	fn on_conflict(&mut self, client_change: Change, server_change: Change) {
		self.metrics.conflicts_detected.fetch_add(1, Ordering::Relaxed);
		let conflict = Conflict::new(client_change, server_change);
		let conflict_id = conflict.id.clone();
		let change_id = conflict.client_change.id.clone();
		info!("conflict {} detected on change {}", conflict_id, change_id);
		self.events.emit(&SyncEvent::ConflictDetected {
			conflict: conflict.clone(),
		});

		match self.resolver.resolve(conflict.clone(), None) {
			Ok(Some(resolution)) => self.finish_resolution(conflict_id, resolution),
			Ok(None) => {
				// Manual strategy: halt this change until the caller
				// supplies a resolution.
				self.tracker.hold(&change_id);
				self.events.emit(&SyncEvent::ManualConflict { conflict });
			}
			// Unreachable for built-ins: strategy names are validated at
			// construction.
			Err(e) => error!("conflict resolution failed: {}", e),
		}
	}

	fn finish_resolution(&mut self, conflict_id: String, resolution: Change) {
		self.metrics.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
		self.tracker.supersede(resolution.clone());
		self.dispatch(Frame::new(FrameBody::ConflictResolved {
			conflict_id: conflict_id.clone(),
			resolved_change: resolution.clone(),
		}));
		self.events.emit(&SyncEvent::ConflictResolved {
			conflict_id,
			resolution,
		});
	}
}

async fn recv_inbound(
	conn: &mut Option<TransportConn>,
) -> Option<Result<Frame, TransportError>> {
	match conn.as_mut() {
		Some(c) => c.inbound.recv().await,
		None => std::future::pending().await,
	}
}
