use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::changes::ChangeTracker;
use crate::config::SyncOptions;
use crate::conflict::ConflictResolver;
use crate::connection::{Command, ConnectionActor, EngineStats, FrameDecorator};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::metrics::SyncMetrics;
use crate::protocol::{Change, ChangeKind, FrameBody};
use crate::transport::Transport;

/// Command channel depth between the facade and the actor.
const COMMAND_CAPACITY: usize = 64;

/// Client-side synchronization engine.
///
/// The engine owns a single connection to the sync server, tracks local
/// changes until acknowledged, resolves conflicts against server changes, and
/// buffers outbound frames while disconnected. All state lives on a dedicated
/// actor task; this handle is cheap to share and every method is safe to call
/// from any task.
pub struct SyncEngine {
	commands: mpsc::Sender<Command>,
	events: Arc<EventBus>,
	metrics: Arc<SyncMetrics>,
	actor: Mutex<Option<JoinHandle<()>>>,
	opts: SyncOptions,
}

impl SyncEngine {
	/// Build an engine with the built-in conflict strategies and the default
	/// strategy named in `opts`. Fails on invalid options or an unknown
	/// strategy name.
	pub fn new(
		transport: impl Transport + 'static,
		client_id: impl Into<String>,
		opts: SyncOptions,
	) -> Result<Self, SyncError> {
		let resolver = ConflictResolver::new(&opts.conflict_strategy)?;
		Self::with_parts(transport, client_id, resolver, None, opts)
	}

	/// Build an engine with a caller-assembled resolver (custom strategies
	/// registered) and an optional outbound frame decorator.
	pub fn with_parts(
		transport: impl Transport + 'static,
		client_id: impl Into<String>,
		resolver: ConflictResolver,
		decorator: Option<FrameDecorator>,
		opts: SyncOptions,
	) -> Result<Self, SyncError> {
		opts.validate()?;

		let events = Arc::new(EventBus::new());
		let metrics = Arc::new(SyncMetrics::default());
		let tracker = ChangeTracker::new(client_id);

		let actor = ConnectionActor::new(
			Box::new(transport),
			tracker,
			resolver,
			events.clone(),
			metrics.clone(),
			decorator,
			opts.clone(),
		);
		let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
		let handle = tokio::spawn(actor.run(command_rx));

		Ok(Self {
			commands,
			events,
			metrics,
			actor: Mutex::new(Some(handle)),
			opts,
		})
	}

	/// Open the connection, waiting until it is established or the reconnect
	/// budget is exhausted.
	pub async fn connect(&self) -> Result<(), SyncError> {
		self.command(|done| Command::Connect { done }).await?
	}

	/// Close the connection without scheduling a reconnect.
	pub async fn disconnect(&self) -> Result<(), SyncError> {
		self.command(|done| Command::Disconnect { done }).await
	}

	/// Register a local mutation. Returns the assigned change id. The change
	/// is sent immediately when connected, otherwise it is retransmitted on
	/// the next reconnect; either way it stays pending until acknowledged.
	pub async fn add_change(
		&self,
		kind: ChangeKind,
		payload: Map<String, Value>,
	) -> Result<String, SyncError> {
		self.command(|done| Command::AddChange { kind, payload, done })
			.await
	}

	/// Send an arbitrary frame. Returns true when handed to the live
	/// transport, false when buffered (or dropped with offline mode off).
	pub async fn send(&self, body: FrameBody) -> Result<bool, SyncError> {
		self.command(|done| Command::SendFrame { body, done }).await
	}

	/// Supply the resolution for a conflict parked by the `manual` strategy.
	pub async fn resolve_manually(
		&self,
		conflict_id: impl Into<String>,
		chosen: Change,
	) -> Result<Change, SyncError> {
		let conflict_id = conflict_id.into();
		self.command(|done| Command::ResolveManually {
			conflict_id,
			chosen,
			done,
		})
		.await?
	}

	/// Request an immediate sync pass and wait for the server's batch, up to
	/// `force_sync_timeout`. Returns the number of server changes received;
	/// a server error report in the meantime fails the call.
	pub async fn force_sync(&self) -> Result<usize, SyncError> {
		let (tx, rx) = oneshot::channel::<Result<usize, SyncError>>();
		let slot = Mutex::new(Some(tx));
		let subscription = self.events.subscribe(move |event| {
			let outcome = match event {
				SyncEvent::Synced { changes, .. } => Ok(*changes),
				SyncEvent::ServerError { message, .. } => {
					Err(SyncError::Protocol(message.clone()))
				}
				_ => return,
			};
			if let Some(tx) = slot.lock().ok().and_then(|mut guard| guard.take()) {
				let _ = tx.send(outcome);
			}
		});

		let sent = self.command(|done| Command::RequestSync { done }).await;
		if let Err(e) = sent {
			self.events.unsubscribe(subscription);
			return Err(e);
		}

		let outcome = timeout(self.opts.force_sync_timeout, rx).await;
		self.events.unsubscribe(subscription);

		match outcome {
			Ok(Ok(Ok(changes))) => {
				debug!("force sync completed with {} changes", changes);
				Ok(changes)
			}
			Ok(Ok(Err(e))) => Err(e),
			_ => Err(SyncError::SyncTimeout(self.opts.force_sync_timeout)),
		}
	}

	/// Signal that the environment regained connectivity; a deferred
	/// reconnect resumes immediately.
	pub async fn handle_online(&self) -> Result<(), SyncError> {
		self.commands
			.send(Command::SetOnline { online: true })
			.await
			.map_err(|_| SyncError::Closed)
	}

	/// Signal that the environment lost connectivity; the connection drops
	/// and reconnect attempts are held until [`handle_online`](Self::handle_online).
	pub async fn handle_offline(&self) -> Result<(), SyncError> {
		self.commands
			.send(Command::SetOnline { online: false })
			.await
			.map_err(|_| SyncError::Closed)
	}

	/// Point-in-time engine statistics.
	pub async fn stats(&self) -> Result<EngineStats, SyncError> {
		self.command(|done| Command::Stats { done }).await
	}

	pub fn events(&self) -> &Arc<EventBus> {
		&self.events
	}

	pub fn metrics(&self) -> &Arc<SyncMetrics> {
		&self.metrics
	}

	/// Stop the actor task. Pending connect waiters observe `Closed`.
	pub async fn shutdown(self) {
		let _ = self.commands.send(Command::Shutdown).await;
		let actor = self.actor.lock().expect("engine lock poisoned").take();
		if let Some(handle) = actor {
			let _ = handle.await;
		}
	}

	async fn command<T>(
		&self,
		make: impl FnOnce(oneshot::Sender<T>) -> Command,
	) -> Result<T, SyncError> {
		let (tx, rx) = oneshot::channel();
		self.commands
			.send(make(tx))
			.await
			.map_err(|_| SyncError::Closed)?;
		rx.await.map_err(|_| SyncError::Closed)
	}
}
