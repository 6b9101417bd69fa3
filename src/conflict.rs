use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::protocol::{Change, ChangeKind, now_millis};

/// Resolved conflicts retained for inspection before the oldest are evicted.
const RESOLVED_HISTORY_LIMIT: usize = 64;

/// A local change whose id collided with a server-originated change before
/// acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
	pub id: String,
	pub client_change: Change,
	/// Server-authoritative counterpart, same shape as a local change.
	pub server_change: Change,
	pub detected_at: u64,
	pub resolved: bool,
	pub resolution: Option<Change>,
}

impl Conflict {
	pub fn new(client_change: Change, server_change: Change) -> Self {
		let id = format!("cf-{}", client_change.id);
		Self {
			id,
			client_change,
			server_change,
			detected_at: now_millis(),
			resolved: false,
			resolution: None,
		}
	}
}

/// Outcome of running a strategy against a conflict.
pub enum Resolution {
	/// The strategy produced a resolved change to send back.
	Resolved(Change),
	/// No automatic resolution; the caller must supply one.
	Manual,
}

type StrategyFn = Arc<dyn Fn(&Conflict) -> Resolution + Send + Sync>;

/// Strategy registry reconciling a local change with a colliding server
/// change. Strategy names are validated when the resolver is constructed or
/// a strategy is looked up by name at registration time, never mid-flight.
pub struct ConflictResolver {
	strategies: HashMap<String, StrategyFn>,
	default_strategy: String,
	/// Conflicts halted by the `manual` strategy, keyed by conflict id.
	pending_manual: HashMap<String, Conflict>,
	history: VecDeque<Conflict>,
}

impl ConflictResolver {
	/// Build a resolver with the built-in strategies registered. Fails fast
	/// on an unknown default strategy name.
	pub fn new(default_strategy: &str) -> Result<Self, SyncError> {
		let mut resolver = Self {
			strategies: HashMap::new(),
			default_strategy: default_strategy.to_string(),
			pending_manual: HashMap::new(),
			history: VecDeque::new(),
		};

		resolver.register("client_wins", |conflict: &Conflict| {
			Resolution::Resolved(conflict.client_change.clone())
		});
		resolver.register("server_wins", |conflict: &Conflict| {
			Resolution::Resolved(conflict.server_change.clone())
		});
		resolver.register("merge", |conflict: &Conflict| {
			Resolution::Resolved(merge_changes(
				&conflict.client_change,
				&conflict.server_change,
			))
		});
		resolver.register("manual", |_conflict: &Conflict| Resolution::Manual);

		if !resolver.strategies.contains_key(default_strategy) {
			return Err(SyncError::UnknownStrategy(default_strategy.to_string()));
		}

		Ok(resolver)
	}

	/// Register a custom strategy under a name. Registering over a built-in
	/// replaces it.
	pub fn register<F>(&mut self, name: impl Into<String>, strategy: F)
	where
		F: Fn(&Conflict) -> Resolution + Send + Sync + 'static,
	{
		self.strategies.insert(name.into(), Arc::new(strategy));
	}

	pub fn has_strategy(&self, name: &str) -> bool {
		self.strategies.contains_key(name)
	}

	pub fn default_strategy(&self) -> &str {
		&self.default_strategy
	}

	/// Run a strategy (the default unless overridden) against a conflict.
	/// Returns the resolution, or `None` when the strategy defers to a
	/// manual resolution; the conflict is then parked until
	/// [`resolve_manually`](Self::resolve_manually).
	pub fn resolve(
		&mut self,
		mut conflict: Conflict,
		strategy: Option<&str>,
	) -> Result<Option<Change>, SyncError> {
		let name = strategy.unwrap_or(&self.default_strategy);
		let strategy_fn = self
			.strategies
			.get(name)
			.cloned()
			.ok_or_else(|| SyncError::UnknownStrategy(name.to_string()))?;

		match strategy_fn(&conflict) {
			Resolution::Resolved(resolution) => {
				debug!("conflict {} resolved via {}", conflict.id, name);
				conflict.resolved = true;
				conflict.resolution = Some(resolution.clone());
				self.push_history(conflict);
				Ok(Some(resolution))
			}
			Resolution::Manual => {
				debug!("conflict {} awaiting manual resolution", conflict.id);
				self.pending_manual.insert(conflict.id.clone(), conflict);
				Ok(None)
			}
		}
	}

	/// Supply the resolution for a conflict parked by the `manual` strategy.
	pub fn resolve_manually(
		&mut self,
		conflict_id: &str,
		chosen: Change,
	) -> Result<Change, SyncError> {
		let mut conflict = self
			.pending_manual
			.remove(conflict_id)
			.ok_or_else(|| SyncError::UnknownConflict(conflict_id.to_string()))?;

		conflict.resolved = true;
		conflict.resolution = Some(chosen.clone());
		self.push_history(conflict);
		Ok(chosen)
	}

	/// Conflicts currently awaiting a manual resolution.
	pub fn open_conflicts(&self) -> usize {
		self.pending_manual.len()
	}

	pub fn get_pending(&self, conflict_id: &str) -> Option<&Conflict> {
		self.pending_manual.get(conflict_id)
	}

	/// Bounded history of resolved conflicts, oldest first.
	pub fn history(&self) -> impl Iterator<Item = &Conflict> {
		self.history.iter()
	}

	fn push_history(&mut self, conflict: Conflict) {
		if self.history.len() >= RESOLVED_HISTORY_LIMIT {
			self.history.pop_front();
		}
		self.history.push_back(conflict);
	}
}

/// Field-level merge: the server payload is the base and client fields win
/// key-by-key; kind, id, and timestamps come from the server change. Only
/// meaningful when both sides are updates; any other pairing is
/// server-authoritative.
fn merge_changes(client: &Change, server: &Change) -> Change {
	if client.kind != ChangeKind::Update || server.kind != ChangeKind::Update {
		warn!(
			"merge requested for non-update pair ({:?}/{:?}) on {}; keeping server change",
			client.kind, server.kind, client.id
		);
		return server.clone();
	}

	let mut payload = server.payload.clone();
	for (key, value) in &client.payload {
		payload.insert(key.clone(), value.clone());
	}

	let mut merged = server.clone();
	merged.payload = payload;
	merged.merged = true;
	merged
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::{Map, Value, json};

	use super::*;

	fn payload(v: Value) -> Map<String, Value> {
		match v {
			Value::Object(m) => m,
			_ => panic!("payload must be an object"),
		}
	}

	fn update(id: &str, client_id: &str, body: Value) -> Change {
		Change::new(id, ChangeKind::Update, payload(body), client_id)
	}

	#[test]
	fn test_unknown_default_strategy_fails_at_construction() {
		let err = ConflictResolver::new("newest_wins")
			.err()
			.expect("unknown default strategy must be rejected");
		assert!(matches!(err, SyncError::UnknownStrategy(name) if name == "newest_wins"));
	}

	#[test]
	fn test_client_wins_and_server_wins_are_verbatim() {
		let mut resolver = ConflictResolver::new("client_wins").unwrap();
		let client = update("c-1", "client", json!({"a": 1}));
		let server = update("c-1", "server", json!({"a": 2}));

		let conflict = Conflict::new(client.clone(), server.clone());
		let resolution = resolver.resolve(conflict, None).unwrap().unwrap();
		assert_eq!(resolution.payload, client.payload);
		assert!(!resolution.merged);

		let conflict = Conflict::new(client, server.clone());
		let resolution = resolver.resolve(conflict, Some("server_wins")).unwrap().unwrap();
		assert_eq!(resolution.payload, server.payload);
	}

	#[test]
	fn test_merge_disjoint_keys_union() {
		let mut resolver = ConflictResolver::new("merge").unwrap();
		let client = update("c-1", "client", json!({"a": 1}));
		let server = update("c-1", "server", json!({"b": 3}));

		let resolution = resolver
			.resolve(Conflict::new(client, server), None)
			.unwrap()
			.unwrap();
		assert_eq!(resolution.payload["a"], 1);
		assert_eq!(resolution.payload["b"], 3);
		assert!(resolution.merged);
	}

	#[test]
	fn test_merge_overlapping_keys_client_wins() {
		let mut resolver = ConflictResolver::new("merge").unwrap();
		let client = update("c-1", "client", json!({"a": 1}));
		let server = update("c-1", "server", json!({"a": 2, "b": 3}));

		let resolution = resolver
			.resolve(Conflict::new(client, server.clone()), None)
			.unwrap()
			.unwrap();
		assert_eq!(resolution.payload["a"], 1);
		assert_eq!(resolution.payload["b"], 3);
		// Identity and timestamps come from the server side.
		assert_eq!(resolution.created_at, server.created_at);
		assert_eq!(resolution.kind, ChangeKind::Update);
	}

	#[test]
	fn test_merge_non_update_pair_is_server_authoritative() {
		let mut resolver = ConflictResolver::new("merge").unwrap();
		let client = Change::new("c-1", ChangeKind::Delete, Map::new(), "client");
		let server = update("c-1", "server", json!({"a": 2}));

		let resolution = resolver
			.resolve(Conflict::new(client, server.clone()), None)
			.unwrap()
			.unwrap();
		assert_eq!(resolution.payload, server.payload);
		assert!(!resolution.merged);
	}

	#[test]
	fn test_manual_parks_conflict_until_resolved() {
		let mut resolver = ConflictResolver::new("manual").unwrap();
		let client = update("c-1", "client", json!({"a": 1}));
		let server = update("c-1", "server", json!({"a": 2}));
		let conflict = Conflict::new(client.clone(), server);
		let conflict_id = conflict.id.clone();

		assert!(resolver.resolve(conflict, None).unwrap().is_none());
		assert_eq!(resolver.open_conflicts(), 1);

		let chosen = resolver.resolve_manually(&conflict_id, client).unwrap();
		assert_eq!(chosen.payload["a"], 1);
		assert_eq!(resolver.open_conflicts(), 0);
		assert_eq!(resolver.history().count(), 1);
	}

	#[test]
	fn test_resolve_manually_unknown_id() {
		let mut resolver = ConflictResolver::new("manual").unwrap();
		let chosen = update("c-1", "client", json!({}));
		let err = resolver.resolve_manually("cf-ghost", chosen).unwrap_err();
		assert!(matches!(err, SyncError::UnknownConflict(_)));
	}

	#[test]
	fn test_history_is_bounded() {
		let mut resolver = ConflictResolver::new("server_wins").unwrap();
		for i in 0..(RESOLVED_HISTORY_LIMIT + 10) {
			let id = format!("c-{}", i);
			let client = update(&id, "client", json!({"v": 1}));
			let server = update(&id, "server", json!({"v": 2}));
			resolver
				.resolve(Conflict::new(client, server), None)
				.unwrap();
		}
		assert_eq!(resolver.history().count(), RESOLVED_HISTORY_LIMIT);
	}

	#[test]
	fn test_custom_strategy_registration() {
		let mut resolver = ConflictResolver::new("merge").unwrap();
		resolver.register("prefer_longer_payload", |conflict: &Conflict| {
			if conflict.client_change.payload.len() >= conflict.server_change.payload.len() {
				Resolution::Resolved(conflict.client_change.clone())
			} else {
				Resolution::Resolved(conflict.server_change.clone())
			}
		});
		assert!(resolver.has_strategy("prefer_longer_payload"));

		let client = update("c-1", "client", json!({"a": 1, "b": 2}));
		let server = update("c-1", "server", json!({"a": 9}));
		let resolution = resolver
			.resolve(
				Conflict::new(client.clone(), server),
				Some("prefer_longer_payload"),
			)
			.unwrap()
			.unwrap();
		assert_eq!(resolution.payload, client.payload);
	}
}
