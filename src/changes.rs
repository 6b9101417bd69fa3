use std::collections::{HashMap, HashSet};

use log::debug;
use serde_json::{Map, Value};

use crate::protocol::{Change, ChangeKind};

/// Tracks locally originated changes until the server acknowledges them.
///
/// The tracker is the exclusive owner of a pending change; the conflict
/// resolver only ever sees references or clones. All mutation happens on the
/// engine actor task, so no internal locking is needed here.
pub struct ChangeTracker {
	client_id: String,
	next_seq: u64,
	pending: HashMap<String, Change>,
	/// Creation order of pending ids; retransmission follows this order.
	order: Vec<String>,
	/// Ids halted by a `manual` conflict awaiting caller resolution.
	held: HashSet<String>,
}

impl ChangeTracker {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			next_seq: 0,
			pending: HashMap::new(),
			order: Vec::new(),
			held: HashSet::new(),
		}
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// Register a new local mutation. Always succeeds; the change stays in
	/// the pending set until acknowledged, regardless of transport state.
	pub fn add_change(&mut self, kind: ChangeKind, payload: Map<String, Value>) -> Change {
		self.next_seq += 1;
		let id = format!("{}-{}", self.client_id, self.next_seq);
		let change = Change::new(id.clone(), kind, payload, self.client_id.clone());

		self.pending.insert(id.clone(), change.clone());
		self.order.push(id);
		debug!(
			"tracked change {} ({} pending)",
			change.id,
			self.pending.len()
		);
		change
	}

	/// Remove an acknowledged change. Idempotent: re-acking a removed id is
	/// a no-op and returns false.
	pub fn ack(&mut self, id: &str) -> bool {
		if self.pending.remove(id).is_none() {
			return false;
		}
		self.order.retain(|pending_id| pending_id != id);
		self.held.remove(id);
		debug!("acked change {} ({} pending)", id, self.pending.len());
		true
	}

	pub fn is_pending(&self, id: &str) -> bool {
		self.pending.contains_key(id)
	}

	pub fn get(&self, id: &str) -> Option<&Change> {
		self.pending.get(id)
	}

	/// Supersede a pending change with its resolution. The id keeps its
	/// original position in creation order; a later ack removes it normally.
	pub fn supersede(&mut self, resolution: Change) {
		if self.pending.contains_key(&resolution.id) {
			self.held.remove(&resolution.id);
			self.pending.insert(resolution.id.clone(), resolution);
		}
	}

	/// Halt retransmission of a change until a manual resolution arrives.
	pub fn hold(&mut self, id: &str) {
		if self.pending.contains_key(id) {
			self.held.insert(id.to_string());
		}
	}

	pub fn is_held(&self, id: &str) -> bool {
		self.held.contains(id)
	}

	/// Bump versions and return all still-pending, non-held changes in their
	/// original creation order. Called once per reconnect.
	pub fn retransmit_set(&mut self) -> Vec<Change> {
		let mut out = Vec::new();
		for id in &self.order {
			if self.held.contains(id) {
				continue;
			}
			if let Some(change) = self.pending.get_mut(id) {
				change.version += 1;
				out.push(change.clone());
			}
		}
		out
	}

	pub fn len(&self) -> usize {
		self.pending.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}
}
