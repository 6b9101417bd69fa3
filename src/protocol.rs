use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum size for a single serialized frame (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> u64 {
	chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Kind of a locally originated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Create,
	Update,
	Delete,
	Custom,
}

/// A pending local mutation awaiting server acknowledgment.
///
/// The payload is an opaque JSON map; this engine never interprets it beyond
/// key-by-key overlay during a `merge` resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
	/// Unique identifier, `<client_id>-<seq>` for locally created changes.
	pub id: String,
	/// Tagged mutation kind.
	pub kind: ChangeKind,
	/// Opaque payload fields.
	pub payload: Map<String, Value>,
	/// Starts at 1, incremented on every re-submission.
	pub version: u32,
	/// Creation time in Unix epoch milliseconds.
	pub created_at: u64,
	/// Originating client identifier.
	pub client_id: String,
	/// Set when this change is the product of a field-level merge.
	#[serde(default, skip_serializing_if = "is_false")]
	pub merged: bool,
}

fn is_false(v: &bool) -> bool {
	!*v
}

impl Change {
	pub fn new(
		id: impl Into<String>,
		kind: ChangeKind,
		payload: Map<String, Value>,
		client_id: impl Into<String>,
	) -> Self {
		Self {
			id: id.into(),
			kind,
			payload,
			version: 1,
			created_at: now_millis(),
			client_id: client_id.into(),
			merged: false,
		}
	}
}

/// Frame body, tagged by the wire-level `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FrameBody {
	/// Outbound: a single local change.
	Change(Change),
	/// Outbound: ask the server for changes since a watermark.
	SyncRequest { last_sync_time: u64 },
	/// Inbound: a batch of server-authoritative changes.
	Sync { changes: Vec<Change> },
	/// Both directions. Outbound acknowledges received server changes by
	/// count; inbound additionally names the local change ids the server
	/// has accepted.
	SyncAck {
		received_changes: u64,
		#[serde(default, skip_serializing_if = "Vec::is_empty")]
		change_ids: Vec<String>,
	},
	/// Inbound: the server detected a collision with a local change.
	Conflict {
		client_change: Change,
		server_change: Change,
	},
	/// Outbound: the resolution for a previously reported conflict.
	/// Redelivery is safe; the server de-duplicates by conflict id.
	ConflictResolved {
		conflict_id: String,
		resolved_change: Change,
	},
	/// Outbound liveness probe.
	Heartbeat { timestamp: u64 },
	/// Inbound reply to a heartbeat.
	HeartbeatResponse { timestamp: u64 },
	/// Inbound server-side error report.
	Error { message: String, code: String },
}

impl FrameBody {
	/// Wire-level `type` tag, for logging.
	pub fn type_name(&self) -> &'static str {
		match self {
			FrameBody::Change(_) => "change",
			FrameBody::SyncRequest { .. } => "sync_request",
			FrameBody::Sync { .. } => "sync",
			FrameBody::SyncAck { .. } => "sync_ack",
			FrameBody::Conflict { .. } => "conflict",
			FrameBody::ConflictResolved { .. } => "conflict_resolved",
			FrameBody::Heartbeat { .. } => "heartbeat",
			FrameBody::HeartbeatResponse { .. } => "heartbeat_response",
			FrameBody::Error { .. } => "error",
		}
	}
}

/// Transport-agnostic frame envelope: `{ type, data, timestamp }` plus an
/// optional `meta` object attached by the frame-decoration hook (auth tokens
/// and similar metadata are external to this engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
	#[serde(flatten)]
	pub body: FrameBody,
	pub timestamp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub meta: Option<Value>,
}

impl Frame {
	pub fn new(body: FrameBody) -> Self {
		Self {
			body,
			timestamp: now_millis(),
			meta: None,
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	fn payload(v: Value) -> Map<String, Value> {
		match v {
			Value::Object(m) => m,
			_ => panic!("payload must be an object"),
		}
	}

	#[test]
	fn test_frame_envelope_shape() {
		let change = Change::new("c-1", ChangeKind::Update, payload(json!({"a": 1})), "c");
		let frame = Frame::new(FrameBody::Change(change));

		let v = serde_json::to_value(&frame).unwrap();
		assert_eq!(v["type"], "change");
		assert_eq!(v["data"]["id"], "c-1");
		assert_eq!(v["data"]["kind"], "update");
		assert_eq!(v["data"]["version"], 1);
		assert!(v["timestamp"].as_u64().unwrap() > 0);
		// meta is omitted unless the decoration hook sets it
		assert!(v.get("meta").is_none());
	}

	#[test]
	fn test_frame_roundtrip() {
		let frame = Frame::new(FrameBody::SyncAck {
			received_changes: 2,
			change_ids: vec!["c-1".to_string(), "c-2".to_string()],
		});

		let bytes = serde_json::to_vec(&frame).unwrap();
		let back: Frame = serde_json::from_slice(&bytes).unwrap();
		match back.body {
			FrameBody::SyncAck {
				received_changes,
				change_ids,
			} => {
				assert_eq!(received_changes, 2);
				assert_eq!(change_ids, vec!["c-1", "c-2"]);
			}
			other => panic!("unexpected body: {:?}", other),
		}
	}

	#[test]
	fn test_inbound_sync_ack_without_change_ids() {
		// Outbound-shaped acks carry only a count; change_ids defaults empty.
		let raw = json!({"type": "sync_ack", "data": {"received_changes": 3}, "timestamp": 1});
		let frame: Frame = serde_json::from_value(raw).unwrap();
		match frame.body {
			FrameBody::SyncAck { change_ids, .. } => assert!(change_ids.is_empty()),
			other => panic!("unexpected body: {:?}", other),
		}
	}

	#[test]
	fn test_type_names() {
		assert_eq!(
			Frame::new(FrameBody::Heartbeat { timestamp: 1 })
				.body
				.type_name(),
			"heartbeat"
		);
		assert_eq!(
			Frame::new(FrameBody::SyncRequest { last_sync_time: 0 })
				.body
				.type_name(),
			"sync_request"
		);
	}
}
