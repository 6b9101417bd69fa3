/// Common test utilities for the sync engine integration tests.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::{sleep, timeout};

use bifrost_sync::transport::memory::ServerConn;
use bifrost_sync::{Change, Frame, FrameBody, SyncEngine, SyncEvent, SyncOptions};

/// Engine options with short reconnect timers. Heartbeats keep their slow
/// defaults so they never interfere with unrelated scenarios.
pub fn fast_options() -> SyncOptions {
	SyncOptions {
		reconnect_attempts: 3,
		reconnect_delay: Duration::from_millis(20),
		max_reconnect_delay: Duration::from_millis(100),
		force_sync_timeout: Duration::from_millis(300),
		..SyncOptions::default()
	}
}

pub fn payload(v: Value) -> Map<String, Value> {
	match v {
		Value::Object(m) => m,
		_ => panic!("payload must be an object"),
	}
}

/// Captures every emitted engine event for later assertions.
pub struct EventRecorder {
	events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl EventRecorder {
	pub fn attach(engine: &SyncEngine) -> Self {
		let events: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
		let sink = events.clone();
		engine
			.events()
			.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
		Self { events }
	}

	pub fn snapshot(&self) -> Vec<SyncEvent> {
		self.events.lock().unwrap().clone()
	}

	pub fn count(&self, name: &str) -> usize {
		self.snapshot().iter().filter(|e| e.name() == name).count()
	}

	/// Poll until an event with the given name has been emitted.
	pub async fn wait_for(&self, name: &str) -> SyncEvent {
		for _ in 0..200 {
			if let Some(event) = self.snapshot().into_iter().find(|e| e.name() == name) {
				return event;
			}
			sleep(Duration::from_millis(10)).await;
		}
		panic!("event {} never observed", name);
	}
}

/// Receive the next change frame, answering heartbeats along the way.
pub async fn next_change(server: &mut ServerConn) -> Change {
	loop {
		let frame = timeout(Duration::from_secs(2), server.recv())
			.await
			.expect("timed out waiting for a change frame")
			.expect("link closed");
		match frame.body {
			FrameBody::Change(change) => return change,
			FrameBody::Heartbeat { timestamp } => {
				let _ = server
					.send(Frame::new(FrameBody::HeartbeatResponse { timestamp }))
					.await;
			}
			_ => {}
		}
	}
}

/// Receive the next frame whose wire type matches, answering heartbeats and
/// skipping everything else.
pub async fn next_frame_of(server: &mut ServerConn, type_name: &str) -> Frame {
	loop {
		let frame = timeout(Duration::from_secs(2), server.recv())
			.await
			.unwrap_or_else(|_| panic!("timed out waiting for a {} frame", type_name))
			.expect("link closed");
		if frame.body.type_name() == type_name {
			return frame;
		}
		if let FrameBody::Heartbeat { timestamp } = frame.body {
			let _ = server
				.send(Frame::new(FrameBody::HeartbeatResponse { timestamp }))
				.await;
		}
	}
}

/// Assert that no change frame arrives within the window.
pub async fn assert_no_change(server: &mut ServerConn, window: Duration) {
	let deadline = tokio::time::Instant::now() + window;
	loop {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		if remaining.is_zero() {
			return;
		}
		match timeout(remaining, server.recv()).await {
			Err(_) | Ok(None) => return,
			Ok(Some(frame)) => match frame.body {
				FrameBody::Change(change) => panic!("unexpected change frame {}", change.id),
				FrameBody::Heartbeat { timestamp } => {
					let _ = server
						.send(Frame::new(FrameBody::HeartbeatResponse { timestamp }))
						.await;
				}
				_ => {}
			},
		}
	}
}

/// Poll engine stats until the predicate holds.
pub async fn wait_for_stats<F>(engine: &SyncEngine, predicate: F) -> bifrost_sync::EngineStats
where
	F: Fn(&bifrost_sync::EngineStats) -> bool,
{
	for _ in 0..200 {
		let stats = engine.stats().await.expect("engine stopped");
		if predicate(&stats) {
			return stats;
		}
		sleep(Duration::from_millis(10)).await;
	}
	panic!("stats condition never reached");
}
