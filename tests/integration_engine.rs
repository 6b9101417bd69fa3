mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use bifrost_sync::transport::memory;
use bifrost_sync::{
	ChangeKind, ConnectionState, Frame, FrameBody, SyncEngine, SyncError, SyncEvent, SyncOptions,
};
use common::*;

/// Changes added while disconnected are delivered exactly once, in creation
/// order, with a bumped version, when the connection comes up.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_offline_changes_retransmit_in_order_exactly_once()
-> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;

	let first = engine
		.add_change(ChangeKind::Create, payload(json!({"n": 1})))
		.await?;
	let second = engine
		.add_change(ChangeKind::Update, payload(json!({"n": 2})))
		.await?;

	engine.connect().await?;
	let mut server = listener.accept().await.expect("no connection");

	let c1 = next_change(&mut server).await;
	let c2 = next_change(&mut server).await;
	assert_eq!(c1.id, first);
	assert_eq!(c2.id, second);
	assert_eq!(c1.version, 2);
	assert_eq!(c2.version, 2);

	// The buffered copies were superseded by the retransmission; nothing
	// else arrives.
	assert_no_change(&mut server, Duration::from_millis(150)).await;

	let stats = engine.stats().await?;
	assert!(stats.is_connected);
	assert_eq!(stats.pending_changes, 2);

	engine.shutdown().await;
	Ok(())
}

/// connect() reports failure after exactly `reconnect_attempts` failed opens,
/// and the connection settles in `Failed`.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_connect_fails_after_reconnect_budget() -> Result<(), Box<dyn std::error::Error>> {
	let (transport, _listener) = memory::pair();
	let probes = transport.probes();
	probes.fail_next_opens(99);

	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	let err = engine.connect().await.unwrap_err();
	assert!(matches!(err, SyncError::ConnectFailed(3)));
	assert_eq!(probes.open_attempts(), 3);

	match recorder.wait_for("connection_failed").await {
		SyncEvent::ConnectionFailed { attempts } => assert_eq!(attempts, 3),
		other => panic!("unexpected event: {:?}", other),
	}
	assert_eq!(recorder.count("reconnecting"), 2);

	let stats = engine.stats().await?;
	assert_eq!(stats.state, ConnectionState::Failed);

	engine.shutdown().await;
	Ok(())
}

/// Redelivered acknowledgments for an already-removed change are no-ops.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_duplicate_acks_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	let mut server = listener.accept().await.expect("no connection");

	let id = engine
		.add_change(ChangeKind::Create, payload(json!({"v": 1})))
		.await?;
	let change = next_change(&mut server).await;
	assert_eq!(change.id, id);
	assert_eq!(change.version, 1);

	let ack = Frame::new(FrameBody::SyncAck {
		received_changes: 0,
		change_ids: vec![id.clone()],
	});
	assert!(server.send(ack.clone()).await);
	assert!(server.send(ack).await);

	recorder.wait_for("change_acked").await;
	sleep(Duration::from_millis(50)).await;
	assert_eq!(recorder.count("change_acked"), 1);

	let stats = engine.stats().await?;
	assert_eq!(stats.pending_changes, 0);

	engine.shutdown().await;
	Ok(())
}

/// A silent server misses the heartbeat window; the engine drops the link and
/// recovers on a fresh connection epoch.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_missed_heartbeat_forces_reconnect() -> Result<(), Box<dyn std::error::Error>> {
	let opts = SyncOptions {
		heartbeat_interval: Duration::from_millis(30),
		heartbeat_timeout: Duration::from_millis(30),
		..fast_options()
	};
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", opts)?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	// Hold the first link open but never answer heartbeats.
	let _silent = listener.accept().await.expect("no connection");

	recorder.wait_for("reconnecting").await;
	assert!(
		engine
			.metrics()
			.heartbeats_missed
			.load(std::sync::atomic::Ordering::Relaxed)
			>= 1
	);

	let _server = timeout(Duration::from_secs(2), listener.accept())
		.await?
		.expect("no reconnect");
	wait_for_stats(&engine, |s| s.is_connected && s.epoch >= 2).await;

	engine.shutdown().await;
	Ok(())
}

/// force_sync sends a sync_request and resolves with the size of the server's
/// batch.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_force_sync_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	let mut server = listener.accept().await.expect("no connection");

	tokio::spawn(async move {
		while let Some(frame) = server.recv().await {
			match frame.body {
				FrameBody::SyncRequest { .. } => {
					let change = bifrost_sync::Change::new(
						"srv-1",
						ChangeKind::Create,
						payload(json!({"x": 1})),
						"server",
					);
					let _ = server
						.send(Frame::new(FrameBody::Sync {
							changes: vec![change],
						}))
						.await;
				}
				FrameBody::Heartbeat { timestamp } => {
					let _ = server
						.send(Frame::new(FrameBody::HeartbeatResponse { timestamp }))
						.await;
				}
				_ => {}
			}
		}
	});

	let changes = engine.force_sync().await?;
	assert_eq!(changes, 1);
	assert_eq!(recorder.count("change_applied"), 1);
	assert_eq!(recorder.count("synced"), 1);

	engine.shutdown().await;
	Ok(())
}

/// force_sync gives up with SyncTimeout when no sync batch arrives.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_force_sync_times_out_without_server_batch()
-> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;

	engine.connect().await?;
	let _server = listener.accept().await.expect("no connection");

	let err = engine.force_sync().await.unwrap_err();
	assert!(matches!(err, SyncError::SyncTimeout(_)));

	engine.shutdown().await;
	Ok(())
}

/// handle_offline drops the link and suppresses redials; handle_online
/// resumes the reconnect immediately.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_offline_signal_defers_reconnect_until_online()
-> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let probes = transport.probes();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	let _server = listener.accept().await.expect("no connection");
	assert_eq!(probes.open_attempts(), 1);

	engine.handle_offline().await?;
	recorder.wait_for("offline").await;
	let stats = engine.stats().await?;
	assert!(!stats.is_connected);
	assert_eq!(stats.state, ConnectionState::Reconnecting);

	// No redial while the environment is offline.
	sleep(Duration::from_millis(120)).await;
	assert_eq!(probes.open_attempts(), 1);

	engine.handle_online().await?;
	recorder.wait_for("online").await;
	let _server2 = timeout(Duration::from_secs(2), listener.accept())
		.await?
		.expect("no reconnect after online signal");
	wait_for_stats(&engine, |s| s.is_connected && s.epoch == 2).await;

	engine.shutdown().await;
	Ok(())
}

/// An explicit disconnect never schedules a reconnect.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_explicit_disconnect_does_not_reconnect() -> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let probes = transport.probes();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	let _server = listener.accept().await.expect("no connection");

	engine.disconnect().await?;
	recorder.wait_for("disconnected").await;

	sleep(Duration::from_millis(120)).await;
	assert_eq!(probes.open_attempts(), 1);
	let stats = engine.stats().await?;
	assert_eq!(stats.state, ConnectionState::Disconnected);

	engine.shutdown().await;
	Ok(())
}

/// A malformed inbound frame surfaces as a server_error event and leaves the
/// connection up.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_garbage_frame_does_not_drop_connection() -> Result<(), Box<dyn std::error::Error>> {
	let (transport, mut listener) = memory::pair();
	let engine = SyncEngine::new(transport, "node-a", fast_options())?;
	let recorder = EventRecorder::attach(&engine);

	engine.connect().await?;
	let server = listener.accept().await.expect("no connection");

	assert!(server.send_garbage().await);
	recorder.wait_for("server_error").await;

	let stats = engine.stats().await?;
	assert!(stats.is_connected);
	assert_eq!(stats.epoch, 1);

	engine.shutdown().await;
	Ok(())
}
