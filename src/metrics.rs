use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for engine operations. Injected into the engine and queue
/// manager at construction; one instance per engine.
#[derive(Default)]
pub struct SyncMetrics {
	pub frames_sent: AtomicU64,
	pub frames_received: AtomicU64,
	pub changes_tracked: AtomicU64,
	pub changes_acked: AtomicU64,
	pub conflicts_detected: AtomicU64,
	pub conflicts_resolved: AtomicU64,
	pub reconnections: AtomicU64,
	pub heartbeats_missed: AtomicU64,
	pub offline_buffered: AtomicU64,
	pub offline_dropped: AtomicU64,
	pub queue_items_processed: AtomicU64,
	pub queue_items_failed: AtomicU64,
}

impl SyncMetrics {
	/// Generate Prometheus-compatible metrics text
	pub fn to_prometheus_text(&self) -> String {
		let counters: [(&str, &str, &AtomicU64); 12] = [
			(
				"bifrost_sync_frames_sent_total",
				"Frames written to the transport",
				&self.frames_sent,
			),
			(
				"bifrost_sync_frames_received_total",
				"Frames received from the transport",
				&self.frames_received,
			),
			(
				"bifrost_sync_changes_tracked_total",
				"Local changes registered",
				&self.changes_tracked,
			),
			(
				"bifrost_sync_changes_acked_total",
				"Local changes acknowledged by the server",
				&self.changes_acked,
			),
			(
				"bifrost_sync_conflicts_detected_total",
				"Server changes colliding with pending local changes",
				&self.conflicts_detected,
			),
			(
				"bifrost_sync_conflicts_resolved_total",
				"Conflicts resolved automatically or manually",
				&self.conflicts_resolved,
			),
			(
				"bifrost_sync_reconnections_total",
				"Reconnect attempts scheduled",
				&self.reconnections,
			),
			(
				"bifrost_sync_heartbeats_missed_total",
				"Heartbeats that timed out without a response",
				&self.heartbeats_missed,
			),
			(
				"bifrost_sync_offline_buffered_total",
				"Frames buffered while disconnected",
				&self.offline_buffered,
			),
			(
				"bifrost_sync_offline_dropped_total",
				"Buffered frames evicted or rejected on overflow",
				&self.offline_dropped,
			),
			(
				"bifrost_sync_queue_items_processed_total",
				"Work queue items processed successfully",
				&self.queue_items_processed,
			),
			(
				"bifrost_sync_queue_items_failed_total",
				"Work queue items failed after exhausting retries",
				&self.queue_items_failed,
			),
		];

		let mut out = String::new();
		for (name, help, counter) in counters {
			out.push_str(&format!("# HELP {} {}\n", name, help));
			out.push_str(&format!("# TYPE {} counter\n", name));
			out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
		}
		out
	}
}
