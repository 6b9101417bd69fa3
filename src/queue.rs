use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::events::{EventBus, SyncEvent};
use crate::metrics::SyncMetrics;
use crate::protocol::now_millis;

/// Priority tier for queued work. High drains before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Low,
	Normal,
	High,
}

/// One unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct QueueItem {
	pub id: String,
	pub payload: Value,
	pub priority: Priority,
	pub attempts: u32,
	pub max_attempts: u32,
	pub added_at: u64,
}

/// Application-supplied handler invoked for each queue item.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
	async fn process(&self, item: &QueueItem) -> anyhow::Result<()>;
}

/// Tuning knobs for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueOptions {
	/// Maximum items taken per drain pass.
	pub batch_size: usize,
	/// Debounced idle window before a drain pass starts; a new enqueue
	/// restarts the window rather than double-scheduling.
	pub batch_timeout: Duration,
	/// Bounded queue depth; overflow evicts the oldest lowest-priority item.
	pub max_queue_size: usize,
	/// Retry budget per item before it is finally failed.
	pub max_attempts: u32,
}

impl Default for QueueOptions {
	fn default() -> Self {
		Self {
			batch_size: 100,
			batch_timeout: Duration::from_millis(5000),
			max_queue_size: 1000,
			max_attempts: 3,
		}
	}
}

/// Priority tiers, FIFO within each.
#[derive(Default)]
struct Tiers {
	high: VecDeque<QueueItem>,
	normal: VecDeque<QueueItem>,
	low: VecDeque<QueueItem>,
}

impl Tiers {
	fn len(&self) -> usize {
		self.high.len() + self.normal.len() + self.low.len()
	}

	fn push_back(&mut self, item: QueueItem) {
		self.tier_mut(item.priority).push_back(item);
	}

	fn push_front(&mut self, item: QueueItem) {
		self.tier_mut(item.priority).push_front(item);
	}

	fn pop_next(&mut self) -> Option<QueueItem> {
		self.high
			.pop_front()
			.or_else(|| self.normal.pop_front())
			.or_else(|| self.low.pop_front())
	}

	/// Evict the oldest item of the lowest non-empty tier. A High item is
	/// never evicted while a Normal or Low item exists.
	fn evict_lowest_oldest(&mut self) -> Option<QueueItem> {
		self.low
			.pop_front()
			.or_else(|| self.normal.pop_front())
			.or_else(|| self.high.pop_front())
	}

	fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueItem> {
		match priority {
			Priority::High => &mut self.high,
			Priority::Normal => &mut self.normal,
			Priority::Low => &mut self.low,
		}
	}
}

/// Priority-ordered, batched, retrying work queue. Independent of the
/// connection: it keeps draining while the engine is offline.
pub struct SyncQueueManager {
	tiers: Arc<Mutex<Tiers>>,
	next_seq: AtomicU64,
	pings: mpsc::UnboundedSender<()>,
	worker: Mutex<Option<JoinHandle<()>>>,
	events: Arc<EventBus>,
	opts: QueueOptions,
}

impl SyncQueueManager {
	pub fn new(
		processor: Arc<dyn QueueProcessor>,
		events: Arc<EventBus>,
		metrics: Arc<SyncMetrics>,
		opts: QueueOptions,
	) -> Self {
		let tiers: Arc<Mutex<Tiers>> = Arc::new(Mutex::new(Tiers::default()));
		let (pings, ping_rx) = mpsc::unbounded_channel();

		let worker = tokio::spawn(run_worker(
			tiers.clone(),
			processor,
			events.clone(),
			metrics,
			opts.clone(),
			ping_rx,
		));

		Self {
			tiers,
			next_seq: AtomicU64::new(0),
			pings,
			worker: Mutex::new(Some(worker)),
			events,
			opts,
		}
	}

	/// Insert a work item and (re)start the drain timer. Returns the item id.
	/// On overflow the oldest item of the lowest non-empty tier is dropped;
	/// the arriving item counts, so a lower-priority arrival into a queue of
	/// higher-priority work drops itself rather than displacing that work.
	pub fn enqueue(&self, payload: Value, priority: Priority) -> String {
		let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
		let id = format!("q-{}", seq);
		let item = QueueItem {
			id: id.clone(),
			payload,
			priority,
			attempts: 0,
			max_attempts: self.opts.max_attempts,
			added_at: now_millis(),
		};

		let evicted = {
			let mut tiers = self.tiers.lock().expect("queue lock poisoned");
			tiers.push_back(item);
			if tiers.len() > self.opts.max_queue_size {
				tiers.evict_lowest_oldest()
			} else {
				None
			}
		};

		if let Some(old) = evicted {
			warn!("queue overflow: dropped item {}", old.id);
			// Reported outside the lock; never silently dropped.
			self.events.emit(&SyncEvent::ItemDropped { item_id: old.id });
		}

		// Worker gone means shutdown is in progress; the item stays queued.
		let _ = self.pings.send(());
		id
	}

	pub fn len(&self) -> usize {
		self.tiers.lock().expect("queue lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Stop the worker after the in-flight drain pass completes.
	pub async fn shutdown(self) {
		drop(self.pings);
		let worker = self.worker.lock().expect("queue lock poisoned").take();
		if let Some(handle) = worker {
			let _ = handle.await;
		}
	}

}

async fn run_worker(
	tiers: Arc<Mutex<Tiers>>,
	processor: Arc<dyn QueueProcessor>,
	events: Arc<EventBus>,
	metrics: Arc<SyncMetrics>,
	opts: QueueOptions,
	mut pings: mpsc::UnboundedReceiver<()>,
) {
	loop {
		// Sleep until the first enqueue after an idle period.
		if pings.recv().await.is_none() {
			break;
		}

		// Debounce: every further enqueue restarts the idle window.
		let mut closing = false;
		loop {
			tokio::select! {
				_ = sleep(opts.batch_timeout) => break,
				more = pings.recv() => {
					if more.is_none() {
						closing = true;
						break;
					}
				}
			}
		}

		// Drain in bounded batches until the queue is empty.
		loop {
			let batch = take_batch(&tiers, opts.batch_size);
			if batch.is_empty() {
				break;
			}
			debug!("processing queue batch of {}", batch.len());

			for mut item in batch {
				match processor.process(&item).await {
					Ok(()) => {
						metrics.queue_items_processed.fetch_add(1, Ordering::Relaxed);
					}
					Err(e) => {
						item.attempts += 1;
						if item.attempts >= item.max_attempts {
							warn!(
								"queue item {} failed after {} attempts: {}",
								item.id, item.attempts, e
							);
							metrics.queue_items_failed.fetch_add(1, Ordering::Relaxed);
							events.emit(&SyncEvent::ItemFailed {
								item_id: item.id,
								attempts: item.attempts,
							});
						} else {
							debug!(
								"queue item {} failed (attempt {}/{}); requeueing at front: {}",
								item.id, item.attempts, item.max_attempts, e
							);
							// Front of its tier so a failing head-of-line item
							// is retried before newer work, not starved.
							let mut tiers = tiers.lock().expect("queue lock poisoned");
							tiers.push_front(item);
						}
					}
				}
			}
		}

		if closing {
			break;
		}
	}
	info!("sync queue worker stopped");
}

fn take_batch(tiers: &Arc<Mutex<Tiers>>, batch_size: usize) -> Vec<QueueItem> {
	let mut tiers = tiers.lock().expect("queue lock poisoned");
	let mut batch = Vec::new();
	while batch.len() < batch_size {
		match tiers.pop_next() {
			Some(item) => batch.push(item),
			None => break,
		}
	}
	batch
}
