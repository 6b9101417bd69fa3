use std::collections::VecDeque;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::protocol::Frame;

/// What to do when the offline buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Evict the oldest buffered frame to admit the new one.
	DropOldest,
	/// Keep the buffer as-is and reject the new frame.
	RejectNew,
}

/// Outcome of [`OfflineQueue::push`].
#[derive(Debug)]
pub enum PushOutcome {
	Buffered,
	/// Buffered, but the returned oldest frame was evicted to make room.
	Evicted(Frame),
	/// The buffer is full and the policy is `RejectNew`.
	Rejected(Frame),
}

/// Bounded FIFO holding serialized outbound frames while disconnected.
/// Frames are flushed strictly in arrival order when the connection reopens.
pub struct OfflineQueue {
	frames: VecDeque<Frame>,
	capacity: usize,
	policy: OverflowPolicy,
}

impl OfflineQueue {
	pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
		Self {
			frames: VecDeque::new(),
			capacity,
			policy,
		}
	}

	pub fn push(&mut self, frame: Frame) -> PushOutcome {
		if self.frames.len() < self.capacity {
			self.frames.push_back(frame);
			return PushOutcome::Buffered;
		}

		match self.policy {
			OverflowPolicy::DropOldest => {
				// capacity is validated positive at construction, so the
				// pop cannot fail here
				let evicted = self.frames.pop_front();
				self.frames.push_back(frame);
				debug!("offline buffer full; evicted oldest frame");
				match evicted {
					Some(old) => PushOutcome::Evicted(old),
					None => PushOutcome::Buffered,
				}
			}
			OverflowPolicy::RejectNew => {
				debug!("offline buffer full; rejecting new frame");
				PushOutcome::Rejected(frame)
			}
		}
	}

	/// Take every buffered frame, in arrival order.
	pub fn drain(&mut self) -> Vec<Frame> {
		self.frames.drain(..).collect()
	}

	pub fn len(&self) -> usize {
		self.frames.len()
	}

	pub fn is_empty(&self) -> bool {
		self.frames.is_empty()
	}
}
