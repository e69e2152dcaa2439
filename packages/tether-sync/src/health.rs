//! Observable sync health.
//!
//! Every failure that is handled locally (logged and retried, skipped, or quarantined) is also
//! recorded here so the application can surface degraded sync instead of failing silently.

use std::sync::{
	Mutex,
	atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
	#[default]
	Disconnected,
	Connecting,
	Streaming,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
	MutationSynced { seq: i64 },
	MutationFailed { seq: i64, attempts: i64, transient: bool, error: String },
	MutationQuarantined { seq: i64, attempts: i64, error: String },
	BatchApplied { applied: u64, skipped: u64, missing: u64, controls: u64 },
	RowSkipped { id: Option<String>, error: String },
	StreamError { error: String },
	ConsumerStateChanged { state: ConsumerState },
	Indexed { doc_id: String },
	IndexFailed { doc_id: String, error: String },
	VectorRemoveFailed { doc_ids: Vec<String>, error: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
	pub synced: u64,
	pub transient_failures: u64,
	pub rejections: u64,
	pub quarantined: u64,
	pub rows_applied: u64,
	pub rows_skipped: u64,
	pub index_failures: u64,
	pub last_error: Option<String>,
	pub consumer: ConsumerState,
}

pub struct Health {
	synced: AtomicU64,
	transient_failures: AtomicU64,
	rejections: AtomicU64,
	quarantined: AtomicU64,
	rows_applied: AtomicU64,
	rows_skipped: AtomicU64,
	index_failures: AtomicU64,
	last_error: Mutex<Option<String>>,
	consumer: watch::Sender<ConsumerState>,
	events: broadcast::Sender<SyncEvent>,
}
impl Health {
	pub fn new() -> Self {
		let (consumer, _) = watch::channel(ConsumerState::Disconnected);
		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		Self {
			synced: AtomicU64::new(0),
			transient_failures: AtomicU64::new(0),
			rejections: AtomicU64::new(0),
			quarantined: AtomicU64::new(0),
			rows_applied: AtomicU64::new(0),
			rows_skipped: AtomicU64::new(0),
			index_failures: AtomicU64::new(0),
			last_error: Mutex::new(None),
			consumer,
			events,
		}
	}

	/// Lagging receivers lose the oldest events. Publishing never waits on subscribers.
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	pub fn watch_consumer(&self) -> watch::Receiver<ConsumerState> {
		self.consumer.subscribe()
	}

	pub fn consumer_state(&self) -> ConsumerState {
		*self.consumer.borrow()
	}

	pub fn set_consumer_state(&self, state: ConsumerState) {
		let changed = self.consumer.send_if_modified(|current| {
			if *current == state {
				return false;
			}

			*current = state;

			true
		});

		if changed {
			self.record(SyncEvent::ConsumerStateChanged { state });
		}
	}

	pub fn record(&self, event: SyncEvent) {
		match &event {
			SyncEvent::MutationSynced { .. } => bump(&self.synced, 1),
			SyncEvent::MutationFailed { transient: true, error, .. } => {
				bump(&self.transient_failures, 1);
				self.set_last_error(error);
			},
			SyncEvent::MutationFailed { transient: false, error, .. } => {
				bump(&self.rejections, 1);
				self.set_last_error(error);
			},
			SyncEvent::MutationQuarantined { error, .. } => {
				bump(&self.quarantined, 1);
				self.set_last_error(error);
			},
			SyncEvent::BatchApplied { applied, .. } => bump(&self.rows_applied, *applied),
			SyncEvent::RowSkipped { error, .. } => {
				bump(&self.rows_skipped, 1);
				self.set_last_error(error);
			},
			SyncEvent::StreamError { error } => self.set_last_error(error),
			SyncEvent::IndexFailed { error, .. } | SyncEvent::VectorRemoveFailed { error, .. } => {
				bump(&self.index_failures, 1);
				self.set_last_error(error);
			},
			SyncEvent::ConsumerStateChanged { .. } | SyncEvent::Indexed { .. } => {},
		}

		// No receivers is not an error.
		let _ = self.events.send(event);
	}

	pub fn snapshot(&self) -> HealthSnapshot {
		HealthSnapshot {
			synced: self.synced.load(Ordering::Relaxed),
			transient_failures: self.transient_failures.load(Ordering::Relaxed),
			rejections: self.rejections.load(Ordering::Relaxed),
			quarantined: self.quarantined.load(Ordering::Relaxed),
			rows_applied: self.rows_applied.load(Ordering::Relaxed),
			rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
			index_failures: self.index_failures.load(Ordering::Relaxed),
			last_error: self.last_error.lock().unwrap_or_else(|err| err.into_inner()).clone(),
			consumer: self.consumer_state(),
		}
	}

	fn set_last_error(&self, error: &str) {
		*self.last_error.lock().unwrap_or_else(|err| err.into_inner()) = Some(error.to_string());
	}
}
impl Default for Health {
	fn default() -> Self {
		Self::new()
	}
}

fn bump(counter: &AtomicU64, by: u64) {
	counter.fetch_add(by, Ordering::Relaxed);
}
