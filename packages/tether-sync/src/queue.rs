//! Outbound replication of local writes.
//!
//! Mutations drain strictly in `seq` order. A transient failure blocks the queue until a later
//! trigger succeeds. A rejection blocks it too, until the mutation has been rejected
//! `max_rejections` times; it is then quarantined so later mutations can proceed.

use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::{
	sync::{Mutex, Notify, watch},
	task::JoinHandle,
};

use crate::{
	Connectivity, RemoteStore, Result,
	health::{Health, SyncEvent},
};
use tether_storage::{
	db::Db,
	models::{MutationEntry, MutationOp},
	outbox,
};

const MAX_ERROR_CHARS: usize = 1_024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
	pub synced: u64,
	pub quarantined: u64,
	/// The mutation that stopped the drain, if any.
	pub blocked_on: Option<i64>,
	/// Another drain held the single-flight guard; nothing was attempted.
	pub skipped: bool,
}

enum ApplyFailure {
	Undecodable(String),
	Remote(tether_providers::Error),
}

pub struct MutationQueue {
	db: Db,
	remote_cfg: tether_config::Remote,
	opts: tether_config::Queue,
	remote: Arc<dyn RemoteStore>,
	connectivity: Connectivity,
	health: Arc<Health>,
	drain_guard: Mutex<()>,
	wake: Notify,
	shutdown: watch::Sender<bool>,
	task: StdMutex<Option<JoinHandle<()>>>,
}
impl MutationQueue {
	pub fn new(
		db: Db,
		remote_cfg: tether_config::Remote,
		opts: tether_config::Queue,
		remote: Arc<dyn RemoteStore>,
		connectivity: Connectivity,
		health: Arc<Health>,
	) -> Self {
		let (shutdown, _) = watch::channel(false);

		Self {
			db,
			remote_cfg,
			opts,
			remote,
			connectivity,
			health,
			drain_guard: Mutex::new(()),
			wake: Notify::new(),
			shutdown,
			task: StdMutex::new(None),
		}
	}

	/// Persists a pending mutation and wakes the trigger loop when online. Never waits for the
	/// drain.
	pub async fn enqueue(&self, table: &str, op: MutationOp, data: &Value) -> Result<i64> {
		let seq =
			outbox::enqueue_mutation(&self.db.pool, table, op, data, OffsetDateTime::now_utc())
				.await?;

		tracing::debug!(seq, table, op = %op, "Enqueued mutation.");

		self.notify_enqueued();

		Ok(seq)
	}

	/// Signals that mutations were committed through another transaction.
	pub fn notify_enqueued(&self) {
		if self.connectivity.is_online() {
			self.wake.notify_one();
		}
	}

	/// Applies pending mutations in order. A call made while another drain runs, or after `stop()`
	/// until the next `start()`, is a no-op that reports `skipped`. Nothing is applied while
	/// offline.
	pub async fn drain(&self) -> Result<DrainReport> {
		if self.is_stopped() {
			tracing::debug!("Queue is stopped; skipping drain.");

			return Ok(DrainReport { skipped: true, ..Default::default() });
		}

		let Ok(_guard) = self.drain_guard.try_lock() else {
			return Ok(DrainReport { skipped: true, ..Default::default() });
		};

		self.drain_locked().await
	}

	pub fn is_stopped(&self) -> bool {
		*self.shutdown.borrow()
	}

	pub async fn pending_count(&self) -> Result<i64> {
		Ok(outbox::pending_count(&self.db.pool).await?)
	}

	pub async fn pending(&self) -> Result<Vec<MutationEntry>> {
		Ok(outbox::fetch_pending(&self.db.pool).await?)
	}

	pub async fn quarantined(&self) -> Result<Vec<MutationEntry>> {
		Ok(outbox::list_quarantined(&self.db.pool).await?)
	}

	/// Returns quarantined mutations to the pending set with a fresh attempt budget.
	pub async fn requeue_quarantined(&self) -> Result<u64> {
		let count = outbox::requeue_quarantined(&self.db.pool, OffsetDateTime::now_utc()).await?;

		if count > 0 {
			tracing::info!(count, "Requeued quarantined mutations.");
			self.notify_enqueued();
		}

		Ok(count)
	}

	pub async fn prune_synced(&self, older_than: OffsetDateTime) -> Result<u64> {
		Ok(outbox::prune_synced(&self.db.pool, older_than).await?)
	}

	/// Spawns the trigger loop. A second call while it runs is a no-op.
	pub fn start(self: &Arc<Self>) {
		let mut task = self.task.lock().unwrap_or_else(|err| err.into_inner());

		if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
			return;
		}

		self.shutdown.send_replace(false);

		*task = Some(tokio::spawn(self.clone().trigger_loop(self.shutdown.subscribe())));
	}

	/// Stops the trigger loop after the in-flight mutation, if any, completes.
	pub async fn stop(&self) {
		self.shutdown.send_replace(true);

		let handle = self.task.lock().unwrap_or_else(|err| err.into_inner()).take();

		if let Some(handle) = handle
			&& let Err(err) = handle.await
		{
			tracing::warn!(error = %err, "Queue trigger loop ended abnormally.");
		}
	}

	async fn trigger_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut online = self.connectivity.subscribe();
		let mut blocked_attempts: u32 = 0;

		loop {
			if *shutdown.borrow() {
				break;
			}

			if self.connectivity.is_online() {
				let _guard = self.drain_guard.lock().await;

				match self.drain_locked().await {
					Ok(report) if report.blocked_on.is_some() => blocked_attempts += 1,
					Ok(_) => blocked_attempts = 0,
					Err(err) => {
						tracing::warn!(error = %err, "Queue drain failed.");

						blocked_attempts += 1;
					},
				}
			}

			let retry = (blocked_attempts > 0 && self.connectivity.is_online()).then(|| {
				crate::backoff_for_attempt(
					blocked_attempts,
					self.opts.base_backoff_ms,
					self.opts.max_backoff_ms,
				)
			});

			tokio::select! {
				changed = shutdown.changed() => {
					if changed.is_err() {
						break;
					}
				},
				_ = self.wake.notified() => {},
				changed = online.changed() => {
					if changed.is_err() {
						break;
					}
				},
				_ = tokio::time::sleep(retry.unwrap_or_default()), if retry.is_some() => {},
			}
		}

		tracing::debug!("Queue trigger loop stopped.");
	}

	async fn drain_locked(&self) -> Result<DrainReport> {
		let mut report = DrainReport::default();
		let pending = outbox::fetch_pending(&self.db.pool).await?;

		for entry in pending {
			if self.is_stopped() || !self.connectivity.is_online() {
				tracing::debug!(seq = entry.seq, "Drain interrupted before mutation.");

				break;
			}

			let attempts = entry.attempts.saturating_add(1);
			let now = OffsetDateTime::now_utc();

			match self.apply(&entry).await {
				Ok(()) => {
					outbox::mark_synced(&self.db.pool, entry.seq, now).await?;

					report.synced += 1;

					tracing::debug!(seq = entry.seq, "Mutation synced.");
					self.health.record(SyncEvent::MutationSynced { seq: entry.seq });
				},
				Err(ApplyFailure::Undecodable(message)) => {
					let error = sanitize_error(&message);

					outbox::quarantine(&self.db.pool, entry.seq, attempts, &error, now).await?;

					report.quarantined += 1;

					tracing::warn!(
						seq = entry.seq,
						error = %error,
						"Quarantined undecodable mutation."
					);
					self.health.record(SyncEvent::MutationQuarantined {
						seq: entry.seq,
						attempts,
						error,
					});
				},
				Err(ApplyFailure::Remote(err)) => {
					let transient = err.is_transient();
					let error = sanitize_error(&err.to_string());

					self.health.record(SyncEvent::MutationFailed {
						seq: entry.seq,
						attempts,
						transient,
						error: error.clone(),
					});

					if !transient && attempts >= self.opts.max_rejections as i64 {
						outbox::quarantine(&self.db.pool, entry.seq, attempts, &error, now)
							.await?;

						report.quarantined += 1;

						tracing::warn!(
							seq = entry.seq,
							attempts,
							error = %error,
							"Quarantined rejected mutation."
						);
						self.health.record(SyncEvent::MutationQuarantined {
							seq: entry.seq,
							attempts,
							error,
						});

						continue;
					}

					outbox::record_failure(&self.db.pool, entry.seq, attempts, &error, now).await?;

					report.blocked_on = Some(entry.seq);

					tracing::warn!(
						seq = entry.seq,
						attempts,
						transient,
						error = %error,
						"Mutation failed; queue is blocked."
					);

					break;
				},
			}
		}

		if !self.opts.retain_synced && report.synced > 0 {
			outbox::prune_synced(&self.db.pool, OffsetDateTime::now_utc()).await?;
		}

		Ok(report)
	}

	async fn apply(&self, entry: &MutationEntry) -> Result<(), ApplyFailure> {
		let op = entry.op().map_err(|err| ApplyFailure::Undecodable(err.to_string()))?;
		let data: Value = serde_json::from_str(&entry.data).map_err(|err| {
			ApplyFailure::Undecodable(format!("Mutation snapshot is not JSON: {err}"))
		})?;
		let id = snapshot_id(&data).ok_or_else(|| {
			ApplyFailure::Undecodable("Mutation snapshot has no string id.".to_string())
		})?;
		let table = entry.table_name.as_str();
		let result = match op {
			MutationOp::Insert => self.remote.upsert(&self.remote_cfg, table, &data).await,
			MutationOp::Update => self.remote.update(&self.remote_cfg, table, &id, &data).await,
			MutationOp::Delete => self.remote.delete(&self.remote_cfg, table, &id).await,
		};

		result.map_err(ApplyFailure::Remote)
	}
}

fn snapshot_id(data: &Value) -> Option<String> {
	data.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()).map(str::to_string)
}

/// Redacts credentials and caps the length of error text before it is persisted.
pub fn sanitize_error(text: &str) -> String {
	let mut parts = Vec::new();
	let mut redact_next = false;

	for raw in text.split_whitespace() {
		let mut word = raw.to_string();

		if redact_next {
			word = "[REDACTED]".to_string();
			redact_next = false;
		}
		if raw.eq_ignore_ascii_case("bearer") {
			redact_next = true;
		}

		let lowered = raw.to_ascii_lowercase();

		for key in ["api_key", "apikey", "password", "secret", "token"] {
			if lowered.contains(key) && (lowered.contains('=') || lowered.contains(':')) {
				let sep = if raw.contains('=') { '=' } else { ':' };
				let prefix = raw.split(sep).next().unwrap_or(raw);

				word = format!("{prefix}{sep}[REDACTED]");

				break;
			}
		}

		parts.push(word);
	}

	let mut out = parts.join(" ");

	if out.chars().count() > MAX_ERROR_CHARS {
		out = out.chars().take(MAX_ERROR_CHARS).collect();
		out.push_str("...");
	}

	out
}
