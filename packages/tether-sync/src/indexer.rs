//! Background vector maintenance.
//!
//! Index work runs off the write path on a single worker task, so jobs for the same id apply in
//! submission order. A failed job never touches the record store.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::{
	Error, Result,
	embedder::{self, Embedder},
	health::{Health, SyncEvent},
};
use tether_storage::{
	db::Db,
	models::{self, Record, VectorEntry},
	records,
	vectors::VectorStore,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
	pub indexed: u64,
	pub failed: u64,
}

#[derive(Debug)]
pub enum IndexJob {
	Upsert { id: String, payload: String, metadata: Option<Map<String, Value>> },
	Remove { ids: Vec<String> },
	Flush(oneshot::Sender<()>),
	/// Re-embeds every record and swaps the table. Jobs submitted meanwhile wait behind it.
	Rebuild(oneshot::Sender<Result<RebuildReport>>),
}
impl IndexJob {
	pub fn for_record(record: &Record) -> Self {
		Self::Upsert {
			id: record.id.clone(),
			payload: record.payload.clone(),
			metadata: Some(record_metadata(record)),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
	Embedded,
	Unchanged,
}

#[derive(Clone, Debug)]
pub struct Indexer {
	tx: mpsc::UnboundedSender<IndexJob>,
}
impl Indexer {
	/// Spawns the worker. It exits once every `Indexer` handle is dropped.
	pub fn spawn(
		db: Db,
		embedder: Arc<Embedder>,
		vectors: VectorStore,
		health: Arc<Health>,
	) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();

		tokio::spawn(run_worker(rx, db, embedder, vectors, health));

		Self { tx }
	}

	pub fn submit(&self, job: IndexJob) {
		if self.tx.send(job).is_err() {
			tracing::warn!("Index worker has stopped; dropping job.");
		}
	}

	pub fn upsert(&self, record: &Record) {
		self.submit(IndexJob::for_record(record));
	}

	pub fn remove(&self, ids: Vec<String>) {
		if ids.is_empty() {
			return;
		}

		self.submit(IndexJob::Remove { ids });
	}

	/// Resolves once every job submitted before this call has finished.
	pub async fn flush(&self) {
		let (tx, rx) = oneshot::channel();

		self.submit(IndexJob::Flush(tx));

		let _ = rx.await;
	}

	/// Runs a full rebuild on the worker and waits for its report.
	pub async fn rebuild(&self) -> Result<RebuildReport> {
		let (tx, rx) = oneshot::channel();

		self.submit(IndexJob::Rebuild(tx));

		rx.await.map_err(|_| Error::Storage { message: "Index worker has stopped.".to_string() })?
	}
}

/// Embeds `payload` and upserts its entry. Skips the provider when the stored entry was built
/// from the same text.
pub async fn index_payload(
	embedder: &Embedder,
	vectors: &VectorStore,
	id: &str,
	payload: &str,
	metadata: Option<Map<String, Value>>,
) -> Result<IndexOutcome> {
	let text = embedder::payload_text(payload);
	let hash = models::content_hash(&text);

	if let Some(existing) = vectors.get(id).await?
		&& existing.content_hash == hash
		&& !existing.vector.is_empty()
	{
		if existing.metadata != metadata {
			vectors.upsert(&VectorEntry { metadata, ..existing }).await?;
		}

		return Ok(IndexOutcome::Unchanged);
	}

	let vector = embedder.embed(&text).await?;

	vectors.upsert(&VectorEntry::new(id, vector, text, metadata)).await?;

	Ok(IndexOutcome::Embedded)
}

pub fn record_metadata(record: &Record) -> Map<String, Value> {
	let mut metadata = Map::new();

	metadata.insert("streamId".to_string(), Value::from(record.stream_id.as_str()));
	metadata.insert("opcode".to_string(), Value::from(record.opcode));
	metadata.insert("scope".to_string(), Value::from(record.scope.as_str()));
	metadata.insert("status".to_string(), Value::from(record.status.as_str()));

	metadata
}

/// Lists records inside the worker so a delete committed after the listing has its `Remove` job
/// queued behind this rebuild.
async fn rebuild_index(
	db: &Db,
	embedder: &Embedder,
	vectors: &VectorStore,
	health: &Health,
) -> Result<RebuildReport> {
	let records = records::list_records(&db.pool).await?;
	let mut report = RebuildReport::default();
	let mut entries = Vec::with_capacity(records.len());

	for record in &records {
		let text = embedder::payload_text(&record.payload);

		match embedder.embed(&text).await {
			Ok(vector) => {
				entries.push(VectorEntry::new(
					record.id.as_str(),
					vector,
					text,
					Some(record_metadata(record)),
				));

				report.indexed += 1;
			},
			Err(err) => {
				report.failed += 1;

				tracing::warn!(
					doc_id = %record.id,
					error = %err,
					"Failed to embed record during rebuild."
				);
				health.record(SyncEvent::IndexFailed {
					doc_id: record.id.clone(),
					error: err.to_string(),
				});
			},
		}
	}

	vectors.replace_all(&entries).await?;

	tracing::info!(indexed = report.indexed, failed = report.failed, "Rebuilt vector index.");

	Ok(report)
}

async fn run_worker(
	mut rx: mpsc::UnboundedReceiver<IndexJob>,
	db: Db,
	embedder: Arc<Embedder>,
	vectors: VectorStore,
	health: Arc<Health>,
) {
	while let Some(job) = rx.recv().await {
		match job {
			IndexJob::Upsert { id, payload, metadata } => {
				match index_payload(&embedder, &vectors, &id, &payload, metadata).await {
					Ok(IndexOutcome::Embedded) => {
						tracing::debug!(doc_id = %id, "Indexed record.");
						health.record(SyncEvent::Indexed { doc_id: id });
					},
					Ok(IndexOutcome::Unchanged) => {
						tracing::debug!(doc_id = %id, "Record text unchanged; skipped embedding.");
					},
					Err(err) => {
						tracing::warn!(doc_id = %id, error = %err, "Failed to index record.");
						health.record(SyncEvent::IndexFailed {
							doc_id: id,
							error: err.to_string(),
						});
					},
				}
			},
			IndexJob::Remove { ids } => {
				if let Err(err) = vectors.delete_batch(&ids).await {
					tracing::warn!(count = ids.len(), error = %err, "Failed to remove vectors.");
					health.record(SyncEvent::VectorRemoveFailed {
						doc_ids: ids,
						error: err.to_string(),
					});
				}
			},
			IndexJob::Flush(done) => {
				let _ = done.send(());
			},
			IndexJob::Rebuild(done) => {
				let _ = done.send(rebuild_index(&db, &embedder, &vectors, &health).await);
			},
		}
	}
}
