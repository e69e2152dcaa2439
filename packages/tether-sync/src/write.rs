use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::{Error, Result, SyncEngine};
use tether_storage::{
	models::{self, MutationOp, Record, RecordPatch, RecordStatus, Scope},
	outbox, records,
};

/// A local write. A missing `id` is generated; `status` defaults to active and `ts` to now.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
	#[serde(default)]
	pub id: Option<String>,
	pub stream_id: String,
	pub opcode: i64,
	#[serde(default)]
	pub delta: Option<f64>,
	pub payload: String,
	pub scope: Scope,
	#[serde(default)]
	pub status: Option<RecordStatus>,
	#[serde(default, rename = "ts", with = "time::serde::rfc3339::option")]
	pub timestamp: Option<OffsetDateTime>,
}
impl NewRecord {
	fn into_record(self) -> Result<Record> {
		let id = match self.id {
			Some(id) if id.trim().is_empty() => {
				return Err(Error::InvalidRequest { message: "id must not be blank.".to_string() });
			},
			Some(id) => id,
			None => uuid::Uuid::new_v4().to_string(),
		};

		if self.stream_id.trim().is_empty() {
			return Err(Error::InvalidRequest {
				message: "streamId must not be blank.".to_string(),
			});
		}

		let timestamp = match self.timestamp {
			Some(ts) => models::millis_to_timestamp(models::timestamp_to_millis(ts))?,
			None => models::now_millis(),
		};

		Ok(Record {
			id,
			stream_id: self.stream_id,
			opcode: self.opcode,
			delta: self.delta,
			payload: self.payload,
			scope: self.scope,
			status: self.status.unwrap_or(RecordStatus::Active),
			timestamp,
		})
	}
}

impl SyncEngine {
	/// Commits the record and its insert mutation together, then wakes the queue and schedules
	/// indexing. Indexing failures never surface here.
	pub async fn create_record(&self, new: NewRecord) -> Result<Record> {
		let record = new.into_record()?;
		let snapshot = record.snapshot()?;
		let mut tx = self.db.pool.begin().await?;

		records::upsert_record(&mut *tx, &record).await?;

		let seq = outbox::enqueue_mutation(
			&mut *tx,
			self.table(),
			MutationOp::Insert,
			&snapshot,
			OffsetDateTime::now_utc(),
		)
		.await?;

		tx.commit().await?;

		tracing::debug!(id = %record.id, seq, "Created record.");

		self.queue().notify_enqueued();
		self.indexer().upsert(&record);

		Ok(record)
	}

	/// Applies a partial update. Only the changed fields travel in the mutation snapshot.
	pub async fn update_record(&self, id: &str, patch: RecordPatch) -> Result<Record> {
		if patch.is_empty() {
			return Err(Error::InvalidRequest { message: "Patch changes nothing.".to_string() });
		}

		let snapshot = patch.snapshot(id)?;
		let mut tx = self.db.pool.begin().await?;

		if !records::update_record(&mut *tx, id, &patch).await? {
			return Err(Error::NotFound { message: format!("Record {id} does not exist.") });
		}

		let seq = outbox::enqueue_mutation(
			&mut *tx,
			self.table(),
			MutationOp::Update,
			&snapshot,
			OffsetDateTime::now_utc(),
		)
		.await?;
		let Some(record) = records::get_record(&mut *tx, id).await? else {
			return Err(Error::NotFound { message: format!("Record {id} does not exist.") });
		};

		tx.commit().await?;

		tracing::debug!(id, seq, "Updated record.");

		self.queue().notify_enqueued();
		// Metadata follows status and scope changes even when the payload is unchanged.
		self.indexer().upsert(&record);

		Ok(record)
	}

	/// Returns whether a record was removed. Deleting an absent id enqueues nothing.
	pub async fn delete_record(&self, id: &str) -> Result<bool> {
		let mut tx = self.db.pool.begin().await?;

		if !records::delete_record(&mut *tx, id).await? {
			return Ok(false);
		}

		let mut data = serde_json::Map::new();

		data.insert("id".to_string(), Value::from(id));

		let seq = outbox::enqueue_mutation(
			&mut *tx,
			self.table(),
			MutationOp::Delete,
			&Value::Object(data),
			OffsetDateTime::now_utc(),
		)
		.await?;

		tx.commit().await?;

		tracing::debug!(id, seq, "Deleted record.");

		self.queue().notify_enqueued();
		self.indexer().remove(vec![id.to_string()]);

		Ok(true)
	}
}
