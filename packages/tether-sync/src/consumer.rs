//! Inbound change stream.
//!
//! Each batch applies inside one transaction, with a savepoint per row so a bad row is skipped
//! without discarding its neighbours. Index work for applied rows is submitted only after the
//! batch commits.

use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqliteConnection;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
	ChangeFeed, ChangeMessage, ChangeOperation, Error, Result,
	health::{ConsumerState, Health, SyncEvent},
	indexer::{IndexJob, Indexer},
};
use tether_storage::{
	db::Db,
	models::{self, Record, RecordPatch},
	records,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
	pub applied: u64,
	pub skipped: u64,
	/// Updates addressed to ids that do not exist locally. These are no-ops.
	pub missing: u64,
	pub controls: u64,
}

enum RowOutcome {
	Applied(Option<IndexJob>),
	Missing,
}

pub struct StreamConsumer {
	db: Db,
	feed_cfg: tether_config::Feed,
	opts: tether_config::Stream,
	feed: Arc<dyn ChangeFeed>,
	indexer: Indexer,
	health: Arc<Health>,
	shutdown: watch::Sender<bool>,
	task: StdMutex<Option<JoinHandle<()>>>,
}
impl StreamConsumer {
	pub fn new(
		db: Db,
		feed_cfg: tether_config::Feed,
		opts: tether_config::Stream,
		feed: Arc<dyn ChangeFeed>,
		indexer: Indexer,
		health: Arc<Health>,
	) -> Self {
		let (shutdown, _) = watch::channel(false);

		Self {
			db,
			feed_cfg,
			opts,
			feed,
			indexer,
			health,
			shutdown,
			task: StdMutex::new(None),
		}
	}

	pub fn state(&self) -> ConsumerState {
		self.health.consumer_state()
	}

	/// Subscribes to the change feed in the background. A second call while running is a
	/// no-op.
	pub fn start(self: &Arc<Self>) {
		let mut task = self.task.lock().unwrap_or_else(|err| err.into_inner());

		if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
			return;
		}

		self.shutdown.send_replace(false);

		*task = Some(tokio::spawn(self.clone().run(self.shutdown.subscribe())));
	}

	/// Aborts the in-flight fetch and waits for the loop to exit. A batch that is already being
	/// applied finishes first.
	pub async fn stop(&self) {
		self.shutdown.send_replace(true);

		let handle = self.task.lock().unwrap_or_else(|err| err.into_inner()).take();

		if let Some(handle) = handle
			&& let Err(err) = handle.await
		{
			tracing::warn!(error = %err, "Stream consumer ended abnormally.");
		}

		self.health.set_consumer_state(ConsumerState::Disconnected);
	}

	/// Applies one batch of change messages in a single transaction.
	pub async fn apply_batch(&self, messages: &[ChangeMessage]) -> Result<BatchReport> {
		let mut report = BatchReport::default();
		let mut jobs = Vec::new();
		let mut tx = self.db.pool.begin().await?;

		for message in messages {
			if message.control().is_some() {
				report.controls += 1;

				continue;
			}

			sqlx::query("SAVEPOINT change_row").execute(&mut *tx).await?;

			match apply_row(&mut *tx, message).await {
				Ok(outcome) => {
					sqlx::query("RELEASE SAVEPOINT change_row").execute(&mut *tx).await?;

					match outcome {
						RowOutcome::Applied(job) => {
							report.applied += 1;

							jobs.extend(job);
						},
						RowOutcome::Missing => {
							report.missing += 1;

							tracing::debug!(
								id = row_id(message).as_deref().unwrap_or_default(),
								"Update for unknown record ignored."
							);
						},
					}
				},
				Err(err) => {
					sqlx::query("ROLLBACK TO SAVEPOINT change_row").execute(&mut *tx).await?;
					sqlx::query("RELEASE SAVEPOINT change_row").execute(&mut *tx).await?;

					report.skipped += 1;

					let id = row_id(message);

					tracing::warn!(
						id = id.as_deref().unwrap_or_default(),
						error = %err,
						"Skipped change row."
					);
					self.health.record(SyncEvent::RowSkipped { id, error: err.to_string() });
				},
			}
		}

		tx.commit().await?;

		for job in jobs {
			self.indexer.submit(job);
		}

		self.health.record(SyncEvent::BatchApplied {
			applied: report.applied,
			skipped: report.skipped,
			missing: report.missing,
			controls: report.controls,
		});

		Ok(report)
	}

	async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut failures: u32 = 0;

		'subscribe: loop {
			if *shutdown.borrow() {
				break;
			}

			self.health.set_consumer_state(ConsumerState::Connecting);

			match self.feed.subscribe(&self.feed_cfg) {
				Ok(mut subscription) => loop {
					let batch = tokio::select! {
						batch = subscription.next_batch() => batch,
						_ = shutdown.changed() => break 'subscribe,
					};

					match batch {
						Ok(messages) => {
							self.health.set_consumer_state(ConsumerState::Streaming);

							failures = 0;

							if messages.is_empty() {
								continue;
							}
							if let Err(err) = self.apply_batch(&messages).await {
								self.report_stream_error("Failed to apply change batch.", &err);

								break;
							}
						},
						Err(err) => {
							self.report_stream_error("Change feed request failed.", &err);

							break;
						},
					}
				},
				Err(err) => self.report_stream_error("Failed to subscribe to change feed.", &err),
			}

			self.health.set_consumer_state(ConsumerState::Disconnected);

			failures = failures.saturating_add(1);

			let delay = crate::backoff_for_attempt(
				failures,
				self.opts.base_backoff_ms,
				self.opts.max_backoff_ms,
			);

			tokio::select! {
				_ = tokio::time::sleep(delay) => {},
				_ = shutdown.changed() => break,
			}
		}

		self.health.set_consumer_state(ConsumerState::Disconnected);

		tracing::debug!("Stream consumer stopped.");
	}

	fn report_stream_error(&self, context: &str, err: &dyn std::fmt::Display) {
		tracing::warn!(error = %err, "{context}");
		self.health.record(SyncEvent::StreamError { error: err.to_string() });
	}
}

async fn apply_row(conn: &mut SqliteConnection, message: &ChangeMessage) -> Result<RowOutcome> {
	let Some(operation) = message.headers.operation else {
		return Err(local_apply("Change message has neither an operation nor a control."));
	};
	let Some(Value::Object(row)) = message.value.as_ref() else {
		return Err(local_apply("Change message value must be an object."));
	};

	match operation {
		ChangeOperation::Insert => {
			let record = decode_record(row)?;

			records::upsert_record(&mut *conn, &record).await?;

			Ok(RowOutcome::Applied(Some(IndexJob::for_record(&record))))
		},
		ChangeOperation::Update => {
			let id = decode_id(row)?;
			let patch = decode_patch(row)?;

			if !records::update_record(&mut *conn, &id, &patch).await? {
				return Ok(RowOutcome::Missing);
			}
			if patch.payload.is_none() {
				return Ok(RowOutcome::Applied(None));
			}

			let record = records::get_record(&mut *conn, &id).await?;

			Ok(RowOutcome::Applied(record.as_ref().map(IndexJob::for_record)))
		},
		ChangeOperation::Delete => {
			let id = decode_id(row)?;

			records::delete_record(&mut *conn, &id).await?;

			Ok(RowOutcome::Applied(Some(IndexJob::Remove { ids: vec![id] })))
		},
	}
}

fn row_id(message: &ChangeMessage) -> Option<String> {
	match message.value.as_ref() {
		Some(Value::Object(row)) => decode_id(row).ok(),
		_ => None,
	}
}

fn local_apply(message: &str) -> Error {
	Error::LocalApply { message: message.to_string() }
}

fn field<'a>(row: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
	row.get(camel).or_else(|| row.get(snake))
}

fn decode_id(row: &Map<String, Value>) -> Result<String> {
	match row.get("id") {
		Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
		Some(Value::Number(id)) => Ok(id.to_string()),
		_ => Err(local_apply("Change row is missing its id.")),
	}
}

/// Full row for an insert. Missing timestamps default to now.
fn decode_record(row: &Map<String, Value>) -> Result<Record> {
	let required = |camel: &str, snake: &str| {
		field(row, camel, snake)
			.filter(|value| !value.is_null())
			.ok_or_else(|| Error::LocalApply { message: format!("Change row is missing {camel}.") })
	};

	Ok(Record {
		id: decode_id(row)?,
		stream_id: decode_text(required("streamId", "stream_id")?, "streamId")?,
		opcode: decode_opcode(required("opcode", "opcode")?)?,
		delta: field(row, "delta", "delta").map(decode_delta).transpose()?.flatten(),
		payload: decode_payload(required("payload", "payload")?)?,
		scope: decode_text(required("scope", "scope")?, "scope")?.parse()?,
		status: decode_text(required("status", "status")?, "status")?.parse()?,
		timestamp: match field(row, "ts", "timestamp") {
			Some(value) if !value.is_null() => decode_timestamp(value)?,
			_ => models::now_millis(),
		},
	})
}

/// Only the fields present in the row. `delta: null` clears the column.
fn decode_patch(row: &Map<String, Value>) -> Result<RecordPatch> {
	let mut patch = RecordPatch::default();

	if let Some(value) = field(row, "streamId", "stream_id") {
		patch.stream_id = Some(decode_text(value, "streamId")?);
	}
	if let Some(value) = row.get("opcode") {
		patch.opcode = Some(decode_opcode(value)?);
	}
	if let Some(value) = row.get("delta") {
		patch.delta = Some(decode_delta(value)?);
	}
	if let Some(value) = row.get("payload") {
		patch.payload = Some(decode_payload(value)?);
	}
	if let Some(value) = row.get("scope") {
		patch.scope = Some(decode_text(value, "scope")?.parse()?);
	}
	if let Some(value) = row.get("status") {
		patch.status = Some(decode_text(value, "status")?.parse()?);
	}
	if let Some(value) = field(row, "ts", "timestamp") {
		patch.timestamp = Some(decode_timestamp(value)?);
	}

	Ok(patch)
}

fn decode_text(value: &Value, name: &str) -> Result<String> {
	match value {
		Value::String(text) => Ok(text.clone()),
		Value::Number(number) => Ok(number.to_string()),
		_ => Err(Error::LocalApply { message: format!("Change row field {name} must be text.") }),
	}
}

fn decode_opcode(value: &Value) -> Result<i64> {
	let parsed = match value {
		Value::Number(number) =>
			number.as_i64().or_else(|| {
				number.as_f64().filter(|value| value.fract() == 0.0).map(|value| value as i64)
			}),
		Value::String(text) => text.trim().parse::<i64>().ok(),
		_ => None,
	};

	parsed.ok_or_else(|| local_apply("Change row opcode must be an integer."))
}

fn decode_delta(value: &Value) -> Result<Option<f64>> {
	match value {
		Value::Null => Ok(None),
		Value::Number(number) => Ok(number.as_f64()),
		Value::String(text) if text.trim().is_empty() => Ok(None),
		Value::String(text) => text
			.trim()
			.parse::<f64>()
			.map(Some)
			.map_err(|_| local_apply("Change row delta must be numeric.")),
		_ => Err(local_apply("Change row delta must be numeric.")),
	}
}

/// Payload text is stored as received; structured payloads are stored serialized.
fn decode_payload(value: &Value) -> Result<String> {
	match value {
		Value::Null => Err(local_apply("Change row payload must not be null.")),
		Value::String(text) => Ok(text.clone()),
		other => Ok(serde_json::to_string(other)?),
	}
}

/// Accepts RFC 3339, Postgres text timestamps such as `2024-05-01 10:20:30.5+00`, and integer
/// epoch milliseconds.
fn decode_timestamp(value: &Value) -> Result<OffsetDateTime> {
	match value {
		Value::Number(number) => {
			let millis =
				number.as_i64().ok_or_else(|| local_apply("Change row ts is not an integer."))?;

			Ok(models::millis_to_timestamp(millis)?)
		},
		Value::String(text) => parse_timestamp_text(text).ok_or_else(|| Error::LocalApply {
			message: format!("Unparseable change row ts {text:?}."),
		}),
		_ => Err(local_apply("Change row ts must be text or epoch milliseconds.")),
	}
}

fn parse_timestamp_text(text: &str) -> Option<OffsetDateTime> {
	let trimmed = text.trim();

	if let Ok(ts) = OffsetDateTime::parse(trimmed, &Rfc3339) {
		return Some(truncate_to_millis(ts));
	}

	let mut normalized = trimmed.replacen(' ', "T", 1);

	// Postgres prints whole-hour offsets as `+00`.
	let short_offset = matches!(
		normalized.as_bytes(),
		[_, .., b'+' | b'-', hi, lo] if hi.is_ascii_digit() && lo.is_ascii_digit()
	);

	if short_offset {
		normalized.push_str(":00");
	}

	OffsetDateTime::parse(&normalized, &Rfc3339).ok().map(truncate_to_millis)
}

fn truncate_to_millis(ts: OffsetDateTime) -> OffsetDateTime {
	ts.replace_nanosecond(ts.nanosecond() / 1_000_000 * 1_000_000).unwrap_or(ts)
}
