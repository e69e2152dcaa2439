use sqlx::{QueryBuilder, Sqlite, SqliteExecutor};

use crate::{
	Result,
	models::{self, Record, RecordPatch, RecordRow},
};

const RECORD_COLUMNS: &str = "id, stream_id, opcode, delta, payload, scope, status, ts";

/// Insert-or-replace by `id`. Applying the same record twice converges to the same row.
pub async fn upsert_record<'e, E>(executor: E, record: &Record) -> Result<()>
where
	E: SqliteExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO records (id, stream_id, opcode, delta, payload, scope, status, ts)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (id) DO UPDATE
SET
	stream_id = excluded.stream_id,
	opcode = excluded.opcode,
	delta = excluded.delta,
	payload = excluded.payload,
	scope = excluded.scope,
	status = excluded.status,
	ts = excluded.ts",
	)
	.bind(record.id.as_str())
	.bind(record.stream_id.as_str())
	.bind(record.opcode)
	.bind(record.delta)
	.bind(record.payload.as_str())
	.bind(record.scope.as_str())
	.bind(record.status.as_str())
	.bind(models::timestamp_to_millis(record.timestamp))
	.execute(executor)
	.await?;

	Ok(())
}

/// Applies only the fields present in `patch`. Returns whether a row matched `id`.
pub async fn update_record<'e, E>(executor: E, id: &str, patch: &RecordPatch) -> Result<bool>
where
	E: SqliteExecutor<'e>,
{
	if patch.is_empty() {
		let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM records WHERE id = $1")
			.bind(id)
			.fetch_optional(executor)
			.await?;

		return Ok(exists.is_some());
	}

	let mut builder = QueryBuilder::<Sqlite>::new("UPDATE records SET ");
	let mut set = builder.separated(", ");

	if let Some(stream_id) = &patch.stream_id {
		set.push("stream_id = ").push_bind_unseparated(stream_id.clone());
	}
	if let Some(opcode) = patch.opcode {
		set.push("opcode = ").push_bind_unseparated(opcode);
	}
	if let Some(delta) = patch.delta {
		set.push("delta = ").push_bind_unseparated(delta);
	}
	if let Some(payload) = &patch.payload {
		set.push("payload = ").push_bind_unseparated(payload.clone());
	}
	if let Some(scope) = patch.scope {
		set.push("scope = ").push_bind_unseparated(scope.as_str());
	}
	if let Some(status) = patch.status {
		set.push("status = ").push_bind_unseparated(status.as_str());
	}
	if let Some(timestamp) = patch.timestamp {
		set.push("ts = ").push_bind_unseparated(models::timestamp_to_millis(timestamp));
	}

	builder.push(" WHERE id = ").push_bind(id.to_string());

	let result = builder.build().execute(executor).await?;

	Ok(result.rows_affected() > 0)
}

/// Returns whether a row was removed. Deleting an absent id is not an error.
pub async fn delete_record<'e, E>(executor: E, id: &str) -> Result<bool>
where
	E: SqliteExecutor<'e>,
{
	let result = sqlx::query("DELETE FROM records WHERE id = $1").bind(id).execute(executor).await?;

	Ok(result.rows_affected() > 0)
}

pub async fn get_record<'e, E>(executor: E, id: &str) -> Result<Option<Record>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = $1");
	let row = sqlx::query_as::<_, RecordRow>(&sql).bind(id).fetch_optional(executor).await?;

	row.map(Record::try_from).transpose()
}

/// All records, newest first.
pub async fn list_records<'e, E>(executor: E) -> Result<Vec<Record>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY ts DESC, id ASC");
	let rows = sqlx::query_as::<_, RecordRow>(&sql).fetch_all(executor).await?;

	rows.into_iter().map(Record::try_from).collect()
}

pub async fn list_stream<'e, E>(executor: E, stream_id: &str) -> Result<Vec<Record>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!(
		"SELECT {RECORD_COLUMNS} FROM records WHERE stream_id = $1 ORDER BY ts DESC, id ASC"
	);
	let rows = sqlx::query_as::<_, RecordRow>(&sql).bind(stream_id).fetch_all(executor).await?;

	rows.into_iter().map(Record::try_from).collect()
}

pub async fn count_records<'e, E>(executor: E) -> Result<i64>
where
	E: SqliteExecutor<'e>,
{
	Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM records").fetch_one(executor).await?)
}
