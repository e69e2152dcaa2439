use serde_json::Value;
use sqlx::SqliteExecutor;
use time::OffsetDateTime;

use crate::{
	Result,
	models::{self, MutationEntry, MutationOp},
};

const MUTATION_COLUMNS: &str = "\
seq,
	table_name,
	op,
	data,
	synced,
	attempts,
	last_error,
	quarantined,
	created_at,
	updated_at";

/// Appends a pending mutation and returns its sequence id.
pub async fn enqueue_mutation<'e, E>(
	executor: E,
	table: &str,
	op: MutationOp,
	data: &Value,
	now: OffsetDateTime,
) -> Result<i64>
where
	E: SqliteExecutor<'e>,
{
	let data = serde_json::to_string(data)?;
	let now = models::timestamp_to_millis(now);
	let result = sqlx::query(
		"\
INSERT INTO mutation_queue (table_name, op, data, synced, attempts, quarantined, created_at, updated_at)
VALUES ($1, $2, $3, 0, 0, 0, $4, $4)",
	)
	.bind(table)
	.bind(op.as_str())
	.bind(data)
	.bind(now)
	.execute(executor)
	.await?;

	Ok(result.last_insert_rowid())
}

/// Pending mutations in creation order. `seq` is monotonic, so it is the creation order.
pub async fn fetch_pending<'e, E>(executor: E) -> Result<Vec<MutationEntry>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!(
		"\
SELECT
	{MUTATION_COLUMNS}
FROM mutation_queue
WHERE synced = 0 AND quarantined = 0
ORDER BY seq ASC"
	);

	Ok(sqlx::query_as::<_, MutationEntry>(&sql).fetch_all(executor).await?)
}

pub async fn get_mutation<'e, E>(executor: E, seq: i64) -> Result<Option<MutationEntry>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!("SELECT {MUTATION_COLUMNS} FROM mutation_queue WHERE seq = $1");

	Ok(sqlx::query_as::<_, MutationEntry>(&sql).bind(seq).fetch_optional(executor).await?)
}

pub async fn list_mutations<'e, E>(executor: E) -> Result<Vec<MutationEntry>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!("SELECT {MUTATION_COLUMNS} FROM mutation_queue ORDER BY seq ASC");

	Ok(sqlx::query_as::<_, MutationEntry>(&sql).fetch_all(executor).await?)
}

pub async fn list_quarantined<'e, E>(executor: E) -> Result<Vec<MutationEntry>>
where
	E: SqliteExecutor<'e>,
{
	let sql = format!(
		"SELECT {MUTATION_COLUMNS} FROM mutation_queue WHERE quarantined = 1 ORDER BY seq ASC"
	);

	Ok(sqlx::query_as::<_, MutationEntry>(&sql).fetch_all(executor).await?)
}

pub async fn pending_count<'e, E>(executor: E) -> Result<i64>
where
	E: SqliteExecutor<'e>,
{
	Ok(sqlx::query_scalar::<_, i64>(
		"SELECT COUNT(*) FROM mutation_queue WHERE synced = 0 AND quarantined = 0",
	)
	.fetch_one(executor)
	.await?)
}

pub async fn mark_synced<'e, E>(executor: E, seq: i64, now: OffsetDateTime) -> Result<()>
where
	E: SqliteExecutor<'e>,
{
	sqlx::query("UPDATE mutation_queue SET synced = 1, updated_at = $1 WHERE seq = $2")
		.bind(models::timestamp_to_millis(now))
		.bind(seq)
		.execute(executor)
		.await?;

	Ok(())
}

/// Records a failed attempt. The mutation stays pending.
pub async fn record_failure<'e, E>(
	executor: E,
	seq: i64,
	attempts: i64,
	error: &str,
	now: OffsetDateTime,
) -> Result<()>
where
	E: SqliteExecutor<'e>,
{
	sqlx::query(
		"\
UPDATE mutation_queue
SET attempts = $1,
	last_error = $2,
	updated_at = $3
WHERE seq = $4",
	)
	.bind(attempts)
	.bind(error)
	.bind(models::timestamp_to_millis(now))
	.bind(seq)
	.execute(executor)
	.await?;

	Ok(())
}

/// Moves a mutation out of the pending set so later mutations can proceed.
pub async fn quarantine<'e, E>(
	executor: E,
	seq: i64,
	attempts: i64,
	error: &str,
	now: OffsetDateTime,
) -> Result<()>
where
	E: SqliteExecutor<'e>,
{
	sqlx::query(
		"\
UPDATE mutation_queue
SET quarantined = 1,
	attempts = $1,
	last_error = $2,
	updated_at = $3
WHERE seq = $4",
	)
	.bind(attempts)
	.bind(error)
	.bind(models::timestamp_to_millis(now))
	.bind(seq)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn requeue_quarantined<'e, E>(executor: E, now: OffsetDateTime) -> Result<u64>
where
	E: SqliteExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE mutation_queue
SET quarantined = 0,
	attempts = 0,
	updated_at = $1
WHERE quarantined = 1",
	)
	.bind(models::timestamp_to_millis(now))
	.execute(executor)
	.await?;

	Ok(result.rows_affected())
}

/// Deletes synced mutations last touched before `before`.
pub async fn prune_synced<'e, E>(executor: E, before: OffsetDateTime) -> Result<u64>
where
	E: SqliteExecutor<'e>,
{
	let result = sqlx::query("DELETE FROM mutation_queue WHERE synced = 1 AND updated_at <= $1")
		.bind(models::timestamp_to_millis(before))
		.execute(executor)
		.await?;

	Ok(result.rows_affected())
}
