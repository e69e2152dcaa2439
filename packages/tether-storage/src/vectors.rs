use std::cmp::Ordering;

use serde_json::{Map, Value};
use sqlx::SqliteExecutor;
use time::OffsetDateTime;

use crate::{
	Error, Result,
	db::Db,
	models::{self, VectorEntry, VectorHit, VectorStats},
	schema,
};

#[derive(sqlx::FromRow)]
struct VectorRow {
	doc_id: String,
	vector: Option<String>,
	dim: i64,
	content: String,
	content_hash: String,
	metadata: Option<String>,
}

/// `doc_id -> vector` index answered by brute-force cosine scan. Sized for a device-local
/// corpus of hundreds to low thousands of entries.
#[derive(Clone, Debug)]
pub struct VectorStore {
	db: Db,
	vector_dim: u32,
}
impl VectorStore {
	pub async fn open(db: Db, vector_dim: u32) -> Result<Self> {
		if vector_dim == 0 {
			return Err(Error::InvalidArgument("Vector dimension must be positive.".to_string()));
		}

		db.apply_schema(&schema::render_vector_schema()).await?;

		Ok(Self { db, vector_dim })
	}

	pub fn vector_dim(&self) -> u32 {
		self.vector_dim
	}

	pub async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
		self.validate_vector(&entry.vector)?;

		upsert_entry(&self.db.pool, entry, OffsetDateTime::now_utc()).await
	}

	pub async fn delete(&self, doc_id: &str) -> Result<bool> {
		let result = sqlx::query("DELETE FROM vector_index WHERE doc_id = $1")
			.bind(doc_id)
			.execute(&self.db.pool)
			.await?;

		Ok(result.rows_affected() > 0)
	}

	pub async fn delete_batch(&self, doc_ids: &[String]) -> Result<u64> {
		let mut tx = self.db.pool.begin().await?;
		let mut removed = 0;

		for doc_id in doc_ids {
			let result = sqlx::query("DELETE FROM vector_index WHERE doc_id = $1")
				.bind(doc_id.as_str())
				.execute(&mut *tx)
				.await?;

			removed += result.rows_affected();
		}

		tx.commit().await?;

		Ok(removed)
	}

	pub async fn clear(&self) -> Result<u64> {
		let result = sqlx::query("DELETE FROM vector_index").execute(&self.db.pool).await?;

		Ok(result.rows_affected())
	}

	/// Swaps the whole index for `entries` in one transaction.
	pub async fn replace_all(&self, entries: &[VectorEntry]) -> Result<()> {
		for entry in entries {
			self.validate_vector(&entry.vector)?;
		}

		let now = OffsetDateTime::now_utc();
		let mut tx = self.db.pool.begin().await?;

		sqlx::query("DELETE FROM vector_index").execute(&mut *tx).await?;

		for entry in entries {
			upsert_entry(&mut *tx, entry, now).await?;
		}

		tx.commit().await?;

		Ok(())
	}

	pub async fn get(&self, doc_id: &str) -> Result<Option<VectorEntry>> {
		let row = sqlx::query_as::<_, VectorRow>(
			"\
SELECT doc_id, vector, dim, content, content_hash, metadata
FROM vector_index
WHERE doc_id = $1",
		)
		.bind(doc_id)
		.fetch_optional(&self.db.pool)
		.await?;

		row.map(decode_row).transpose()
	}

	/// Top `k` entries by descending cosine similarity. Equal scores order by `doc_id`.
	pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
		self.validate_vector(query)?;

		if k == 0 {
			return Ok(Vec::new());
		}

		let rows = sqlx::query_as::<_, VectorRow>(
			"\
SELECT doc_id, vector, dim, content, content_hash, metadata
FROM vector_index
WHERE vector IS NOT NULL",
		)
		.fetch_all(&self.db.pool)
		.await?;
		let mut hits = Vec::with_capacity(rows.len());

		for row in rows {
			if row.dim != self.vector_dim as i64 {
				tracing::warn!(
					doc_id = %row.doc_id,
					dim = row.dim,
					expected = self.vector_dim,
					"Skipping vector with mismatched dimension."
				);

				continue;
			}

			let entry = match decode_row(row) {
				Ok(entry) => entry,
				Err(err) => {
					tracing::warn!(error = %err, "Skipping undecodable vector row.");

					continue;
				},
			};

			hits.push(VectorHit {
				score: cosine_similarity(query, &entry.vector),
				doc_id: entry.doc_id,
				content: entry.content,
				metadata: entry.metadata,
			});
		}

		Ok(rank_top_k(hits, k))
	}

	pub async fn stats(&self) -> Result<VectorStats> {
		let (total, embedded): (i64, i64) =
			sqlx::query_as("SELECT COUNT(*), COUNT(vector) FROM vector_index")
				.fetch_one(&self.db.pool)
				.await?;

		Ok(VectorStats { total: total.max(0) as u64, embedded: embedded.max(0) as u64 })
	}

	fn validate_vector(&self, vector: &[f32]) -> Result<()> {
		if vector.len() != self.vector_dim as usize {
			return Err(Error::InvalidArgument(format!(
				"Vector dimension {} does not match configured vector_dim {}.",
				vector.len(),
				self.vector_dim
			)));
		}
		if let Some(idx) = vector.iter().position(|value| !value.is_finite()) {
			return Err(Error::InvalidArgument(format!(
				"Vector contains a non-finite value at index {idx}."
			)));
		}

		Ok(())
	}
}

/// `dot(a, b) / (|a| * |b|)`, accumulated in f64. A zero-norm side scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
	let mut dot = 0.0_f64;
	let mut norm_a = 0.0_f64;
	let mut norm_b = 0.0_f64;

	for (x, y) in a.iter().zip(b.iter()) {
		let (x, y) = (*x as f64, *y as f64);

		dot += x * y;
		norm_a += x * x;
		norm_b += y * y;
	}

	if norm_a == 0.0 || norm_b == 0.0 {
		return 0.0;
	}

	(dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

pub fn format_vector_text(vec: &[f32]) -> String {
	let mut out = String::with_capacity(vec.len() * 8);

	out.push('[');

	for (idx, value) in vec.iter().enumerate() {
		if idx > 0 {
			out.push(',');
		}
		out.push_str(&value.to_string());
	}

	out.push(']');

	out
}

pub fn parse_vector_text(text: &str) -> Result<Vec<f32>> {
	let trimmed = text.trim();
	let without_brackets =
		trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')).ok_or_else(|| {
			Error::InvalidArgument("Vector text is not bracketed.".to_string())
		})?;

	if without_brackets.trim().is_empty() {
		return Ok(Vec::new());
	}

	let mut vec = Vec::new();

	for part in without_brackets.split(',') {
		let value: f32 = part.trim().parse().map_err(|_| {
			Error::InvalidArgument("Vector text contains a non-numeric value.".to_string())
		})?;

		vec.push(value);
	}

	Ok(vec)
}

/// Non-finite scores rank below every finite one.
fn rank_top_k(mut hits: Vec<VectorHit>, k: usize) -> Vec<VectorHit> {
	fn rank_score(hit: &VectorHit) -> f32 {
		if hit.score.is_finite() {
			hit.score
		} else {
			f32::NEG_INFINITY
		}
	}

	hits.sort_by(|a, b| match rank_score(b).total_cmp(&rank_score(a)) {
		Ordering::Equal => a.doc_id.cmp(&b.doc_id),
		other => other,
	});
	hits.truncate(k);

	hits
}

fn decode_row(row: VectorRow) -> Result<VectorEntry> {
	let vector = match row.vector.as_deref() {
		Some(text) => parse_vector_text(text)?,
		None => Vec::new(),
	};
	let metadata = match row.metadata.as_deref() {
		Some(text) => match serde_json::from_str::<Value>(text)? {
			Value::Object(map) => Some(map),
			Value::Null => None,
			_ =>
				return Err(Error::InvalidArgument(format!(
					"Metadata for {} is not an object.",
					row.doc_id
				))),
		},
		None => None,
	};

	Ok(VectorEntry {
		doc_id: row.doc_id,
		vector,
		content: row.content,
		content_hash: row.content_hash,
		metadata,
	})
}

fn encode_metadata(metadata: Option<&Map<String, Value>>) -> Result<Option<String>> {
	metadata.map(|map| serde_json::to_string(map).map_err(Error::from)).transpose()
}

async fn upsert_entry<'e, E>(executor: E, entry: &VectorEntry, now: OffsetDateTime) -> Result<()>
where
	E: SqliteExecutor<'e>,
{
	let metadata = encode_metadata(entry.metadata.as_ref())?;

	sqlx::query(
		"\
INSERT INTO vector_index (doc_id, vector, dim, content, content_hash, metadata, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (doc_id) DO UPDATE
SET
	vector = excluded.vector,
	dim = excluded.dim,
	content = excluded.content,
	content_hash = excluded.content_hash,
	metadata = excluded.metadata,
	updated_at = excluded.updated_at",
	)
	.bind(entry.doc_id.as_str())
	.bind(format_vector_text(&entry.vector))
	.bind(entry.vector.len() as i64)
	.bind(entry.content.as_str())
	.bind(entry.content_hash.as_str())
	.bind(metadata)
	.bind(models::timestamp_to_millis(now))
	.execute(executor)
	.await?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hit(doc_id: &str, score: f32) -> VectorHit {
		VectorHit { doc_id: doc_id.to_string(), score, content: String::new(), metadata: None }
	}

	#[test]
	fn identical_vectors_score_one() {
		let v = [0.3_f32, -1.2, 4.5, 0.01];

		assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
	}

	#[test]
	fn orthogonal_and_opposite_vectors() {
		assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
		assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < 1e-6);
	}

	#[test]
	fn zero_norm_scores_zero() {
		assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
	}

	#[test]
	fn ranking_breaks_ties_by_doc_id() {
		let ranked = rank_top_k(vec![hit("b", 0.5), hit("c", 0.9), hit("a", 0.5)], 3);
		let ids: Vec<_> = ranked.iter().map(|hit| hit.doc_id.as_str()).collect();

		assert_eq!(ids, vec!["c", "a", "b"]);
	}

	#[test]
	fn non_finite_scores_rank_last() {
		let ranked = rank_top_k(
			vec![hit("nan", f32::NAN), hit("low", -0.5), hit("inf", f32::INFINITY), hit("top", 1.0)],
			4,
		);
		let ids: Vec<_> = ranked.iter().map(|hit| hit.doc_id.as_str()).collect();

		assert_eq!(ids, vec!["top", "low", "inf", "nan"]);
	}

	#[test]
	fn ranking_truncates_to_k() {
		let ranked = rank_top_k(vec![hit("a", 0.1), hit("b", 0.2), hit("c", 0.3)], 2);

		assert_eq!(ranked.len(), 2);
		assert_eq!(ranked[0].doc_id, "c");
	}

	#[test]
	fn vector_text_round_trips() {
		let vec = vec![0.5_f32, -1.25, 3.0];

		assert_eq!(parse_vector_text(&format_vector_text(&vec)).expect("Parse failed."), vec);
		assert!(parse_vector_text("0.5,1.0").is_err());
	}
}
