use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
	Private,
	Shared,
}
impl Scope {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Private => "private",
			Self::Shared => "shared",
		}
	}
}
impl FromStr for Scope {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw {
			"private" => Ok(Self::Private),
			"shared" => Ok(Self::Shared),
			other => Err(Error::InvalidArgument(format!("Unknown scope {other:?}."))),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
	Active,
	Done,
	Closed,
}
impl RecordStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Active => "active",
			Self::Done => "done",
			Self::Closed => "closed",
		}
	}
}
impl FromStr for RecordStatus {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw {
			"active" => Ok(Self::Active),
			"done" => Ok(Self::Done),
			"closed" => Ok(Self::Closed),
			other => Err(Error::InvalidArgument(format!("Unknown record status {other:?}."))),
		}
	}
}

/// A working-memory row. `id` is the idempotence key for local and remote upserts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
	pub id: String,
	pub stream_id: String,
	pub opcode: i64,
	pub delta: Option<f64>,
	/// Opaque to this crate. Interpretation belongs to the caller.
	pub payload: String,
	pub scope: Scope,
	pub status: RecordStatus,
	#[serde(rename = "ts", with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
}
impl Record {
	pub fn snapshot(&self) -> Result<Value> {
		Ok(serde_json::to_value(self)?)
	}
}

/// Partial update. `None` leaves a column untouched; `delta: Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordPatch {
	pub stream_id: Option<String>,
	pub opcode: Option<i64>,
	pub delta: Option<Option<f64>>,
	pub payload: Option<String>,
	pub scope: Option<Scope>,
	pub status: Option<RecordStatus>,
	pub timestamp: Option<OffsetDateTime>,
}
impl RecordPatch {
	pub fn is_empty(&self) -> bool {
		self.stream_id.is_none()
			&& self.opcode.is_none()
			&& self.delta.is_none()
			&& self.payload.is_none()
			&& self.scope.is_none()
			&& self.status.is_none()
			&& self.timestamp.is_none()
	}

	/// `{id, changed fields}` in the record wire format.
	pub fn snapshot(&self, id: &str) -> Result<Value> {
		let mut out = Map::new();

		out.insert("id".to_string(), Value::from(id));

		if let Some(stream_id) = &self.stream_id {
			out.insert("streamId".to_string(), Value::from(stream_id.as_str()));
		}
		if let Some(opcode) = self.opcode {
			out.insert("opcode".to_string(), Value::from(opcode));
		}
		if let Some(delta) = self.delta {
			out.insert("delta".to_string(), delta.map(Value::from).unwrap_or(Value::Null));
		}
		if let Some(payload) = &self.payload {
			out.insert("payload".to_string(), Value::from(payload.as_str()));
		}
		if let Some(scope) = self.scope {
			out.insert("scope".to_string(), Value::from(scope.as_str()));
		}
		if let Some(status) = self.status {
			out.insert("status".to_string(), Value::from(status.as_str()));
		}
		if let Some(timestamp) = self.timestamp {
			out.insert("ts".to_string(), serde_json::to_value(RfcTimestamp(timestamp))?);
		}

		Ok(Value::Object(out))
	}
}

#[derive(Serialize)]
struct RfcTimestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordRow {
	pub(crate) id: String,
	pub(crate) stream_id: String,
	pub(crate) opcode: i64,
	pub(crate) delta: Option<f64>,
	pub(crate) payload: String,
	pub(crate) scope: String,
	pub(crate) status: String,
	pub(crate) ts: i64,
}
impl TryFrom<RecordRow> for Record {
	type Error = Error;

	fn try_from(row: RecordRow) -> Result<Self> {
		Ok(Self {
			scope: row.scope.parse()?,
			status: row.status.parse()?,
			timestamp: millis_to_timestamp(row.ts)?,
			id: row.id,
			stream_id: row.stream_id,
			opcode: row.opcode,
			delta: row.delta,
			payload: row.payload,
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationOp {
	Insert,
	Update,
	Delete,
}
impl MutationOp {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Insert => "INSERT",
			Self::Update => "UPDATE",
			Self::Delete => "DELETE",
		}
	}
}
impl fmt::Display for MutationOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for MutationOp {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw {
			"INSERT" => Ok(Self::Insert),
			"UPDATE" => Ok(Self::Update),
			"DELETE" => Ok(Self::Delete),
			other => Err(Error::InvalidArgument(format!("Unknown mutation op {other:?}."))),
		}
	}
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct MutationEntry {
	pub seq: i64,
	pub table_name: String,
	pub op: String,
	/// Serialized snapshot: full row, `{id, changed fields}`, or `{id}`.
	pub data: String,
	pub synced: bool,
	pub attempts: i64,
	pub last_error: Option<String>,
	pub quarantined: bool,
	pub created_at: i64,
	pub updated_at: i64,
}
impl MutationEntry {
	pub fn op(&self) -> Result<MutationOp> {
		self.op.parse()
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorEntry {
	pub doc_id: String,
	pub vector: Vec<f32>,
	pub content: String,
	pub content_hash: String,
	pub metadata: Option<Map<String, Value>>,
}
impl VectorEntry {
	pub fn new(
		doc_id: impl Into<String>,
		vector: Vec<f32>,
		content: impl Into<String>,
		metadata: Option<Map<String, Value>>,
	) -> Self {
		let content = content.into();

		Self {
			doc_id: doc_id.into(),
			vector,
			content_hash: content_hash(&content),
			content,
			metadata,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VectorHit {
	pub doc_id: String,
	pub score: f32,
	pub content: String,
	pub metadata: Option<Map<String, Value>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VectorStats {
	pub total: u64,
	pub embedded: u64,
}

pub fn content_hash(text: &str) -> String {
	blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub fn timestamp_to_millis(ts: OffsetDateTime) -> i64 {
	(ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn millis_to_timestamp(millis: i64) -> Result<OffsetDateTime> {
	OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
		.map_err(|_| Error::InvalidArgument(format!("Timestamp {millis} is out of range.")))
}

/// Current UTC time at the millisecond precision the store keeps.
pub fn now_millis() -> OffsetDateTime {
	let now = OffsetDateTime::now_utc();

	now.replace_nanosecond(now.nanosecond() / 1_000_000 * 1_000_000).unwrap_or(now)
}
