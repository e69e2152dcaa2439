use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub remote: Remote,
	pub providers: Providers,
	#[serde(default)]
	pub sync: SyncOptions,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Storage {
	pub sqlite: Sqlite,
	pub vectors: Vectors,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Sqlite {
	pub path: String,
	#[serde(default = "default_pool_max_conns")]
	pub pool_max_conns: u32,
	#[serde(default = "default_busy_timeout_ms")]
	pub busy_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Vectors {
	/// Optional. When absent the vector index shares the record database file.
	pub path: Option<String>,
	pub vector_dim: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Remote {
	pub api_base: String,
	pub api_key: String,
	#[serde(default = "default_rest_path")]
	pub rest_path: String,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
	pub feed: Feed,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Feed {
	pub api_base: String,
	#[serde(default = "default_feed_path")]
	pub path: String,
	pub table: String,
	/// Long-poll requests stay open on the server side, so this should exceed its live timeout.
	pub timeout_ms: u64,
	/// Extra query parameters appended to every shape request, e.g. `source_id`.
	#[serde(default)]
	pub params: Map<String, Value>,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncOptions {
	#[serde(default)]
	pub queue: Queue,
	#[serde(default)]
	pub stream: Stream,
	#[serde(default)]
	pub connectivity: Connectivity,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Queue {
	#[serde(default = "default_queue_base_backoff_ms")]
	pub base_backoff_ms: u64,
	#[serde(default = "default_queue_max_backoff_ms")]
	pub max_backoff_ms: u64,
	/// Rejections tolerated before a mutation is quarantined.
	#[serde(default = "default_max_rejections")]
	pub max_rejections: u32,
	#[serde(default = "default_retain_synced")]
	pub retain_synced: bool,
}
impl Default for Queue {
	fn default() -> Self {
		Self {
			base_backoff_ms: default_queue_base_backoff_ms(),
			max_backoff_ms: default_queue_max_backoff_ms(),
			max_rejections: default_max_rejections(),
			retain_synced: default_retain_synced(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct Stream {
	#[serde(default = "default_stream_base_backoff_ms")]
	pub base_backoff_ms: u64,
	#[serde(default = "default_stream_max_backoff_ms")]
	pub max_backoff_ms: u64,
}
impl Default for Stream {
	fn default() -> Self {
		Self {
			base_backoff_ms: default_stream_base_backoff_ms(),
			max_backoff_ms: default_stream_max_backoff_ms(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct Connectivity {
	#[serde(default = "default_probe_interval_ms")]
	pub probe_interval_ms: u64,
}
impl Default for Connectivity {
	fn default() -> Self {
		Self { probe_interval_ms: default_probe_interval_ms() }
	}
}

fn default_pool_max_conns() -> u32 {
	4
}

fn default_busy_timeout_ms() -> u64 {
	5_000
}

fn default_rest_path() -> String {
	"/rest/v1".to_string()
}

fn default_feed_path() -> String {
	"/v1/shape".to_string()
}

fn default_queue_base_backoff_ms() -> u64 {
	500
}

fn default_queue_max_backoff_ms() -> u64 {
	30_000
}

fn default_max_rejections() -> u32 {
	3
}

fn default_retain_synced() -> bool {
	true
}

fn default_stream_base_backoff_ms() -> u64 {
	1_000
}

fn default_stream_max_backoff_ms() -> u64 {
	60_000
}

fn default_probe_interval_ms() -> u64 {
	15_000
}
