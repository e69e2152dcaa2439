mod error;

pub use error::{Error, Result};

use std::{
	future::Future,
	path::{Path, PathBuf},
	time::Duration,
};

use serde_json::Map;
use tempfile::TempDir;
use tokio::time::{self, Instant};

use tether_config::{
	Config, Connectivity, EmbeddingProviderConfig, Feed, Providers, Queue, Remote, Service, Sqlite,
	Storage, Stream, SyncOptions, Vectors,
};
use tether_storage::{db::Db, vectors::VectorStore};

pub const TEST_VECTOR_DIM: u32 = 4;

/// A throwaway SQLite file with the record, queue, and vector schemas applied.
///
/// In-memory SQLite gives each pooled connection its own database, so tests use a file under a
/// temporary directory instead. The directory is removed on drop.
pub struct TestStore {
	pub db: Db,
	pub vectors: VectorStore,
	dir: TempDir,
}
impl TestStore {
	pub async fn new() -> Result<Self> {
		Self::with_dim(TEST_VECTOR_DIM).await
	}

	pub async fn with_dim(vector_dim: u32) -> Result<Self> {
		let dir = tempfile::tempdir()?;
		let cfg = sqlite_config(dir.path());
		let db = Db::connect(&cfg).await?;

		db.ensure_schema().await?;

		let vectors = VectorStore::open(db.clone(), vector_dim).await?;

		Ok(Self { db, vectors, dir })
	}

	pub fn dir(&self) -> &Path {
		self.dir.path()
	}

	pub fn sqlite_config(&self) -> Sqlite {
		sqlite_config(self.dir.path())
	}

	/// A valid configuration rooted at this store. Remote and provider endpoints point at
	/// `base_url`, which is usually a local stub server.
	pub fn config(&self, base_url: &str) -> Config {
		sample_config(self.dir.path(), base_url, TEST_VECTOR_DIM)
	}
}

pub fn sample_config(dir: &Path, base_url: &str, vector_dim: u32) -> Config {
	Config {
		service: Service { log_level: "info".to_string() },
		storage: Storage {
			sqlite: sqlite_config(dir),
			vectors: Vectors { path: None, vector_dim },
		},
		remote: Remote {
			api_base: base_url.to_string(),
			api_key: "test-key".to_string(),
			rest_path: "/rest/v1".to_string(),
			timeout_ms: 2_000,
			default_headers: Map::new(),
			feed: Feed {
				api_base: base_url.to_string(),
				path: "/v1/shape".to_string(),
				table: "records".to_string(),
				timeout_ms: 2_000,
				params: Map::new(),
				default_headers: Map::new(),
			},
		},
		providers: Providers {
			embedding: EmbeddingProviderConfig {
				provider_id: "test".to_string(),
				api_base: base_url.to_string(),
				api_key: "test-key".to_string(),
				path: "/embeddings".to_string(),
				model: "test-embedding".to_string(),
				dimensions: vector_dim,
				timeout_ms: 2_000,
				default_headers: Map::new(),
			},
		},
		sync: SyncOptions {
			queue: Queue {
				base_backoff_ms: 10,
				max_backoff_ms: 50,
				max_rejections: 3,
				retain_synced: true,
			},
			stream: Stream { base_backoff_ms: 10, max_backoff_ms: 50 },
			connectivity: Connectivity { probe_interval_ms: 50 },
		},
	}
}

/// Polls `check` until it returns true or `timeout` elapses. Returns the final outcome.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = Instant::now() + timeout;

	loop {
		if check().await {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}

		time::sleep(Duration::from_millis(20)).await;
	}
}

fn sqlite_config(dir: &Path) -> Sqlite {
	let path: PathBuf = dir.join("tether.db");

	Sqlite { path: path.to_string_lossy().into_owned(), pool_max_conns: 4, busy_timeout_ms: 5_000 }
}
