pub mod connectivity;
pub mod consumer;
pub mod embedder;
pub mod health;
pub mod indexer;
pub mod queue;
pub mod search;
pub mod write;

mod error;

pub use connectivity::Connectivity;
pub use consumer::{BatchReport, StreamConsumer};
pub use embedder::Embedder;
pub use error::{Error, Result};
pub use health::{ConsumerState, Health, HealthSnapshot, SyncEvent};
pub use indexer::{IndexJob, Indexer, RebuildReport};
pub use queue::{DrainReport, MutationQueue};
pub use tether_providers::shape::{ChangeMessage, ChangeOperation, ControlSignal};
pub use write::NewRecord;

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;

use tether_config::{Config, EmbeddingProviderConfig, Feed, Remote};
use tether_providers::{embedding, remote, shape::ShapeSubscription};
use tether_storage::{db::Db, vectors::VectorStore};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, tether_providers::Result<Vec<Vec<f32>>>>;
}

/// Row-level writes against the authoritative store. `upsert` must be idempotent by `id`.
pub trait RemoteStore
where
	Self: Send + Sync,
{
	fn upsert<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		row: &'a Value,
	) -> BoxFuture<'a, tether_providers::Result<()>>;

	fn update<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		id: &'a str,
		patch: &'a Value,
	) -> BoxFuture<'a, tether_providers::Result<()>>;

	fn delete<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		id: &'a str,
	) -> BoxFuture<'a, tether_providers::Result<()>>;

	fn ping<'a>(&'a self, cfg: &'a Remote) -> BoxFuture<'a, tether_providers::Result<()>>;
}

pub trait ChangeFeed
where
	Self: Send + Sync,
{
	fn subscribe(&self, cfg: &Feed) -> tether_providers::Result<Box<dyn ChangeSubscription>>;
}

pub trait ChangeSubscription
where
	Self: Send,
{
	fn next_batch(&mut self) -> BoxFuture<'_, tether_providers::Result<Vec<ChangeMessage>>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub remote: Arc<dyn RemoteStore>,
	pub feed: Arc<dyn ChangeFeed>,
}
impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		remote: Arc<dyn RemoteStore>,
		feed: Arc<dyn ChangeFeed>,
	) -> Self {
		Self { embedding, remote, feed }
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), remote: provider.clone(), feed: provider }
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, tether_providers::Result<Vec<Vec<f32>>>> {
		Box::pin(embedding::embed(cfg, texts))
	}
}
impl RemoteStore for DefaultProviders {
	fn upsert<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		row: &'a Value,
	) -> BoxFuture<'a, tether_providers::Result<()>> {
		Box::pin(remote::upsert_row(cfg, table, row))
	}

	fn update<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		id: &'a str,
		patch: &'a Value,
	) -> BoxFuture<'a, tether_providers::Result<()>> {
		Box::pin(remote::update_row(cfg, table, id, patch))
	}

	fn delete<'a>(
		&'a self,
		cfg: &'a Remote,
		table: &'a str,
		id: &'a str,
	) -> BoxFuture<'a, tether_providers::Result<()>> {
		Box::pin(remote::delete_row(cfg, table, id))
	}

	fn ping<'a>(&'a self, cfg: &'a Remote) -> BoxFuture<'a, tether_providers::Result<()>> {
		Box::pin(remote::ping(cfg))
	}
}
impl ChangeFeed for DefaultProviders {
	fn subscribe(&self, cfg: &Feed) -> tether_providers::Result<Box<dyn ChangeSubscription>> {
		Ok(Box::new(ShapeSubscription::new(cfg)?))
	}
}

impl ChangeSubscription for ShapeSubscription {
	fn next_batch(&mut self) -> BoxFuture<'_, tether_providers::Result<Vec<ChangeMessage>>> {
		Box::pin(ShapeSubscription::next_batch(self))
	}
}

/// The application context. Owns one queue, one stream consumer, one embedder, and one
/// indexer over a shared store.
///
/// Construction spawns the indexer worker, so it must happen inside a Tokio runtime.
pub struct SyncEngine {
	pub cfg: Config,
	pub db: Db,
	vectors: VectorStore,
	providers: Providers,
	health: Arc<Health>,
	connectivity: Connectivity,
	embedder: Arc<Embedder>,
	indexer: Indexer,
	queue: Arc<MutationQueue>,
	consumer: Arc<StreamConsumer>,
}
impl SyncEngine {
	pub fn new(cfg: Config, db: Db, vectors: VectorStore) -> Result<Self> {
		Self::with_providers(cfg, db, vectors, Providers::default())
	}

	pub fn with_providers(
		cfg: Config,
		db: Db,
		vectors: VectorStore,
		providers: Providers,
	) -> Result<Self> {
		if vectors.vector_dim() != cfg.providers.embedding.dimensions {
			return Err(Error::InvalidRequest {
				message: format!(
					"Vector store dimension {} does not match embedding dimensions {}.",
					vectors.vector_dim(),
					cfg.providers.embedding.dimensions
				),
			});
		}

		let health = Arc::new(Health::new());
		let connectivity = Connectivity::new(false);
		let embedder = Arc::new(Embedder::new(
			cfg.providers.embedding.clone(),
			providers.embedding.clone(),
			vectors.vector_dim(),
		));
		let indexer = Indexer::spawn(db.clone(), embedder.clone(), vectors.clone(), health.clone());
		let queue = Arc::new(MutationQueue::new(
			db.clone(),
			cfg.remote.clone(),
			cfg.sync.queue.clone(),
			providers.remote.clone(),
			connectivity.clone(),
			health.clone(),
		));
		let consumer = Arc::new(StreamConsumer::new(
			db.clone(),
			cfg.remote.feed.clone(),
			cfg.sync.stream.clone(),
			providers.feed.clone(),
			indexer.clone(),
			health.clone(),
		));

		Ok(Self {
			cfg,
			db,
			vectors,
			providers,
			health,
			connectivity,
			embedder,
			indexer,
			queue,
			consumer,
		})
	}

	/// Launches the queue trigger loop and the stream consumer. Calling it again is a no-op.
	pub fn start(&self) {
		self.queue.start();
		self.consumer.start();
	}

	/// Halts both background loops. The queue finishes its in-flight mutation first.
	pub async fn stop(&self) {
		self.consumer.stop().await;
		self.queue.stop().await;
	}

	pub fn queue(&self) -> &Arc<MutationQueue> {
		&self.queue
	}

	pub fn consumer(&self) -> &Arc<StreamConsumer> {
		&self.consumer
	}

	pub fn vectors(&self) -> &VectorStore {
		&self.vectors
	}

	pub fn health(&self) -> &Arc<Health> {
		&self.health
	}

	pub fn connectivity(&self) -> &Connectivity {
		&self.connectivity
	}

	pub fn embedder(&self) -> &Arc<Embedder> {
		&self.embedder
	}

	pub fn indexer(&self) -> &Indexer {
		&self.indexer
	}

	pub fn providers(&self) -> &Providers {
		&self.providers
	}

	/// Table name used for queued mutations and the change feed.
	pub fn table(&self) -> &str {
		&self.cfg.remote.feed.table
	}
}

/// `base * 2^(attempt - 1)`, exponent capped at 6, result capped at `max_ms`.
pub(crate) fn backoff_for_attempt(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
	let exp = attempt.max(1).saturating_sub(1).min(6);
	let delay = base_ms.saturating_mul(1 << exp);

	Duration::from_millis(delay.min(max_ms))
}
