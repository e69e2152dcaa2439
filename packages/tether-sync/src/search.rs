use crate::{Error, Result, SyncEngine, indexer::RebuildReport};
use tether_storage::{
	models::{Record, VectorHit, VectorStats},
	records,
};

impl SyncEngine {
	pub async fn get_record(&self, id: &str) -> Result<Option<Record>> {
		Ok(records::get_record(&self.db.pool, id).await?)
	}

	/// Newest first.
	pub async fn list_records(&self) -> Result<Vec<Record>> {
		Ok(records::list_records(&self.db.pool).await?)
	}

	pub async fn list_stream(&self, stream_id: &str) -> Result<Vec<Record>> {
		Ok(records::list_stream(&self.db.pool, stream_id).await?)
	}

	/// Embeds `query` through the shared embedder and ranks stored vectors against it.
	pub async fn search_text(&self, query: &str, k: usize) -> Result<Vec<VectorHit>> {
		let query = query.trim();

		if query.is_empty() {
			return Err(Error::InvalidRequest { message: "query must not be empty.".to_string() });
		}

		let vector = self.embedder().embed(query).await?;

		self.search_vector(&vector, k).await
	}

	pub async fn search_vector(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
		Ok(self.vectors().search(vector, k).await?)
	}

	pub async fn vector_stats(&self) -> Result<VectorStats> {
		Ok(self.vectors().stats().await?)
	}

	/// Rebuilds the vector table from every record and swaps it in with one transaction.
	///
	/// Records whose embedding fails are left out of the rebuilt table and reported through
	/// `IndexFailed`. The rebuild runs on the index worker, so writes made while it embeds are
	/// applied to the swapped table afterwards.
	pub async fn reindex_all(&self) -> Result<RebuildReport> {
		self.indexer().rebuild().await
	}
}
