use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::{EmbeddingProvider, Error, Result};
use tether_config::EmbeddingProviderConfig;

/// Single-slot gate in front of the embedding provider.
///
/// The underlying model is not reentrant, so at most one provider call is in flight. Waiters
/// acquire the slot in arrival order because the Tokio mutex is fair.
pub struct Embedder {
	cfg: EmbeddingProviderConfig,
	provider: Arc<dyn EmbeddingProvider>,
	vector_dim: u32,
	slot: Mutex<()>,
}
impl Embedder {
	pub fn new(
		cfg: EmbeddingProviderConfig,
		provider: Arc<dyn EmbeddingProvider>,
		vector_dim: u32,
	) -> Self {
		Self { cfg, provider, vector_dim, slot: Mutex::new(()) }
	}

	pub fn vector_dim(&self) -> u32 {
		self.vector_dim
	}

	/// Embeds one text. Provider failures and unusable vectors are `Error::Embedding`; no
	/// placeholder vector is ever returned.
	pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
		let input = [text.to_string()];
		let vectors = {
			let _slot = self.slot.lock().await;

			self.provider
				.embed(&self.cfg, &input)
				.await
				.map_err(|err| Error::Embedding { message: err.to_string() })?
		};
		let Some(vector) = vectors.into_iter().next() else {
			return Err(Error::Embedding {
				message: "Embedding provider returned no vectors.".to_string(),
			});
		};

		validate_vector(&vector, self.vector_dim)?;

		Ok(vector)
	}
}

pub fn validate_vector(vector: &[f32], vector_dim: u32) -> Result<()> {
	if vector.len() != vector_dim as usize {
		return Err(Error::Embedding {
			message: format!(
				"Embedding dimension {} does not match vector_dim {vector_dim}.",
				vector.len()
			),
		});
	}
	if vector.iter().any(|value| !value.is_finite()) {
		return Err(Error::Embedding {
			message: "Embedding contains non-finite values.".to_string(),
		});
	}
	if vector.iter().all(|value| *value == 0.0) {
		return Err(Error::Embedding { message: "Embedding is an all-zero vector.".to_string() });
	}

	Ok(())
}

/// Text submitted for embedding.
///
/// JSON object payloads with a `name` use `name category description`; otherwise a `text`
/// field; anything else embeds the raw payload.
pub fn payload_text(payload: &str) -> String {
	let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) else {
		return payload.to_string();
	};

	if map.get("name").and_then(Value::as_str).is_some() {
		let parts: Vec<&str> = ["name", "category", "description"]
			.iter()
			.filter_map(|key| map.get(*key).and_then(Value::as_str))
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.collect();

		return parts.join(" ");
	}
	if let Some(text) = map.get("text").and_then(Value::as_str) {
		return text.to_string();
	}

	payload.to_string()
}
