mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, Connectivity, EmbeddingProviderConfig, Feed, Providers, Queue, Remote, Service,
	Sqlite, Storage, Stream, SyncOptions, Vectors,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(&raw).map_err(|err| match err {
		Error::ParseConfig { source, .. } =>
			Error::ParseConfig { path: path.to_path_buf(), source },
		other => other,
	})
}

pub fn parse(raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: Default::default(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	for (label, value) in [
		("service.log_level", &cfg.service.log_level),
		("storage.sqlite.path", &cfg.storage.sqlite.path),
		("remote.api_base", &cfg.remote.api_base),
		("remote.feed.api_base", &cfg.remote.feed.api_base),
		("remote.feed.table", &cfg.remote.feed.table),
		("providers.embedding.api_base", &cfg.providers.embedding.api_base),
		("providers.embedding.model", &cfg.providers.embedding.model),
	] {
		if value.trim().is_empty() {
			return Err(Error::Validation { message: format!("{label} must be non-empty.") });
		}
	}

	for (label, key) in
		[("remote", &cfg.remote.api_key), ("embedding", &cfg.providers.embedding.api_key)]
	{
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	if cfg.storage.sqlite.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.sqlite.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.storage.vectors.vector_dim == 0 {
		return Err(Error::Validation {
			message: "storage.vectors.vector_dim must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.vectors.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.vectors.vector_dim."
				.to_string(),
		});
	}

	for (label, timeout_ms) in [
		("remote.timeout_ms", cfg.remote.timeout_ms),
		("remote.feed.timeout_ms", cfg.remote.feed.timeout_ms),
		("providers.embedding.timeout_ms", cfg.providers.embedding.timeout_ms),
	] {
		if timeout_ms == 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	for (label, base, max) in [
		("sync.queue", cfg.sync.queue.base_backoff_ms, cfg.sync.queue.max_backoff_ms),
		("sync.stream", cfg.sync.stream.base_backoff_ms, cfg.sync.stream.max_backoff_ms),
	] {
		if base == 0 {
			return Err(Error::Validation {
				message: format!("{label}.base_backoff_ms must be greater than zero."),
			});
		}
		if max < base {
			return Err(Error::Validation {
				message: format!(
					"{label}.max_backoff_ms must be greater than or equal to {label}.base_backoff_ms."
				),
			});
		}
	}

	if cfg.sync.queue.max_rejections == 0 {
		return Err(Error::Validation {
			message: "sync.queue.max_rejections must be greater than zero.".to_string(),
		});
	}
	if cfg.sync.connectivity.probe_interval_ms == 0 {
		return Err(Error::Validation {
			message: "sync.connectivity.probe_interval_ms must be greater than zero.".to_string(),
		});
	}

	for (label, headers) in [
		("remote.default_headers", &cfg.remote.default_headers),
		("remote.feed.default_headers", &cfg.remote.feed.default_headers),
		("providers.embedding.default_headers", &cfg.providers.embedding.default_headers),
	] {
		if headers.values().any(|value| !value.is_string()) {
			return Err(Error::Validation {
				message: format!("{label} values must be strings."),
			});
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.storage.vectors.path.as_deref().map(|path| path.trim().is_empty()).unwrap_or(false) {
		cfg.storage.vectors.path = None;
	}

	cfg.remote.api_base = cfg.remote.api_base.trim_end_matches('/').to_string();
	cfg.remote.feed.api_base = cfg.remote.feed.api_base.trim_end_matches('/').to_string();
	cfg.providers.embedding.api_base =
		cfg.providers.embedding.api_base.trim_end_matches('/').to_string();
}
