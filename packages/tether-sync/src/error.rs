pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Transient network error: {message}")]
	TransientNetwork { message: String },
	#[error("Remote rejected the request: {message}")]
	RemoteRejection { message: String },
	#[error("Local apply failed: {message}")]
	LocalApply { message: String },
	#[error("Embedding failed: {message}")]
	Embedding { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
}
impl Error {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::TransientNetwork { .. })
	}
}
impl From<tether_storage::Error> for Error {
	fn from(err: tether_storage::Error) -> Self {
		match err {
			tether_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			tether_storage::Error::NotFound(message) => Self::NotFound { message },
			other => Self::Storage { message: other.to_string() },
		}
	}
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::InvalidRequest { message: err.to_string() }
	}
}
impl From<tether_providers::Error> for Error {
	fn from(err: tether_providers::Error) -> Self {
		if err.is_transient() {
			Self::TransientNetwork { message: err.to_string() }
		} else {
			Self::RemoteRejection { message: err.to_string() }
		}
	}
}
