use reqwest::StatusCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),
	#[error(transparent)]
	InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
	#[error("{message}")]
	InvalidConfig { message: String },
	#[error("{message}")]
	InvalidResponse { message: String },
	#[error("Remote unavailable with status {status}: {message}")]
	Unavailable { status: u16, message: String },
	#[error("Remote rejected the request with status {status}: {message}")]
	Rejected { status: u16, message: String },
}
impl Error {
	/// Whether retrying the same request later can succeed.
	///
	/// Transport failures, timeouts, and 408/429/5xx responses are transient. Everything else
	/// means the remote refused the request as written.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Reqwest(err) => match err.status() {
				Some(status) => is_transient_status(status),
				None => !err.is_decode() && !err.is_builder(),
			},
			Self::Unavailable { .. } => true,
			Self::SerdeJson(_)
			| Self::InvalidHeaderName(_)
			| Self::InvalidHeaderValue(_)
			| Self::InvalidConfig { .. }
			| Self::InvalidResponse { .. }
			| Self::Rejected { .. } => false,
		}
	}

	pub(crate) fn from_status(status: StatusCode, body: &str) -> Self {
		let message = summarize_body(body);

		if is_transient_status(status) {
			Self::Unavailable { status: status.as_u16(), message }
		} else {
			Self::Rejected { status: status.as_u16(), message }
		}
	}
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
	status == StatusCode::REQUEST_TIMEOUT
		|| status == StatusCode::TOO_MANY_REQUESTS
		|| status.is_server_error()
}

fn summarize_body(body: &str) -> String {
	const MAX_CHARS: usize = 256;

	let trimmed = body.trim();

	if trimmed.is_empty() {
		return "empty response body.".to_string();
	}

	trimmed.chars().take(MAX_CHARS).collect()
}
