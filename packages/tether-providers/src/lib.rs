pub mod embedding;
pub mod remote;
pub mod shape;

mod error;

pub use error::{Error, Result};

use std::time::Duration;

use reqwest::{
	Client, Response,
	header::{AUTHORIZATION, HeaderMap, HeaderName},
};
use serde_json::{Map, Value};

pub fn auth_headers(api_key: &str, default_headers: &Map<String, Value>) -> Result<HeaderMap> {
	let mut headers = HeaderMap::new();

	headers.insert(AUTHORIZATION, format!("Bearer {api_key}").parse()?);
	extend_headers(&mut headers, default_headers)?;

	Ok(headers)
}

pub fn extend_headers(headers: &mut HeaderMap, default_headers: &Map<String, Value>) -> Result<()> {
	for (key, value) in default_headers {
		let Some(raw) = value.as_str() else {
			return Err(Error::InvalidConfig {
				message: "Default header values must be strings.".to_string(),
			});
		};

		headers.insert(HeaderName::from_bytes(key.as_bytes())?, raw.parse()?);
	}

	Ok(())
}

pub(crate) fn build_client(timeout_ms: u64) -> Result<Client> {
	Ok(Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?)
}

/// Passes successful responses through and classifies the rest by status.
pub(crate) async fn check_status(res: Response) -> Result<Response> {
	let status = res.status();

	if status.is_success() {
		return Ok(res);
	}

	let body = res.text().await.unwrap_or_default();

	Err(Error::from_status(status, &body))
}
