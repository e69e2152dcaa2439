//! Row-level writes against a PostgREST-style table API.
//!
//! Inserts are upserts on the primary key, so replaying a mutation after an ambiguous failure
//! converges instead of duplicating.

use reqwest::{
	RequestBuilder,
	header::{HeaderMap, HeaderValue},
};
use serde_json::Value;

use crate::{Error, Result};

const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=minimal";
const PREFER_MINIMAL: &str = "return=minimal";

pub async fn upsert_row(cfg: &tether_config::Remote, table: &str, row: &Value) -> Result<()> {
	let client = crate::build_client(cfg.timeout_ms)?;
	let req = client
		.post(table_url(cfg, table))
		.headers(remote_headers(cfg)?)
		.header("Prefer", PREFER_UPSERT)
		.query(&[("on_conflict", "id")])
		.json(row);

	send(req).await
}

/// Applies `patch` to the row matching `id`. An `id` key inside `patch` is dropped.
pub async fn update_row(
	cfg: &tether_config::Remote,
	table: &str,
	id: &str,
	patch: &Value,
) -> Result<()> {
	let mut fields = patch.as_object().cloned().ok_or_else(|| Error::InvalidConfig {
		message: "Update patch must be a JSON object.".to_string(),
	})?;

	fields.remove("id");

	if fields.is_empty() {
		return Ok(());
	}

	let client = crate::build_client(cfg.timeout_ms)?;
	let req = client
		.patch(table_url(cfg, table))
		.headers(remote_headers(cfg)?)
		.header("Prefer", PREFER_MINIMAL)
		.query(&[("id", id_filter(id))])
		.json(&fields);

	send(req).await
}

/// Deleting a row that does not exist succeeds.
pub async fn delete_row(cfg: &tether_config::Remote, table: &str, id: &str) -> Result<()> {
	let client = crate::build_client(cfg.timeout_ms)?;
	let req = client
		.delete(table_url(cfg, table))
		.headers(remote_headers(cfg)?)
		.header("Prefer", PREFER_MINIMAL)
		.query(&[("id", id_filter(id))]);

	send(req).await
}

/// Reachability probe. Any response below 500 counts as reachable.
pub async fn ping(cfg: &tether_config::Remote) -> Result<()> {
	let client = crate::build_client(cfg.timeout_ms)?;
	let res = client
		.get(format!("{}{}/", cfg.api_base, cfg.rest_path))
		.headers(remote_headers(cfg)?)
		.send()
		.await?;
	let status = res.status();

	if status.is_server_error() {
		return Err(Error::Unavailable {
			status: status.as_u16(),
			message: "Remote health probe failed.".to_string(),
		});
	}

	Ok(())
}

fn table_url(cfg: &tether_config::Remote, table: &str) -> String {
	format!("{}{}/{}", cfg.api_base, cfg.rest_path, table)
}

fn id_filter(id: &str) -> String {
	format!("eq.{id}")
}

fn remote_headers(cfg: &tether_config::Remote) -> Result<HeaderMap> {
	let mut headers = crate::auth_headers(&cfg.api_key, &cfg.default_headers)?;

	headers.insert("apikey", HeaderValue::from_str(&cfg.api_key)?);

	Ok(headers)
}

async fn send(req: RequestBuilder) -> Result<()> {
	let res = req.send().await?;

	crate::check_status(res).await?;

	Ok(())
}
