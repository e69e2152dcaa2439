//! Client for the shape-log HTTP protocol.
//!
//! A subscription starts with an initial snapshot request at `offset=-1`, then follows the
//! `electric-handle` and `electric-offset` response headers. Once the server reports
//! `up-to-date` the subscription switches to live long-polling. Position is kept in memory
//! only, so a new subscription always replays the shape from the beginning.

use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const HANDLE_HEADER: &str = "electric-handle";
pub const OFFSET_HEADER: &str = "electric-offset";
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";

const INITIAL_OFFSET: &str = "-1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
	Insert,
	Update,
	Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlSignal {
	UpToDate,
	MustRefetch,
	Other(String),
}
impl ControlSignal {
	fn parse(raw: &str) -> Self {
		match raw {
			"up-to-date" => Self::UpToDate,
			"must-refetch" => Self::MustRefetch,
			other => Self::Other(other.to_string()),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operation: Option<ChangeOperation>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub control: Option<String>,
}

/// One entry of the change log. Entries without a `value` are control signals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
	#[serde(default)]
	pub headers: MessageHeaders,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
}
impl ChangeMessage {
	pub fn change(operation: ChangeOperation, value: Value) -> Self {
		Self {
			key: None,
			headers: MessageHeaders { operation: Some(operation), control: None },
			value: Some(value),
		}
	}

	pub fn control_message(control: &str) -> Self {
		Self {
			key: None,
			headers: MessageHeaders { operation: None, control: Some(control.to_string()) },
			value: None,
		}
	}

	pub fn control(&self) -> Option<ControlSignal> {
		if self.value.is_some() {
			return None;
		}

		Some(ControlSignal::parse(self.headers.control.as_deref().unwrap_or_default()))
	}
}

pub struct ShapeSubscription {
	client: Client,
	url: String,
	table: String,
	params: Vec<(String, String)>,
	headers: HeaderMap,
	handle: Option<String>,
	offset: String,
	live: bool,
}
impl ShapeSubscription {
	pub fn new(cfg: &tether_config::Feed) -> Result<Self> {
		let mut headers = HeaderMap::new();

		crate::extend_headers(&mut headers, &cfg.default_headers)?;

		let params = cfg
			.params
			.iter()
			.map(|(key, value)| {
				let value = match value {
					Value::String(raw) => raw.clone(),
					other => other.to_string(),
				};

				(key.clone(), value)
			})
			.collect();

		Ok(Self {
			client: crate::build_client(cfg.timeout_ms)?,
			url: format!("{}{}", cfg.api_base, cfg.path),
			table: cfg.table.clone(),
			params,
			headers,
			handle: None,
			offset: INITIAL_OFFSET.to_string(),
			live: false,
		})
	}

	pub fn handle(&self) -> Option<&str> {
		self.handle.as_deref()
	}

	pub fn offset(&self) -> &str {
		&self.offset
	}

	pub fn is_live(&self) -> bool {
		self.live
	}

	/// Fetches the next chunk of the log. A live poll that times out on the server returns an
	/// empty batch or a lone `up-to-date` control message.
	pub async fn next_batch(&mut self) -> Result<Vec<ChangeMessage>> {
		let mut query = vec![
			("table".to_string(), self.table.clone()),
			("offset".to_string(), self.offset.clone()),
		];

		if let Some(handle) = &self.handle {
			query.push(("handle".to_string(), handle.clone()));
		}
		if self.live {
			query.push(("live".to_string(), "true".to_string()));
		}

		query.extend(self.params.iter().cloned());

		let res = self
			.client
			.get(&self.url)
			.headers(self.headers.clone())
			.query(&query)
			.send()
			.await?;
		let status = res.status();

		if status == StatusCode::CONFLICT {
			self.reset();

			return Err(Error::Rejected {
				status: status.as_u16(),
				message: "Shape handle expired; the log must be refetched.".to_string(),
			});
		}

		let res = crate::check_status(res).await?;
		let up_to_date_header = res.headers().contains_key(UP_TO_DATE_HEADER);

		if let Some(handle) = header_value(res.headers(), HANDLE_HEADER)? {
			self.handle = Some(handle);
		}

		match header_value(res.headers(), OFFSET_HEADER)? {
			Some(offset) => self.offset = offset,
			None if status == StatusCode::NO_CONTENT => {},
			None =>
				return Err(Error::InvalidResponse {
					message: format!("Shape response is missing the {OFFSET_HEADER} header."),
				}),
		}

		if status == StatusCode::NO_CONTENT {
			return Ok(Vec::new());
		}

		let body = res.text().await?;
		let messages = parse_messages(&body)?;

		if up_to_date_header
			|| messages.iter().any(|msg| msg.control() == Some(ControlSignal::UpToDate))
		{
			if !self.live {
				tracing::debug!(table = %self.table, offset = %self.offset, "Shape is up to date.");
			}

			self.live = true;
		}

		Ok(messages)
	}

	fn reset(&mut self) {
		self.handle = None;
		self.offset = INITIAL_OFFSET.to_string();
		self.live = false;
	}
}

pub fn parse_messages(body: &str) -> Result<Vec<ChangeMessage>> {
	if body.trim().is_empty() {
		return Ok(Vec::new());
	}

	Ok(serde_json::from_str(body)?)
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
	let Some(value) = headers.get(name) else {
		return Ok(None);
	};
	let value = value.to_str().map_err(|_| Error::InvalidResponse {
		message: format!("Shape response header {name} is not valid text."),
	})?;

	Ok(Some(value.to_string()))
}
