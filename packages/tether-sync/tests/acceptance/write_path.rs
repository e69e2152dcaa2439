use serde_json::Value;

use tether_storage::{
	models::{MutationOp, RecordPatch, RecordStatus, Scope},
	outbox,
};
use tether_sync::{Error, NewRecord};

use super::{harness, new_record};

#[tokio::test]
async fn create_commits_record_and_insert_mutation_together() {
	let h = harness().await;
	let new = NewRecord {
		id: None,
		stream_id: "groceries".to_string(),
		opcode: 2,
		delta: Some(-1.0),
		payload: r#"{"name":"Milk","category":"dairy"}"#.to_string(),
		scope: Scope::Shared,
		status: None,
		timestamp: None,
	};
	let record = h.engine.create_record(new).await.expect("Create failed.");

	assert!(!record.id.is_empty());
	assert_eq!(record.status, RecordStatus::Active);

	let pending = h.engine.queue().pending().await.expect("Listing failed.");

	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].op().expect("Bad op."), MutationOp::Insert);
	assert_eq!(pending[0].table_name, "records");

	let data: Value = serde_json::from_str(&pending[0].data).expect("Snapshot is not JSON.");

	assert_eq!(data["id"], record.id.as_str());
	assert_eq!(data["streamId"], "groceries");
	assert_eq!(data["scope"], "shared");
	assert!(data["ts"].is_string());

	h.engine.indexer().flush().await;

	let entry = h
		.engine
		.vectors()
		.get(&record.id)
		.await
		.expect("Lookup failed.")
		.expect("Record was not indexed.");

	assert_eq!(entry.content, "Milk dairy");

	let metadata = entry.metadata.expect("Indexed entries carry metadata.");

	assert_eq!(metadata.get("streamId"), Some(&Value::from("groceries")));
	assert_eq!(metadata.get("scope"), Some(&Value::from("shared")));
}

#[tokio::test]
async fn update_enqueues_only_changed_fields() {
	let h = harness().await;

	h.engine.create_record(new_record("a", "milk")).await.expect("Create failed.");

	let patch = RecordPatch { status: Some(RecordStatus::Done), ..Default::default() };
	let record = h.engine.update_record("a", patch).await.expect("Update failed.");

	assert_eq!(record.status, RecordStatus::Done);
	assert_eq!(record.payload, "milk");

	let pending = h.engine.queue().pending().await.expect("Listing failed.");
	let data: Value = serde_json::from_str(&pending[1].data).expect("Snapshot is not JSON.");

	assert_eq!(pending[1].op().expect("Bad op."), MutationOp::Update);
	assert_eq!(data, serde_json::json!({ "id": "a", "status": "done" }));
}

#[tokio::test]
async fn update_of_missing_record_is_not_found_and_enqueues_nothing() {
	let h = harness().await;
	let patch = RecordPatch { opcode: Some(9), ..Default::default() };
	let err = h.engine.update_record("nope", patch).await.expect_err("Update should fail.");

	assert!(matches!(err, Error::NotFound { .. }));
	assert_eq!(h.engine.queue().pending_count().await.expect("Count failed."), 0);

	let err = h
		.engine
		.update_record("nope", RecordPatch::default())
		.await
		.expect_err("Empty patch should fail.");

	assert!(matches!(err, Error::InvalidRequest { .. }));
}

#[tokio::test]
async fn delete_enqueues_once_and_drops_the_vector() {
	let h = harness().await;

	h.engine.create_record(new_record("a", "milk")).await.expect("Create failed.");
	h.engine.indexer().flush().await;

	assert!(h.engine.delete_record("a").await.expect("Delete failed."));
	assert!(!h.engine.delete_record("a").await.expect("Delete failed."));

	h.engine.indexer().flush().await;

	let mutations = outbox::list_mutations(&h.store.db.pool).await.expect("Listing failed.");
	let ops: Vec<_> = mutations.iter().map(|entry| entry.op.as_str()).collect();

	assert_eq!(ops, vec!["INSERT", "DELETE"]);
	assert_eq!(mutations[1].data, r#"{"id":"a"}"#);
	assert!(h.engine.vectors().get("a").await.expect("Lookup failed.").is_none());
	assert!(h.engine.search_text("milk", 5).await.expect("Search failed.").is_empty());
}

#[tokio::test]
async fn blank_ids_are_rejected() {
	let h = harness().await;
	let err = h.engine.create_record(new_record(" ", "x")).await.expect_err("Blank id accepted.");

	assert!(matches!(err, Error::InvalidRequest { .. }));
	assert!(h.engine.list_records().await.expect("Listing failed.").is_empty());
}
