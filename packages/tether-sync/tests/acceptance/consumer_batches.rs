use serde_json::json;

use tether_storage::models::RecordStatus;
use tether_sync::ChangeMessage;

use super::{delete, harness, insert, record_row, update};

#[tokio::test]
async fn update_for_unknown_id_is_a_counted_no_op() {
	let h = harness().await;
	let report = h
		.engine
		.consumer()
		.apply_batch(&[update(json!({ "id": "ghost", "status": "done" }))])
		.await
		.expect("Batch should not fail.");

	assert_eq!(report.missing, 1);
	assert_eq!(report.applied, 0);
	assert_eq!(report.skipped, 0);
	assert!(h.engine.get_record("ghost").await.expect("Lookup failed.").is_none());
}

#[tokio::test]
async fn update_keeps_absent_fields() {
	let h = harness().await;
	let consumer = h.engine.consumer();

	consumer.apply_batch(&[insert("a", "milk")]).await.expect("Insert batch failed.");
	h.engine.indexer().flush().await;

	let calls_before = h.embedding.calls();
	let report = consumer
		.apply_batch(&[update(json!({ "id": "a", "status": "done", "delta": "2.5" }))])
		.await
		.expect("Update batch failed.");

	assert_eq!(report.applied, 1);

	let record = h.engine.get_record("a").await.expect("Lookup failed.").expect("Missing record.");

	assert_eq!(record.status, RecordStatus::Done);
	assert_eq!(record.delta, Some(2.5));
	assert_eq!(record.payload, "milk");
	assert_eq!(record.stream_id, "stream-1");

	h.engine.indexer().flush().await;

	assert_eq!(h.embedding.calls(), calls_before, "A payload-free update must not re-embed.");
}

#[tokio::test]
async fn bad_row_is_skipped_and_the_rest_commit() {
	let h = harness().await;
	let mut broken = record_row("b", "bread");

	broken["scope"] = json!("galaxy");

	let messages = [
		insert("a", "apples"),
		ChangeMessage::change(tether_sync::ChangeOperation::Insert, broken),
		ChangeMessage::change(tether_sync::ChangeOperation::Insert, json!({ "id": "c" })),
		insert("d", "dates"),
	];
	let report = h.engine.consumer().apply_batch(&messages).await.expect("Batch failed.");

	assert_eq!(report.applied, 2);
	assert_eq!(report.skipped, 2);

	let ids: Vec<_> = h
		.engine
		.list_records()
		.await
		.expect("Listing failed.")
		.into_iter()
		.map(|record| record.id)
		.collect();

	assert_eq!(ids.len(), 2);
	assert!(ids.contains(&"a".to_string()));
	assert!(ids.contains(&"d".to_string()));

	let snapshot = h.engine.health().snapshot();

	assert_eq!(snapshot.rows_skipped, 2);
	assert_eq!(snapshot.rows_applied, 2);
	assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn control_messages_are_counted_and_ignored() {
	let h = harness().await;
	let report = h
		.engine
		.consumer()
		.apply_batch(&[
			ChangeMessage::control_message("up-to-date"),
			insert("a", "x"),
			ChangeMessage::control_message("snapshot-end"),
		])
		.await
		.expect("Batch failed.");

	assert_eq!(report.controls, 2);
	assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn shape_rows_with_text_columns_are_decoded() {
	let h = harness().await;
	let row = json!({
		"id": "s",
		"stream_id": "stream-9",
		"opcode": "12",
		"delta": "",
		"payload": { "name": "Milk", "category": "groceries" },
		"scope": "shared",
		"status": "active",
		"ts": "2024-05-01 10:20:30.123456+00",
	});

	h.engine
		.consumer()
		.apply_batch(&[ChangeMessage::change(tether_sync::ChangeOperation::Insert, row)])
		.await
		.expect("Batch failed.");

	let record = h.engine.get_record("s").await.expect("Lookup failed.").expect("Missing record.");

	assert_eq!(record.stream_id, "stream-9");
	assert_eq!(record.opcode, 12);
	assert_eq!(record.delta, None);

	let payload: serde_json::Value =
		serde_json::from_str(&record.payload).expect("Payload should be stored as JSON text.");

	assert_eq!(payload, json!({ "name": "Milk", "category": "groceries" }));
}

#[tokio::test]
async fn delete_removes_record_and_vector() {
	let h = harness().await;
	let consumer = h.engine.consumer();

	consumer.apply_batch(&[insert("a", "apples"), insert("b", "bananas")]).await.expect("Insert.");
	h.engine.indexer().flush().await;

	assert!(h.engine.vectors().get("a").await.expect("Lookup failed.").is_some());

	consumer.apply_batch(&[delete("a")]).await.expect("Delete batch failed.");
	h.engine.indexer().flush().await;

	assert!(h.engine.get_record("a").await.expect("Lookup failed.").is_none());
	assert!(h.engine.vectors().get("a").await.expect("Lookup failed.").is_none());

	let hits = h.engine.search_text("apples", 10).await.expect("Search failed.");

	assert!(hits.iter().all(|hit| hit.doc_id != "a"));
	assert_eq!(hits.len(), 1);
}
