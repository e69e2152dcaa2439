use serde_json::json;

use super::{harness, insert, update};

#[tokio::test]
async fn replayed_insert_converges() {
	let h = harness().await;
	let consumer = h.engine.consumer();

	consumer.apply_batch(&[insert("a", "milk")]).await.expect("First apply failed.");

	let once = h.engine.list_records().await.expect("Listing failed.");

	consumer.apply_batch(&[insert("a", "milk")]).await.expect("Second apply failed.");

	let twice = h.engine.list_records().await.expect("Listing failed.");

	assert_eq!(once, twice);
	assert_eq!(twice.len(), 1);
}

#[tokio::test]
async fn replayed_update_converges() {
	let h = harness().await;
	let consumer = h.engine.consumer();
	let patch = update(json!({ "id": "a", "opcode": 4, "payload": "oat milk" }));

	consumer.apply_batch(&[insert("a", "milk")]).await.expect("Insert failed.");
	consumer.apply_batch(&[patch.clone()]).await.expect("First update failed.");

	let once = h.engine.get_record("a").await.expect("Lookup failed.");

	consumer.apply_batch(&[patch]).await.expect("Second update failed.");

	let twice = h.engine.get_record("a").await.expect("Lookup failed.");

	assert_eq!(once, twice);
	assert_eq!(twice.map(|record| record.opcode), Some(4));
}

#[tokio::test]
async fn remote_insert_overrides_optimistic_local_write() {
	let h = harness().await;

	h.engine.create_record(super::new_record("a", "draft")).await.expect("Local create failed.");
	h.engine.consumer().apply_batch(&[insert("a", "final")]).await.expect("Apply failed.");

	let record = h.engine.get_record("a").await.expect("Lookup failed.").expect("Missing record.");

	assert_eq!(record.payload, "final");

	h.engine.indexer().flush().await;

	let entry = h.engine.vectors().get("a").await.expect("Lookup failed.").expect("Missing vector.");

	assert_eq!(entry.content, "final");
}
