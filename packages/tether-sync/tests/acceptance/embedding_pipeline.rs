use std::{sync::atomic::Ordering, time::Duration};

use tether_storage::models::{RecordPatch, RecordStatus};
use tether_sync::Error;

use super::{HashEmbedding, SpyRemote, harness, harness_with, new_record};

#[tokio::test]
async fn embedding_calls_never_overlap() {
	let h = harness_with(
		HashEmbedding::new(Duration::from_millis(30)),
		SpyRemote::new(Duration::ZERO),
	)
	.await;
	let engine = &h.engine;
	let (a, b, c, d) = tokio::join!(
		engine.search_text("one", 1),
		engine.search_text("two", 1),
		engine.search_text("three", 1),
		engine.search_text("four", 1),
	);

	for result in [a, b, c, d] {
		assert!(result.expect("Search failed.").is_empty());
	}

	assert_eq!(h.embedding.calls(), 4);
	assert_eq!(h.embedding.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_embedding_leaves_no_vector_and_is_reported() {
	let h = harness().await;

	h.engine.create_record(new_record("a", "this will fail")).await.expect("Create failed.");
	h.engine.create_record(new_record("z", "zero")).await.expect("Create failed.");
	h.engine.indexer().flush().await;

	assert!(h.engine.vectors().get("a").await.expect("Lookup failed.").is_none());
	assert!(h.engine.vectors().get("z").await.expect("Lookup failed.").is_none());
	assert_eq!(h.engine.vector_stats().await.expect("Stats failed.").total, 0);
	assert_eq!(h.engine.health().snapshot().index_failures, 2);
	assert_eq!(h.engine.list_records().await.expect("Listing failed.").len(), 2);
}

#[tokio::test]
async fn failed_reembedding_keeps_the_previous_vector() {
	let h = harness().await;

	h.engine.create_record(new_record("a", "good text")).await.expect("Create failed.");
	h.engine.indexer().flush().await;

	let patch = RecordPatch { payload: Some("now fail".to_string()), ..Default::default() };

	h.engine.update_record("a", patch).await.expect("Update failed.");
	h.engine.indexer().flush().await;

	let entry = h.engine.vectors().get("a").await.expect("Lookup failed.").expect("Vector lost.");

	assert_eq!(entry.content, "good text");
	assert_eq!(h.engine.health().snapshot().index_failures, 1);
}

#[tokio::test]
async fn unchanged_text_skips_the_provider() {
	let h = harness().await;

	h.engine.create_record(new_record("a", "milk")).await.expect("Create failed.");
	h.engine.indexer().flush().await;

	assert_eq!(h.embedding.calls(), 1);

	let patch = RecordPatch { status: Some(RecordStatus::Done), ..Default::default() };

	h.engine.update_record("a", patch).await.expect("Update failed.");
	h.engine.indexer().flush().await;

	assert_eq!(h.embedding.calls(), 1);

	let entry = h.engine.vectors().get("a").await.expect("Lookup failed.").expect("Missing vector.");
	let status = entry.metadata.as_ref().and_then(|metadata| metadata.get("status")).cloned();

	assert_eq!(status, Some(serde_json::Value::from("done")));

	let patch = RecordPatch { payload: Some("oat milk".to_string()), ..Default::default() };

	h.engine.update_record("a", patch).await.expect("Update failed.");
	h.engine.indexer().flush().await;

	assert_eq!(h.embedding.calls(), 2);
}

#[tokio::test]
async fn search_text_ranks_the_matching_record_first() {
	let h = harness().await;

	for (id, payload) in [("a", "buy milk"), ("b", "call the plumber"), ("c", "water plants")] {
		h.engine.create_record(new_record(id, payload)).await.expect("Create failed.");
	}

	h.engine.indexer().flush().await;

	let hits = h.engine.search_text("call the plumber", 2).await.expect("Search failed.");

	assert_eq!(hits.len(), 2);
	assert_eq!(hits[0].doc_id, "b");
	assert!((hits[0].score - 1.0).abs() < 1e-6);
	assert!(hits[0].score >= hits[1].score);

	let err = h.engine.search_text("   ", 2).await.expect_err("Blank query accepted.");

	assert!(matches!(err, Error::InvalidRequest { .. }));
}

#[tokio::test]
async fn reindex_rebuilds_every_embeddable_record() {
	let h = harness().await;

	for (id, payload) in [("a", "apples"), ("b", "bananas"), ("c", "fail please")] {
		h.engine.create_record(new_record(id, payload)).await.expect("Create failed.");
	}

	h.engine.indexer().flush().await;
	h.engine.vectors().clear().await.expect("Clear failed.");

	assert_eq!(h.engine.vector_stats().await.expect("Stats failed.").total, 0);

	let report = h.engine.reindex_all().await.expect("Reindex failed.");

	assert_eq!(report.indexed, 2);
	assert_eq!(report.failed, 1);

	let stats = h.engine.vector_stats().await.expect("Stats failed.");

	assert_eq!(stats.total, 2);
	assert_eq!(stats.embedded, 2);
	assert!(h.engine.vectors().get("c").await.expect("Lookup failed.").is_none());
}

#[tokio::test]
async fn writes_during_reindex_apply_after_the_swap() {
	let h = harness_with(
		HashEmbedding::new(Duration::from_millis(200)),
		SpyRemote::new(Duration::ZERO),
	)
	.await;

	h.engine.create_record(new_record("a", "apples")).await.expect("Create failed.");
	h.engine.create_record(new_record("b", "bananas")).await.expect("Create failed.");
	h.engine.indexer().flush().await;

	let engine = &h.engine;
	let (report, ()) = tokio::join!(engine.reindex_all(), async {
		tokio::time::sleep(Duration::from_millis(100)).await;

		assert!(engine.delete_record("a").await.expect("Delete failed."));

		engine.create_record(new_record("c", "cherries")).await.expect("Create failed.");
		engine.indexer().flush().await;
	});
	let report = report.expect("Reindex failed.");

	assert_eq!(report.indexed, 2);
	assert!(h.engine.get_record("a").await.expect("Lookup failed.").is_none());
	assert!(h.engine.vectors().get("a").await.expect("Lookup failed.").is_none());
	assert!(h.engine.vectors().get("c").await.expect("Lookup failed.").is_some());

	let hits = h.engine.search_text("apples", 5).await.expect("Search failed.");
	let mut ids: Vec<_> = hits.iter().map(|hit| hit.doc_id.as_str()).collect();

	ids.sort_unstable();

	assert_eq!(ids, vec!["b", "c"]);
}
