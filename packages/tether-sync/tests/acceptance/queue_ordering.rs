use std::time::Duration;

use serde_json::json;

use tether_providers::Error as ProviderError;
use tether_storage::{models::MutationOp, outbox};

use super::{HashEmbedding, SpyRemote, WAIT, harness, harness_with, record_row};

#[tokio::test]
async fn offline_enqueue_syncs_exactly_once_when_online() {
	let h = harness().await;

	h.engine.start();

	let seq = h
		.engine
		.queue()
		.enqueue("records", MutationOp::Insert, &record_row("a", "milk"))
		.await
		.expect("Failed to enqueue.");

	assert_eq!(h.engine.queue().pending_count().await.expect("Failed to count."), 1);

	tokio::time::sleep(Duration::from_millis(100)).await;

	assert!(h.remote.calls().is_empty(), "Nothing may reach the remote while offline.");

	h.engine.connectivity().set_online(true);

	let pool = &h.store.db.pool;
	let synced = tether_testkit::wait_until(WAIT, || async move {
		outbox::get_mutation(pool, seq)
			.await
			.ok()
			.flatten()
			.is_some_and(|entry| entry.synced)
	})
	.await;

	assert!(synced, "Mutation was not synced after going online.");

	tokio::time::sleep(Duration::from_millis(100)).await;

	let calls = h.remote.calls();

	assert_eq!(calls.len(), 1);
	assert_eq!(calls[0].op, "upsert");
	assert_eq!(calls[0].table, "records");
	assert_eq!(calls[0].id, "a");
	assert_eq!(h.engine.queue().pending_count().await.expect("Failed to count."), 0);
	assert_eq!(h.engine.health().snapshot().synced, 1);

	h.engine.stop().await;
}

#[tokio::test]
async fn failed_mutation_blocks_everything_behind_it() {
	let h = harness().await;
	let queue = h.engine.queue();

	h.engine.connectivity().set_online(true);
	h.remote.push_result(Err(ProviderError::Unavailable {
		status: 503,
		message: "down".to_string(),
	}));

	let first = queue
		.enqueue("records", MutationOp::Insert, &record_row("a", "one"))
		.await
		.expect("Failed to enqueue insert.");

	queue
		.enqueue("records", MutationOp::Update, &json!({ "id": "a", "status": "done" }))
		.await
		.expect("Failed to enqueue update.");
	queue
		.enqueue("records", MutationOp::Delete, &json!({ "id": "b" }))
		.await
		.expect("Failed to enqueue delete.");

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.synced, 0);
	assert_eq!(report.blocked_on, Some(first));
	assert_eq!(h.remote.call_ids(), vec!["a"]);
	assert_eq!(queue.pending_count().await.expect("Failed to count."), 3);

	let entry = outbox::get_mutation(&h.store.db.pool, first)
		.await
		.expect("Failed to load mutation.")
		.expect("Missing mutation.");

	assert_eq!(entry.attempts, 1);
	assert!(entry.last_error.is_some());
	assert!(!entry.quarantined, "Transient failures never quarantine.");

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.synced, 3);
	assert_eq!(report.blocked_on, None);

	let calls = h.remote.calls();

	assert_eq!(calls[2].body, Some(json!({ "id": "a", "status": "done" })));

	let ops: Vec<_> = calls.into_iter().map(|call| (call.op, call.id)).collect();

	assert_eq!(
		ops,
		vec![
			("upsert", "a".to_string()),
			("upsert", "a".to_string()),
			("update", "a".to_string()),
			("delete", "b".to_string()),
		]
	);

	let snapshot = h.engine.health().snapshot();

	assert_eq!(snapshot.transient_failures, 1);
	assert_eq!(snapshot.synced, 3);
}

#[tokio::test]
async fn rejected_mutation_is_quarantined_after_the_limit() {
	let h = harness().await;
	let queue = h.engine.queue();

	h.engine.connectivity().set_online(true);

	for _ in 0..3 {
		h.remote.push_result(Err(ProviderError::Rejected {
			status: 422,
			message: "violates check constraint".to_string(),
		}));
	}

	let bad = queue
		.enqueue("records", MutationOp::Insert, &record_row("bad", "x"))
		.await
		.expect("Failed to enqueue.");

	queue
		.enqueue("records", MutationOp::Insert, &record_row("good", "y"))
		.await
		.expect("Failed to enqueue.");

	for _ in 0..2 {
		let report = queue.drain().await.expect("Drain failed.");

		assert_eq!(report.blocked_on, Some(bad));
		assert_eq!(report.synced, 0);
	}

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.quarantined, 1);
	assert_eq!(report.synced, 1);
	assert_eq!(h.remote.call_ids(), vec!["bad", "bad", "bad", "good"]);

	let quarantined = queue.quarantined().await.expect("Failed to list quarantined.");

	assert_eq!(quarantined.len(), 1);
	assert_eq!(quarantined[0].seq, bad);
	assert_eq!(quarantined[0].attempts, 3);

	let snapshot = h.engine.health().snapshot();

	assert_eq!(snapshot.rejections, 3);
	assert_eq!(snapshot.quarantined, 1);

	assert_eq!(queue.requeue_quarantined().await.expect("Requeue failed."), 1);

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.synced, 1);
	assert!(queue.quarantined().await.expect("Failed to list quarantined.").is_empty());
}

#[tokio::test]
async fn undecodable_snapshot_is_quarantined_without_a_remote_call() {
	let h = harness().await;
	let queue = h.engine.queue();

	h.engine.connectivity().set_online(true);

	queue
		.enqueue("records", MutationOp::Update, &json!({ "status": "done" }))
		.await
		.expect("Failed to enqueue.");
	queue
		.enqueue("records", MutationOp::Insert, &record_row("a", "ok"))
		.await
		.expect("Failed to enqueue.");

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.quarantined, 1);
	assert_eq!(report.synced, 1);
	assert_eq!(h.remote.call_ids(), vec!["a"]);
}

#[tokio::test]
async fn drain_is_a_no_op_while_offline() {
	let h = harness().await;
	let queue = h.engine.queue();

	queue
		.enqueue("records", MutationOp::Insert, &record_row("a", "x"))
		.await
		.expect("Failed to enqueue.");

	let report = queue.drain().await.expect("Drain failed.");

	assert_eq!(report.synced, 0);
	assert!(h.remote.calls().is_empty());
	assert_eq!(queue.pending_count().await.expect("Failed to count."), 1);
}

#[tokio::test]
async fn concurrent_drain_reports_skipped() {
	let h = harness_with(
		HashEmbedding::new(Duration::ZERO),
		SpyRemote::new(Duration::from_millis(300)),
	)
	.await;
	let queue = h.engine.queue().clone();

	h.engine.connectivity().set_online(true);
	queue
		.enqueue("records", MutationOp::Insert, &record_row("a", "x"))
		.await
		.expect("Failed to enqueue.");

	let background = {
		let queue = queue.clone();

		tokio::spawn(async move { queue.drain().await })
	};
	let remote = &h.remote;
	let started =
		tether_testkit::wait_until(WAIT, || async move { !remote.calls().is_empty() }).await;

	assert!(started, "First drain never reached the remote.");

	let report = queue.drain().await.expect("Drain failed.");

	assert!(report.skipped);
	assert_eq!(report.synced, 0);

	let report = background.await.expect("Drain task panicked.").expect("Drain failed.");

	assert!(!report.skipped);
	assert_eq!(report.synced, 1);
	assert_eq!(h.remote.calls().len(), 1);
}

#[tokio::test]
async fn drain_after_stop_reports_skipped_until_restarted() {
	let h = harness().await;
	let queue = h.engine.queue();

	h.engine.start();
	h.engine.stop().await;

	assert!(queue.is_stopped());

	h.engine.connectivity().set_online(true);
	queue
		.enqueue("records", MutationOp::Insert, &record_row("a", "x"))
		.await
		.expect("Failed to enqueue.");

	let report = queue.drain().await.expect("Drain failed.");

	assert!(report.skipped);
	assert_eq!(report.synced, 0);
	assert!(h.remote.calls().is_empty());
	assert_eq!(queue.pending_count().await.expect("Failed to count."), 1);

	h.engine.start();

	let drained = tether_testkit::wait_until(WAIT, || async move {
		queue.pending_count().await.is_ok_and(|count| count == 0)
	})
	.await;

	assert!(drained, "Queue did not drain after restart.");
	assert_eq!(h.remote.call_ids(), vec!["a"]);

	h.engine.stop().await;
}
