use std::time::Duration;

use tether_providers::Error as ProviderError;
use tether_sync::{ChangeMessage, ConsumerState, SyncEvent};

use super::{WAIT, harness, insert};

#[tokio::test]
async fn consumer_applies_batches_and_reconnects_after_errors() {
	let h = harness().await;
	let mut events = h.engine.health().subscribe();

	h.feed.push(Ok(vec![insert("a", "milk"), ChangeMessage::control_message("up-to-date")]));
	h.feed.push(Err(ProviderError::Unavailable { status: 502, message: "bad gateway".to_string() }));
	h.engine.consumer().start();

	let (engine, feed) = (&h.engine, &h.feed);
	let reconnected = tether_testkit::wait_until(WAIT, || async move {
		feed.subscriptions() >= 2
			&& engine.get_record("a").await.ok().flatten().is_some()
	})
	.await;

	assert!(reconnected, "Consumer did not apply the batch and reconnect.");

	h.engine.consumer().stop().await;

	assert_eq!(h.engine.consumer().state(), ConsumerState::Disconnected);

	let mut states = Vec::new();
	let mut stream_errors = 0;

	while let Ok(event) = events.try_recv() {
		match event {
			SyncEvent::ConsumerStateChanged { state } => states.push(state),
			SyncEvent::StreamError { .. } => stream_errors += 1,
			_ => {},
		}
	}

	assert_eq!(stream_errors, 1);
	assert_eq!(
		&states[..3],
		&[ConsumerState::Connecting, ConsumerState::Streaming, ConsumerState::Disconnected]
	);
	assert_eq!(states.last(), Some(&ConsumerState::Disconnected));
	assert!(h.engine.health().snapshot().last_error.is_some());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_aborts_the_fetch() {
	let h = harness().await;
	let consumer = h.engine.consumer();

	consumer.start();
	consumer.start();

	let feed = &h.feed;
	let subscribed =
		tether_testkit::wait_until(WAIT, || async move { feed.subscriptions() == 1 }).await;

	assert!(subscribed);

	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(h.feed.subscriptions(), 1);
	assert_eq!(consumer.state(), ConsumerState::Connecting);

	tokio::time::timeout(WAIT, consumer.stop()).await.expect("Stop hung on a parked fetch.");

	assert_eq!(consumer.state(), ConsumerState::Disconnected);

	consumer.start();

	let resubscribed =
		tether_testkit::wait_until(WAIT, || async move { feed.subscriptions() == 2 }).await;

	assert!(resubscribed, "Consumer did not restart after stop.");

	h.engine.stop().await;
}
