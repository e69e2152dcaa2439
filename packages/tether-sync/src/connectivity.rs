use std::{sync::Arc, time::Duration};

use tokio::{
	sync::watch,
	time::{self, MissedTickBehavior},
};

use crate::RemoteStore;

/// Online/offline state shared by the queue trigger loop and the application.
#[derive(Clone, Debug)]
pub struct Connectivity {
	tx: Arc<watch::Sender<bool>>,
}
impl Connectivity {
	pub fn new(online: bool) -> Self {
		let (tx, _) = watch::channel(online);

		Self { tx: Arc::new(tx) }
	}

	pub fn is_online(&self) -> bool {
		*self.tx.borrow()
	}

	/// Returns whether the state changed.
	pub fn set_online(&self, online: bool) -> bool {
		let changed = self.tx.send_if_modified(|current| {
			if *current == online {
				return false;
			}

			*current = online;

			true
		});

		if changed {
			tracing::info!(online, "Connectivity changed.");
		}

		changed
	}

	pub fn subscribe(&self) -> watch::Receiver<bool> {
		self.tx.subscribe()
	}
}

/// Probes the remote every `interval` and mirrors reachability into `connectivity` until
/// `shutdown` turns true or its sender is dropped.
pub async fn run_probe(
	connectivity: Connectivity,
	remote: Arc<dyn RemoteStore>,
	cfg: tether_config::Remote,
	interval: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = time::interval(interval);

	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {},
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}

				continue;
			},
		}

		let online = match remote.ping(&cfg).await {
			Ok(()) => true,
			Err(err) => {
				tracing::debug!(error = %err, "Remote probe failed.");

				false
			},
		};

		connectivity.set_online(online);
	}
}
