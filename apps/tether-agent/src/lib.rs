use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing_subscriber::EnvFilter;

use tether_config::Config;
use tether_storage::{db::Db, models::VectorStats, records, vectors::VectorStore};
use tether_sync::{SyncEngine, connectivity};

#[derive(Debug, Parser)]
#[command(
	version = tether_cli::VERSION,
	rename_all = "kebab",
	styles = tether_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[command(subcommand)]
	pub command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
	/// Sync until interrupted. This is the default.
	Run,
	/// Semantic search over indexed records.
	Search {
		query: String,
		#[arg(long, short = 'k', default_value_t = 5)]
		k: usize,
	},
	/// Record, queue, and vector counts.
	Stats,
	/// Re-embed every record and replace the vector index.
	Reindex,
	/// Return quarantined mutations to the pending queue.
	Requeue,
	/// List pending mutations.
	Pending,
}

#[derive(Debug, Serialize)]
struct StatsReport {
	records: i64,
	pending: i64,
	quarantined: usize,
	vectors: VectorStats,
}

#[derive(Debug, Serialize)]
struct RequeueReport {
	requeued: u64,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = tether_config::load(&args.config)?;

	init_tracing(&config);

	let engine = open_engine(config).await?;

	match args.command.unwrap_or(Command::Run) {
		Command::Run => run_agent(&engine).await?,
		Command::Search { query, k } => {
			let hits = engine.search_text(&query, k).await?;

			tether_cli::print_json(&hits)?;
		},
		Command::Stats => {
			let report = StatsReport {
				records: records::count_records(&engine.db.pool).await?,
				pending: engine.queue().pending_count().await?,
				quarantined: engine.queue().quarantined().await?.len(),
				vectors: engine.vector_stats().await?,
			};

			tether_cli::print_json(&report)?;
		},
		Command::Reindex => {
			let report = engine.reindex_all().await?;

			tether_cli::print_json(&report)?;
		},
		Command::Requeue => {
			let requeued = engine.queue().requeue_quarantined().await?;

			tether_cli::print_json(&RequeueReport { requeued })?;
		},
		Command::Pending => {
			let pending = engine.queue().pending().await?;

			tether_cli::print_json(&pending)?;
		},
	}

	engine.db.close().await;

	Ok(())
}

async fn open_engine(config: Config) -> color_eyre::Result<SyncEngine> {
	let sqlite = &config.storage.sqlite;
	let db = Db::connect(sqlite).await?;

	db.ensure_schema().await?;

	let vector_db = match config.storage.vectors.path.as_deref() {
		Some(path) => Db::open(path, sqlite.pool_max_conns, sqlite.busy_timeout_ms).await?,
		None => db.clone(),
	};
	let vectors = VectorStore::open(vector_db, config.storage.vectors.vector_dim).await?;

	Ok(SyncEngine::new(config, db, vectors)?)
}

async fn run_agent(engine: &SyncEngine) -> color_eyre::Result<()> {
	let (probe_shutdown, probe_rx) = watch::channel(false);
	let probe = tokio::spawn(connectivity::run_probe(
		engine.connectivity().clone(),
		engine.providers().remote.clone(),
		engine.cfg.remote.clone(),
		Duration::from_millis(engine.cfg.sync.connectivity.probe_interval_ms),
		probe_rx,
	));
	let mut events = engine.health().subscribe();
	let ctrl_c = tokio::signal::ctrl_c();

	tokio::pin!(ctrl_c);

	engine.start();

	tracing::info!(table = engine.table(), "Sync agent started.");

	loop {
		tokio::select! {
			signal = &mut ctrl_c => {
				signal?;

				break;
			},
			event = events.recv() => match event {
				Ok(event) => tracing::debug!(?event, "Sync event."),
				Err(RecvError::Lagged(missed)) => {
					tracing::warn!(missed, "Health subscriber lagged.");
				},
				Err(RecvError::Closed) => break,
			},
		}
	}

	tracing::info!("Shutting down sync agent.");

	probe_shutdown.send_replace(true);
	engine.stop().await;
	probe.await?;
	engine.indexer().flush().await;

	let health = engine.health().snapshot();

	tracing::info!(
		synced = health.synced,
		quarantined = health.quarantined,
		rows_applied = health.rows_applied,
		index_failures = health.index_failures,
		"Sync agent stopped."
	);

	Ok(())
}

fn init_tracing(config: &Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}
