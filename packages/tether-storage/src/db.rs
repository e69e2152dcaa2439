use std::time::Duration;

use sqlx::{
	SqlitePool,
	sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

use crate::{Result, schema};

#[derive(Clone, Debug)]
pub struct Db {
	pub pool: SqlitePool,
}
impl Db {
	pub async fn connect(cfg: &tether_config::Sqlite) -> Result<Self> {
		Self::open(&cfg.path, cfg.pool_max_conns, cfg.busy_timeout_ms).await
	}

	pub async fn open(path: &str, max_conns: u32, busy_timeout_ms: u64) -> Result<Self> {
		let options = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.foreign_keys(true)
			.busy_timeout(Duration::from_millis(busy_timeout_ms));
		let pool =
			SqlitePoolOptions::new().max_connections(max_conns).connect_with(options).await?;

		Ok(Self { pool })
	}

	/// Creates the record and mutation queue tables.
	pub async fn ensure_schema(&self) -> Result<()> {
		self.apply_schema(&schema::render_schema()).await
	}

	pub(crate) async fn apply_schema(&self, sql: &str) -> Result<()> {
		let mut tx = self.pool.begin().await?;

		for statement in sql.split(';') {
			let trimmed = statement.trim();

			if trimmed.is_empty() {
				continue;
			}

			sqlx::query(trimmed).execute(&mut *tx).await?;
		}

		tx.commit().await?;

		Ok(())
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}
}
