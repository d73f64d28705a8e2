use crate::transfer::{GroupedTransaction, TransferEvent};
use rusqlite::{Connection, ErrorCode, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Error types for transfer stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("SQLite error: {0}")]
	Sqlite(#[from] rusqlite::Error),

	#[error("Store lock poisoned")]
	Lock,

	#[error("Store task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

impl StoreError {
	/// Whether retrying the same write may succeed.
	pub fn is_transient(&self) -> bool {
		match self {
			StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
				e.code,
				ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
			),
			_ => false,
		}
	}
}

/// One persisted transfer row.
///
/// The amount is stored as decimal text, block and log positions as integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRow {
	pub transaction_id: String,
	pub log_index: u64,
	pub sender: String,
	pub receiver: String,
	pub amount: String,
	pub block_number: u64,
	pub timestamp: String,
}

impl TransferRow {
	pub fn from_event(event: &TransferEvent) -> Self {
		Self {
			transaction_id: event.transaction_id.to_string(),
			log_index: event.log_index,
			sender: event.sender.to_string(),
			receiver: event.receiver.to_string(),
			amount: event.amount.to_string(),
			block_number: event.block_number,
			timestamp: event.observed_at.to_rfc3339(),
		}
	}

	/// Rows for every transfer of a group, in log order.
	pub fn from_group(group: &GroupedTransaction) -> Vec<Self> {
		group.transfers.iter().map(Self::from_event).collect()
	}

	fn key(&self) -> (String, u64) {
		(self.transaction_id.clone(), self.log_index)
	}
}

/// Idempotent storage for transfer rows
#[async_trait::async_trait]
pub trait TransferStore: Send + Sync {
	/// Insert rows keyed by `(transaction_id, log_index)`.
	///
	/// Rows whose key already exists are ignored, never overwritten. Returns
	/// the number of rows actually inserted.
	async fn upsert_transfers(&self, rows: &[TransferRow]) -> Result<usize, StoreError>;

	async fn count(&self) -> Result<u64, StoreError>;
}

/// SQLite-backed implementation of TransferStore
pub struct SqliteTransferStore {
	conn: Arc<Mutex<Connection>>,
}

impl SqliteTransferStore {
	/// Open or create a database at the given path.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let path = path.as_ref();
		let conn = Connection::open(path)?;
		let store = Self {
			conn: Arc::new(Mutex::new(conn)),
		};
		store.init_schema()?;
		info!("Opened transfer store at {:?}", path);
		Ok(store)
	}

	#[cfg(test)]
	pub fn in_memory() -> Result<Self, StoreError> {
		let conn = Connection::open_in_memory()?;
		let store = Self {
			conn: Arc::new(Mutex::new(conn)),
		};
		store.init_schema()?;
		Ok(store)
	}

	fn init_schema(&self) -> Result<(), StoreError> {
		let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

		conn.execute_batch(
			r#"
            CREATE TABLE IF NOT EXISTS transfers (
                transaction_id TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                amount TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (transaction_id, log_index)
            );

            CREATE INDEX IF NOT EXISTS transfers_block_number ON transfers (block_number);
            "#,
		)?;

		Ok(())
	}

	fn insert_batch(conn: &mut Connection, rows: &[TransferRow]) -> Result<usize, StoreError> {
		let tx = conn.transaction()?;
		let mut inserted = 0;
		{
			let mut stmt = tx.prepare_cached(
				"INSERT INTO transfers
                 (transaction_id, log_index, sender, receiver, amount, block_number, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (transaction_id, log_index) DO NOTHING",
			)?;

			for row in rows {
				inserted += stmt.execute(params![
					row.transaction_id,
					row.log_index as i64,
					row.sender,
					row.receiver,
					row.amount,
					row.block_number as i64,
					row.timestamp,
				])?;
			}
		}
		tx.commit()?;
		Ok(inserted)
	}
}

#[async_trait::async_trait]
impl TransferStore for SqliteTransferStore {
	async fn upsert_transfers(&self, rows: &[TransferRow]) -> Result<usize, StoreError> {
		if rows.is_empty() {
			return Ok(0);
		}

		let conn = Arc::clone(&self.conn);
		let rows = rows.to_vec();
		tokio::task::spawn_blocking(move || {
			let mut conn = conn.lock().map_err(|_| StoreError::Lock)?;
			Self::insert_batch(&mut conn, &rows)
		})
		.await?
	}

	async fn count(&self) -> Result<u64, StoreError> {
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let conn = conn.lock().map_err(|_| StoreError::Lock)?;
			let count: i64 = conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
			Ok(count as u64)
		})
		.await?
	}
}

/// In-process implementation of TransferStore, used when no database is configured
#[derive(Default)]
pub struct MemoryTransferStore {
	rows: Mutex<BTreeMap<(String, u64), TransferRow>>,
}

impl MemoryTransferStore {
	pub fn new() -> Self {
		Self::default()
	}

	#[cfg(test)]
	pub fn rows(&self) -> Vec<TransferRow> {
		self.rows
			.lock()
			.map(|rows| rows.values().cloned().collect())
			.unwrap_or_default()
	}
}

#[async_trait::async_trait]
impl TransferStore for MemoryTransferStore {
	async fn upsert_transfers(&self, rows: &[TransferRow]) -> Result<usize, StoreError> {
		let mut stored = self.rows.lock().map_err(|_| StoreError::Lock)?;
		let mut inserted = 0;
		for row in rows {
			if let std::collections::btree_map::Entry::Vacant(entry) = stored.entry(row.key()) {
				entry.insert(row.clone());
				inserted += 1;
			}
		}
		Ok(inserted)
	}

	async fn count(&self) -> Result<u64, StoreError> {
		let stored = self.rows.lock().map_err(|_| StoreError::Lock)?;
		Ok(stored.len() as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transfer::types::fixtures::transfer;
	use alloy_primitives::U256;

	fn group() -> GroupedTransaction {
		GroupedTransaction::from_events(vec![
			transfer(1, 1, 0xB, 0xC, 3, 100),
			transfer(1, 0, 0xA, 0xB, 5, 100),
		])
		.unwrap()
	}

	#[test]
	fn rows_follow_log_order_and_use_decimal_amounts() {
		let mut events = group().transfers;
		events[0].amount = U256::from(10).pow(U256::from(30));
		let rows: Vec<TransferRow> = events.iter().map(TransferRow::from_event).collect();

		assert_eq!(rows[0].log_index, 0);
		assert_eq!(rows[1].log_index, 1);
		assert_eq!(rows[0].amount, format!("1{}", "0".repeat(30)));
		assert!(rows[0].transaction_id.starts_with("0x"));
	}

	#[tokio::test]
	async fn sqlite_upsert_ignores_existing_keys() {
		let store = SqliteTransferStore::in_memory().unwrap();
		let rows = TransferRow::from_group(&group());

		assert_eq!(store.upsert_transfers(&rows).await.unwrap(), 2);
		assert_eq!(store.upsert_transfers(&rows).await.unwrap(), 0);
		assert_eq!(store.count().await.unwrap(), 2);
	}

	#[tokio::test]
	async fn sqlite_conflicting_rows_are_not_overwritten() {
		let store = SqliteTransferStore::in_memory().unwrap();
		let original = TransferRow::from_group(&group());
		store.upsert_transfers(&original).await.unwrap();

		let mut changed = original[0].clone();
		changed.amount = "999".to_string();
		assert_eq!(store.upsert_transfers(&[changed]).await.unwrap(), 0);

		let conn = store.conn.lock().unwrap();
		let amount: String = conn
			.query_row(
				"SELECT amount FROM transfers WHERE transaction_id = ?1 AND log_index = 0",
				params![original[0].transaction_id],
				|row| row.get(0),
			)
			.unwrap();
		assert_eq!(amount, original[0].amount);
	}

	#[tokio::test]
	async fn memory_store_is_idempotent() {
		let store = MemoryTransferStore::new();
		let rows = TransferRow::from_group(&group());

		assert_eq!(store.upsert_transfers(&rows).await.unwrap(), 2);
		assert_eq!(store.upsert_transfers(&rows[..1]).await.unwrap(), 0);
		assert_eq!(store.count().await.unwrap(), 2);
		assert_eq!(store.rows().len(), 2);
	}

	#[test]
	fn busy_database_is_transient() {
		let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
			rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
			None,
		));
		assert!(busy.is_transient());
		let locked = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
			rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
			None,
		));
		assert!(locked.is_transient());
		assert!(!StoreError::Lock.is_transient());
	}
}
