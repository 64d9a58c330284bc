use crate::domain::ports::{KvBackend, Mutation, Table};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// A persistent row store using RocksDB.
///
/// Every [`Table`] gets its own column family, named after [`Table::name`]. A unit of work's
/// writes go through a single `WriteBatch`, so a commit is all-or-nothing on disk as well.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<DB>,
}

fn storage_error(err: rocksdb::Error) -> SettlementError {
    SettlementError::Transient(err.to_string())
}

impl RocksDbBackend {
    /// Opens or creates a RocksDB instance at `path`, creating any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, families).map_err(storage_error)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, table: Table) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(table.name()).ok_or_else(|| {
            SettlementError::Internal(format!("{} column family not found", table.name()))
        })
    }
}

#[async_trait]
impl KvBackend for RocksDbBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        self.db.get_cf(cf, key).map_err(storage_error)
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(storage_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }

        Ok(rows)
    }

    async fn write_batch(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut writes = WriteBatch::default();
        for mutation in &batch {
            writes.put_cf(self.cf(mutation.table)?, &mutation.key, &mutation.value);
        }
        self.db.write(writes).map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).expect("Failed to open RocksDB");

        for table in Table::ALL {
            assert!(backend.db.cf_handle(table.name()).is_some());
        }
    }

    #[tokio::test]
    async fn test_rocksdb_batch_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = RocksDbBackend::open(dir.path()).unwrap();
            backend
                .write_batch(vec![
                    Mutation {
                        table: Table::Wallets,
                        key: vec![7],
                        value: b"wallet".to_vec(),
                    },
                    Mutation {
                        table: Table::WalletHistory,
                        key: vec![7, 1],
                        value: b"entry".to_vec(),
                    },
                ])
                .await
                .unwrap();
        }

        let backend = RocksDbBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.get(Table::Wallets, &[7]).await.unwrap(),
            Some(b"wallet".to_vec())
        );
        assert!(backend.get(Table::Orders, &[7]).await.unwrap().is_none());

        let history = backend.scan_prefix(Table::WalletHistory, &[7]).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
