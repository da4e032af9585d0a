//! `RedbStatCache` — a local stat/blob/check cache backed by `redb`.
//!
//! One `Arc<Database>`, one `TableDefinition` per logical table (stats,
//! blobs, checks), every transaction run inside
//! `tokio::task::spawn_blocking` since redb's API is synchronous.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use rekkord_core::cache::{CheckRow, StatCache, StatRow};
use rekkord_core::error::{RekkordError, RekkordResult};
use rekkord_core::oid::{Hash, Oid};

const STATS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const CHECKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checks");

const STAT_ROW_LEN: usize = 8 + 8 + 4 + 8 + 32 + 8;
const CHECK_ROW_LEN: usize = 8 + 1 + 1;

fn encode_stat_row(row: StatRow) -> [u8; STAT_ROW_LEN] {
    let mut out = [0u8; STAT_ROW_LEN];
    out[0..8].copy_from_slice(&row.mtime.to_le_bytes());
    out[8..16].copy_from_slice(&row.ctime.to_le_bytes());
    out[16..20].copy_from_slice(&row.mode.to_le_bytes());
    out[20..28].copy_from_slice(&row.size.to_le_bytes());
    out[28..60].copy_from_slice(row.hash.as_bytes());
    out[60..68].copy_from_slice(&row.stored.to_le_bytes());
    out
}

fn decode_stat_row(bytes: &[u8]) -> anyhow::Result<StatRow> {
    anyhow::ensure!(bytes.len() == STAT_ROW_LEN, "malformed stat row ({} bytes)", bytes.len());
    let mtime = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let ctime = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let mode = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let size = i64::from_le_bytes(bytes[20..28].try_into().unwrap());
    let hash = Hash::from_bytes(bytes[28..60].try_into().unwrap());
    let stored = i64::from_le_bytes(bytes[60..68].try_into().unwrap());
    Ok(StatRow { mtime, ctime, mode, size, hash, stored })
}

fn encode_check_row(row: CheckRow) -> [u8; CHECK_ROW_LEN] {
    let mut out = [0u8; CHECK_ROW_LEN];
    out[0..8].copy_from_slice(&row.mark.to_le_bytes());
    out[8] = row.valid as u8;
    out[9] = row.retained as u8;
    out
}

fn decode_check_row(bytes: &[u8]) -> anyhow::Result<CheckRow> {
    anyhow::ensure!(bytes.len() == CHECK_ROW_LEN, "malformed check row ({} bytes)", bytes.len());
    let mark = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    Ok(CheckRow { mark, valid: bytes[8] != 0, retained: bytes[9] != 0 })
}

/// A `StatCache` backed by a local `redb` database file, one per cache
/// directory (see [`rekkord_core::cache::cache_dir_name`]).
#[derive(Clone)]
pub struct RedbStatCache {
    db: Arc<Database>,
}

impl RedbStatCache {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("cache.redb"))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(STATS_TABLE)?;
            let _ = write_txn.open_table(BLOBS_TABLE)?;
            let _ = write_txn.open_table(CHECKS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbStatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStatCache").finish()
    }
}

fn map_join_err(e: tokio::task::JoinError) -> RekkordError {
    RekkordError::Other(anyhow::anyhow!("redb cache task failed: {e}"))
}

#[async_trait]
impl StatCache for RedbStatCache {
    async fn get_stat(&self, path: &str) -> RekkordResult<Option<StatRow>> {
        let db = self.db.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<StatRow>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(STATS_TABLE)?;
            table.get(path.as_str())?.map(|guard| decode_stat_row(guard.value())).transpose()
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn put_stat(&self, path: &str, row: StatRow) -> RekkordResult<()> {
        let db = self.db.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(STATS_TABLE)?;
                table.insert(path.as_str(), encode_stat_row(row).as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn has_blob(&self, oid: Oid) -> RekkordResult<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(BLOBS_TABLE)?;
            Ok(table.get(oid.to_string().as_str())?.is_some())
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn put_blob(&self, oid: Oid, size: u64) -> RekkordResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(BLOBS_TABLE)?;
                table.insert(oid.to_string().as_str(), size.to_le_bytes().as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn get_check(&self, oid: Oid) -> RekkordResult<Option<CheckRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<CheckRow>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(CHECKS_TABLE)?;
            table.get(oid.to_string().as_str())?.map(|guard| decode_check_row(guard.value())).transpose()
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn put_check(&self, oid: Oid, row: CheckRow) -> RekkordResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(CHECKS_TABLE)?;
                table.insert(oid.to_string().as_str(), encode_check_row(row).as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn reset(&self) -> RekkordResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                write_txn.delete_table(STATS_TABLE)?;
                write_txn.delete_table(BLOBS_TABLE)?;
                write_txn.delete_table(CHECKS_TABLE)?;
                let _ = write_txn.open_table(STATS_TABLE)?;
                let _ = write_txn.open_table(BLOBS_TABLE)?;
                let _ = write_txn.open_table(CHECKS_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(map_join_err)?
        .map_err(RekkordError::Other)
    }

    async fn flush(&self) -> RekkordResult<()> {
        // Every write above already commits its own transaction.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekkord_core::oid::Catalog;

    #[tokio::test]
    async fn stat_row_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RedbStatCache::open(dir.path()).unwrap();
        let row = StatRow { mtime: 1, ctime: 2, mode: 0o644, size: 100, hash: Hash::from_bytes([7; 32]), stored: 100 };
        cache.put_stat("/a/b", row).await.unwrap();
        let got = cache.get_stat("/a/b").await.unwrap().unwrap();
        assert!(got.matches(1, 2, 0o644, 100));
        assert_eq!(got.hash, row.hash);
        assert!(cache.get_stat("/a/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blob_and_check_rows_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RedbStatCache::open(dir.path()).unwrap();
        let oid = Oid::new(Catalog::Raw, Hash::from_bytes([9; 32]));
        assert!(!cache.has_blob(oid).await.unwrap());
        cache.put_blob(oid, 42).await.unwrap();
        assert!(cache.has_blob(oid).await.unwrap());

        cache.put_check(oid, CheckRow { mark: 123, valid: true, retained: false }).await.unwrap();
        let check = cache.get_check(oid).await.unwrap().unwrap();
        assert_eq!(check.mark, 123);
        assert!(check.valid);
        assert!(!check.retained);
    }

    #[tokio::test]
    async fn reset_clears_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RedbStatCache::open(dir.path()).unwrap();
        let oid = Oid::new(Catalog::Raw, Hash::from_bytes([3; 32]));
        cache.put_blob(oid, 10).await.unwrap();
        cache.put_stat("/x", StatRow { mtime: 0, ctime: 0, mode: 0, size: 0, hash: Hash::from_bytes([0; 32]), stored: 0 }).await.unwrap();
        cache.reset().await.unwrap();
        assert!(!cache.has_blob(oid).await.unwrap());
        assert!(cache.get_stat("/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopening_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let oid = Oid::new(Catalog::Raw, Hash::from_bytes([5; 32]));
        {
            let cache = RedbStatCache::open(dir.path()).unwrap();
            cache.put_blob(oid, 7).await.unwrap();
        }
        let cache = RedbStatCache::open(dir.path()).unwrap();
        assert!(cache.has_blob(oid).await.unwrap());
    }
}
