//! SQLite implementation of the durable store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{DurableStore, Record};

/// Schema for the partitioned record table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    partition TEXT NOT NULL,
    key TEXT NOT NULL,
    idx TEXT NOT NULL DEFAULT '',
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key)
);

CREATE INDEX IF NOT EXISTS idx_records_partition_idx
    ON records(partition, idx);
"#;

/// Upsert that keeps the rowid of an existing record, so overwrites do not
/// move a record behind later insertions with the same secondary key.
const UPSERT: &str = "INSERT INTO records (partition, key, idx, value, written_at)
   VALUES (?1, ?2, ?3, ?4, datetime('now'))
   ON CONFLICT(partition, key) DO UPDATE SET
     idx = excluded.idx,
     value = excluded.value,
     written_at = excluded.written_at";

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) a store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();

    Self::with_connection(conn)
  }

  /// Open a private in-memory store. Contents vanish with the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl DurableStore for SqliteStore {
  fn get(&self, partition: &str, key: &str) -> Result<Option<Record>> {
    let conn = self.conn()?;

    conn
      .query_row(
        "SELECT key, idx, value FROM records WHERE partition = ? AND key = ?",
        params![partition, key],
        |row| {
          Ok(Record {
            key: row.get(0)?,
            index: row.get(1)?,
            value: row.get(2)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}/{}: {}", partition, key, e))
  }

  fn put(&self, partition: &str, record: &Record) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      UPSERT,
      params![partition, record.key, record.index, record.value],
    )
    .map_err(|e| eyre!("Failed to write {}/{}: {}", partition, record.key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    let conn = self.conn()?;

    let deleted = conn
      .execute(
        "DELETE FROM records WHERE partition = ? AND key = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", partition, key, e))?;

    Ok(deleted > 0)
  }

  fn delete_prefix(&self, partition: &str, prefix: &str) -> Result<usize> {
    let conn = self.conn()?;

    // substr() instead of LIKE so '%' and '_' in keys are matched literally
    conn
      .execute(
        "DELETE FROM records WHERE partition = ?1 AND substr(key, 1, ?2) = ?3",
        params![partition, prefix.chars().count() as i64, prefix],
      )
      .map_err(|e| eyre!("Failed to delete prefix {} in {}: {}", prefix, partition, e))
  }

  fn scan_by_index(&self, partition: &str) -> Result<Vec<Record>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT key, idx, value FROM records
         WHERE partition = ?
         ORDER BY idx, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare scan: {}", e))?;

    let records = stmt
      .query_map(params![partition], |row| {
        Ok(Record {
          key: row.get(0)?,
          index: row.get(1)?,
          value: row.get(2)?,
        })
      })
      .map_err(|e| eyre!("Failed to scan {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read row in {}: {}", partition, e))?;

    Ok(records)
  }

  fn transfer(&self, from: &str, key: &str, to: &str, record: &Record) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM records WHERE partition = ? AND key = ?",
      params![from, key],
    )
    .map_err(|e| eyre!("Failed to delete {}/{}: {}", from, key, e))?;

    tx.execute(UPSERT, params![to, record.key, record.index, record.value])
      .map_err(|e| eyre!("Failed to write {}/{}: {}", to, record.key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM records WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", partition, e))?;

    Ok(count as usize)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT partition FROM records ORDER BY partition")
      .map_err(|e| eyre!("Failed to prepare partition listing: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn drop_partition(&self, partition: &str) -> Result<usize> {
    let conn = self.conn()?;

    conn
      .execute(
        "DELETE FROM records WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to drop partition {}: {}", partition, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_put_get_delete() {
    let s = store();
    s.put("p", &Record::new("a", "1", b"one".to_vec())).unwrap();

    let got = s.get("p", "a").unwrap().unwrap();
    assert_eq!(got.value, b"one");
    assert!(s.get("other", "a").unwrap().is_none());

    assert!(s.delete("p", "a").unwrap());
    assert!(!s.delete("p", "a").unwrap());
    assert!(s.get("p", "a").unwrap().is_none());
  }

  #[test]
  fn test_scan_orders_by_index_then_insertion() {
    let s = store();
    s.put("p", &Record::new("c", "2", vec![])).unwrap();
    s.put("p", &Record::new("b", "1", vec![])).unwrap();
    s.put("p", &Record::new("a", "1", vec![])).unwrap();

    // Overwriting "b" must not move it behind "a"
    s.put("p", &Record::new("b", "1", vec![9])).unwrap();

    let keys: Vec<_> = s
      .scan_by_index("p")
      .unwrap()
      .into_iter()
      .map(|r| r.key)
      .collect();
    assert_eq!(keys, vec!["b", "a", "c"]);
  }

  #[test]
  fn test_delete_prefix_is_literal() {
    let s = store();
    s.put("p", &Record::new("GET /api/checklists", "", vec![])).unwrap();
    s.put("p", &Record::new("GET /api/checklists?id=1", "", vec![])).unwrap();
    s.put("p", &Record::new("GET /api/shots", "", vec![])).unwrap();
    s.put("p", &Record::new("GET /api/check%", "", vec![])).unwrap();

    assert_eq!(s.delete_prefix("p", "GET /api/checklists").unwrap(), 2);
    assert_eq!(s.delete_prefix("p", "GET /api/check_").unwrap(), 0);
    assert_eq!(s.count("p").unwrap(), 2);
  }

  #[test]
  fn test_transfer_and_partitions() {
    let s = store();
    s.put("queue", &Record::new("m1", "t1", vec![1])).unwrap();
    s.put("cache-static-1", &Record::new("x", "", vec![])).unwrap();

    s.transfer("queue", "m1", "dead", &Record::new("m1", "t2", vec![2]))
      .unwrap();

    assert_eq!(s.count("queue").unwrap(), 0);
    assert_eq!(s.get("dead", "m1").unwrap().unwrap().value, vec![2]);
    assert_eq!(s.partitions().unwrap(), vec!["cache-static-1", "dead"]);

    assert_eq!(s.drop_partition("cache-static-1").unwrap(), 1);
    assert_eq!(s.partitions().unwrap(), vec!["dead"]);
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let s = SqliteStore::open(&path).unwrap();
      s.put("p", &Record::new("k", "", b"kept".to_vec())).unwrap();
    }

    let s = SqliteStore::open(&path).unwrap();
    assert_eq!(s.get("p", "k").unwrap().unwrap().value, b"kept");
  }
}
