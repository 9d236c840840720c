/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Handle to the board database. Cheap to clone; every call opens its own connection.
#[derive(Clone)]
pub struct Db {
    path: PathBuf,
}

const OBJECT_COLUMNS_DDL: &str = r#"
  id TEXT PRIMARY KEY,
  type TEXT NOT NULL,
  name TEXT NOT NULL DEFAULT '',
  content TEXT NOT NULL DEFAULT '',
  attributedto TEXT NOT NULL DEFAULT '',
  tripcode TEXT NOT NULL DEFAULT '',
  actor TEXT NOT NULL DEFAULT '',
  published_ms INTEGER NOT NULL,
  updated_ms INTEGER NULL,
  deleted_ms INTEGER NULL,
  attachment TEXT NOT NULL DEFAULT '',
  preview TEXT NOT NULL DEFAULT '',
  href TEXT NOT NULL DEFAULT '',
  mediatype TEXT NOT NULL DEFAULT '',
  size INTEGER NOT NULL DEFAULT 0,
  sensitive INTEGER NOT NULL DEFAULT 0
"#;

impl Db {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("create db dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS activitystream ({OBJECT_COLUMNS_DDL});
            CREATE TABLE IF NOT EXISTS cacheactivitystream ({OBJECT_COLUMNS_DDL});
            CREATE INDEX IF NOT EXISTS activitystream_actor_published
              ON activitystream(actor, published_ms DESC);
            CREATE INDEX IF NOT EXISTS activitystream_attachment ON activitystream(attachment);
            CREATE INDEX IF NOT EXISTS cacheactivitystream_actor_published
              ON cacheactivitystream(actor, published_ms DESC);
            CREATE INDEX IF NOT EXISTS cacheactivitystream_attachment ON cacheactivitystream(attachment);

            CREATE TABLE IF NOT EXISTS replies (
              id TEXT NOT NULL,
              inreplyto TEXT NOT NULL DEFAULT '',
              PRIMARY KEY(id, inreplyto)
            );
            CREATE INDEX IF NOT EXISTS replies_inreplyto ON replies(inreplyto);

            CREATE TABLE IF NOT EXISTS sticky (
              actor_id TEXT NOT NULL,
              activity_id TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS locked (
              actor_id TEXT NOT NULL,
              activity_id TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS reported (
              id TEXT PRIMARY KEY,
              count INTEGER NOT NULL DEFAULT 0,
              reason TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS publickeypem (
              id TEXT PRIMARY KEY,
              owner TEXT NOT NULL UNIQUE,
              file TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actor (
              id TEXT PRIMARY KEY,
              type TEXT NOT NULL DEFAULT 'Group',
              name TEXT NOT NULL UNIQUE,
              preferredusername TEXT NOT NULL DEFAULT '',
              summary TEXT NOT NULL DEFAULT '',
              inbox TEXT NOT NULL DEFAULT '',
              outbox TEXT NOT NULL DEFAULT '',
              following TEXT NOT NULL DEFAULT '',
              followers TEXT NOT NULL DEFAULT '',
              publickeypem TEXT NOT NULL DEFAULT '',
              restricted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS follower (
              id TEXT NOT NULL,
              follower TEXT NOT NULL,
              PRIMARY KEY(id, follower)
            );
            CREATE TABLE IF NOT EXISTS following (
              id TEXT NOT NULL,
              following TEXT NOT NULL,
              PRIMARY KEY(id, following)
            );

            CREATE TABLE IF NOT EXISTS accounts (
              username TEXT PRIMARY KEY,
              email TEXT NULL,
              type INTEGER NOT NULL DEFAULT 0
            );
            "#
        ))
        .context("init db schema")?;

        // Databases created before sensitivity tracking.
        ensure_columns(&conn, "activitystream", &[("sensitive", "INTEGER NOT NULL DEFAULT 0")])?;
        ensure_columns(&conn, "cacheactivitystream", &[("sensitive", "INTEGER NOT NULL DEFAULT 0")])?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Runs `f` inside one write transaction. Any error rolls the whole unit back.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connect()?;
        f(&conn)
    }
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
pub(crate) fn temp_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Db::open(dir.path().join("board.sqlite")).unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn reopening_is_idempotent() {
        let (dir, db) = temp_db();
        let again = Db::open(dir.path().join("board.sqlite")).unwrap();
        assert_eq!(db.path(), again.path());
    }

    #[test]
    fn failed_write_rolls_back() {
        let (_dir, db) = temp_db();
        let res: Result<()> = db.write(|tx| {
            tx.execute("INSERT INTO replies(id, inreplyto) VALUES (?1, '')", params!["a"])?;
            anyhow::bail!("boom")
        });
        assert!(res.is_err());
        let n: i64 = db
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM replies", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(n, 0);
    }
}
