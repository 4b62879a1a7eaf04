//! Persisted store.
//!
//! The relational store is the single source of truth; the rest of the
//! core only talks to it through the query/write functions in the
//! per-entity submodules. Writers are serialized (one logical writer
//! transaction at a time), readers run against WAL snapshots.

pub mod chats;
pub mod config;
pub mod contacts;
pub mod jobs;
pub mod locations;
pub mod messages;
pub mod pool;
pub mod schema;
pub mod tokens;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Transaction;

use crate::error::Result;

pub use pool::{DbConnection, DbPool};

/// Handle to one opened database file.
#[derive(Debug)]
pub struct Sql {
    pool: DbPool,
    dbfile: PathBuf,
    write_lock: Mutex<()>,
}

impl Sql {
    pub fn open(dbfile: &Path) -> Result<Self> {
        let pool = pool::create_pool(dbfile)?;
        {
            let conn = pool.get()?;
            schema::initialize_schema(&conn)?;
        }
        Ok(Self {
            pool,
            dbfile: dbfile.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dbfile(&self) -> &Path {
        &self.dbfile
    }

    pub fn conn(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Run a write statement under the writer lock.
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Run several write statements atomically. Used where a dequeue or
    /// a multi-row update must not interleave with other writers.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock().unwrap();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn()?;
        Ok(conn.query_row(sql, params, f)?)
    }

    pub fn query_row_optional<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        use rusqlite::OptionalExtension;
        let conn = self.conn()?;
        Ok(conn.query_row(sql, params, f).optional()?)
    }

    pub fn exists<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<bool> {
        let conn = self.conn()?;
        let sql = format!("SELECT EXISTS({})", sql);
        Ok(conn.query_row(&sql, params, |row| row.get(0))?)
    }

    pub fn count<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<u32> {
        let conn = self.conn()?;
        Ok(conn.query_row(sql, params, |row| row.get(0))?)
    }

    /// Collect mapped rows into a Vec.
    pub fn query_map<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| f(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Purge rows that no longer serve a purpose: trashed messages and
    /// stale secure-join tokens.
    pub fn housekeeping(&self) -> Result<()> {
        let deleted = self.execute(
            "DELETE FROM msgs WHERE chat_id=?",
            [crate::chat::CHAT_ID_TRASH],
        )?;
        let week_ago = crate::tools::time() - 7 * 24 * 3600;
        let tokens = self.execute("DELETE FROM tokens WHERE timestamp<?", [week_ago])?;
        tracing::info!(
            "housekeeping: removed {} trashed messages, {} stale tokens",
            deleted,
            tokens
        );
        Ok(())
    }
}
