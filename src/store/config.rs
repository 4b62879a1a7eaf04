use rusqlite::params;

use crate::error::Result;

use super::Sql;

pub fn get(sql: &Sql, key: &str) -> Result<Option<String>> {
    sql.query_row_optional("SELECT value FROM config WHERE keyname=?", [key], |row| {
        row.get(0)
    })
}

/// Set or delete one key. `None` removes the row.
pub fn set(sql: &Sql, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            sql.execute(
                "INSERT INTO config (keyname, value) VALUES (?, ?) \
                 ON CONFLICT(keyname) DO UPDATE SET value=excluded.value",
                params![key, value],
            )?;
        }
        None => {
            sql.execute("DELETE FROM config WHERE keyname=?", [key])?;
        }
    }
    Ok(())
}
