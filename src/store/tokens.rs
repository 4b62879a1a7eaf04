use rusqlite::params;

use crate::error::Result;
use crate::tools::time;

use super::Sql;

/// Token namespaces; stored numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Namespace {
    InviteNumber = 100,
    Auth = 110,
}

/// Existing token for (namespace, chat), or a freshly minted one.
pub fn lookup_or_new(sql: &Sql, namespc: Namespace, foreign_chat_id: u32) -> Result<String> {
    if let Some(token) = lookup(sql, namespc, foreign_chat_id)? {
        return Ok(token);
    }
    let token = crate::tools::create_token();
    sql.execute(
        "INSERT INTO tokens (namespc, foreign_chat_id, token, timestamp) VALUES (?, ?, ?, ?)",
        params![namespc as i32, foreign_chat_id, token, time()],
    )?;
    Ok(token)
}

pub fn lookup(sql: &Sql, namespc: Namespace, foreign_chat_id: u32) -> Result<Option<String>> {
    sql.query_row_optional(
        "SELECT token FROM tokens WHERE namespc=? AND foreign_chat_id=?",
        params![namespc as i32, foreign_chat_id],
        |row| row.get(0),
    )
}

/// True if we issued this token, in any chat binding.
pub fn exists(sql: &Sql, namespc: Namespace, token: &str) -> Result<bool> {
    sql.exists(
        "SELECT 1 FROM tokens WHERE namespc=? AND token=?",
        params![namespc as i32, token],
    )
}

/// The chat a token was issued for; 0 means a contact-setup token.
pub fn chat_id_for(sql: &Sql, namespc: Namespace, token: &str) -> Result<Option<u32>> {
    sql.query_row_optional(
        "SELECT foreign_chat_id FROM tokens WHERE namespc=? AND token=?",
        params![namespc as i32, token],
        |row| row.get(0),
    )
}
