use rusqlite::params;

use crate::contact::{Contact, Origin, CONTACT_ID_LAST_SPECIAL};
use crate::error::Result;
use crate::tools::time;

use super::Sql;

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        display_name: row.get(1)?,
        addr: row.get(2)?,
        origin: Origin::from_i32(row.get(3)?),
        blocked: row.get(4)?,
        verified: row.get(5)?,
    })
}

pub fn get(sql: &Sql, contact_id: u32) -> Result<Option<Contact>> {
    sql.query_row_optional(
        "SELECT id, name, addr, origin, blocked, verified FROM contacts WHERE id=?",
        [contact_id],
        row_to_contact,
    )
}

pub fn lookup_id_by_addr(sql: &Sql, addr: &str) -> Result<Option<u32>> {
    sql.query_row_optional(
        "SELECT id FROM contacts WHERE addr=? AND id>?",
        params![addr, CONTACT_ID_LAST_SPECIAL],
        |row| row.get(0),
    )
}

/// Insert a row for the address or update the existing one. The origin
/// never decreases; an empty incoming display name never overwrites a
/// user-entered one. Returns `(id, modified)`.
pub fn add_or_lookup(sql: &Sql, name: &str, addr: &str, origin: Origin) -> Result<(u32, bool)> {
    sql.transaction(|tx| {
        use rusqlite::OptionalExtension;
        let existing: Option<(u32, String, i32)> = tx
            .query_row(
                "SELECT id, name, origin FROM contacts WHERE addr=?",
                [addr],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            Some((id, old_name, old_origin)) => {
                let new_origin = std::cmp::max(old_origin, origin as i32);
                let new_name = if old_name.is_empty() && !name.is_empty() {
                    name
                } else {
                    &old_name
                };
                let modified = new_origin != old_origin || new_name != old_name;
                if modified {
                    tx.execute(
                        "UPDATE contacts SET name=?, origin=? WHERE id=?",
                        params![new_name, new_origin, id],
                    )?;
                }
                Ok((id, modified))
            }
            None => {
                tx.execute(
                    "INSERT INTO contacts (name, addr, origin, created_at) VALUES (?, ?, ?, ?)",
                    params![name, addr, origin as i32, time()],
                )?;
                let id = tx.last_insert_rowid() as u32;
                Ok((id, true))
            }
        }
    })
}

pub fn set_blocked(sql: &Sql, contact_id: u32, blocked: bool) -> Result<()> {
    sql.execute(
        "UPDATE contacts SET blocked=? WHERE id=?",
        params![blocked, contact_id],
    )?;
    Ok(())
}

pub fn set_verified(sql: &Sql, contact_id: u32, verified: bool) -> Result<()> {
    sql.execute(
        "UPDATE contacts SET verified=? WHERE id=?",
        params![verified, contact_id],
    )?;
    Ok(())
}

pub fn get_all_known(sql: &Sql) -> Result<Vec<u32>> {
    sql.query_map(
        "SELECT id FROM contacts
         WHERE id>? AND blocked=0 AND origin>=?
         ORDER BY name COLLATE NOCASE, addr",
        params![CONTACT_ID_LAST_SPECIAL, Origin::IncomingReplyTo as i32],
        |row| row.get(0),
    )
}
