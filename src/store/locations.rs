use rusqlite::params;

use crate::error::Result;
use crate::location::Location;

use super::Sql;

fn row_to_location(row: &rusqlite::Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        accuracy: row.get(3)?,
        timestamp: row.get(4)?,
        chat_id: row.get(5)?,
        contact_id: row.get(6)?,
        independent: row.get(7)?,
    })
}

const LOCATION_FIELDS: &str =
    "id, latitude, longitude, accuracy, timestamp, chat_id, from_id, independent";

#[allow(clippy::too_many_arguments)]
pub fn insert(
    sql: &Sql,
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    timestamp: i64,
    chat_id: u32,
    from_id: u32,
    independent: bool,
) -> Result<u32> {
    sql.transaction(|tx| {
        tx.execute(
            "INSERT INTO locations (latitude, longitude, accuracy, timestamp, chat_id, \
             from_id, independent) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![latitude, longitude, accuracy, timestamp, chat_id, from_id, independent],
        )?;
        Ok(tx.last_insert_rowid() as u32)
    })
}

/// Track points of one chat in a time range, newest first. A zero
/// `contact_id` means all senders.
pub fn get_range(
    sql: &Sql,
    chat_id: u32,
    contact_id: u32,
    timestamp_begin: i64,
    timestamp_end: i64,
) -> Result<Vec<Location>> {
    sql.query_map(
        &format!(
            "SELECT {} FROM locations
             WHERE chat_id=? AND (?=0 OR from_id=?) AND timestamp>=? AND timestamp<=?
             ORDER BY timestamp DESC, id DESC",
            LOCATION_FIELDS
        ),
        params![chat_id, contact_id, contact_id, timestamp_begin, timestamp_end],
        row_to_location,
    )
}

/// Own unsent track points of a chat, oldest first.
pub fn unsent_for_chat(sql: &Sql, chat_id: u32, self_id: u32) -> Result<Vec<Location>> {
    sql.query_map(
        &format!(
            "SELECT {} FROM locations
             WHERE chat_id=? AND from_id=? AND sent=0 AND independent=0
             ORDER BY timestamp, id",
            LOCATION_FIELDS
        ),
        params![chat_id, self_id],
        row_to_location,
    )
}

pub fn mark_sent(sql: &Sql, location_ids: &[u32]) -> Result<()> {
    for &id in location_ids {
        sql.execute("UPDATE locations SET sent=1 WHERE id=?", [id])?;
    }
    Ok(())
}

pub fn delete_all(sql: &Sql) -> Result<()> {
    sql.execute("DELETE FROM locations", [])?;
    Ok(())
}
