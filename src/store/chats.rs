use rusqlite::params;

use crate::chat::{Blocked, Chat, Chattype, CHAT_ID_LAST_SPECIAL};
use crate::error::Result;
use crate::message::MessageState;
use crate::tools::time;

use super::Sql;

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        chattype: Chattype::from_i32(row.get(1)?),
        name: row.get(2)?,
        grpid: row.get(3)?,
        blocked: Blocked::from_i32(row.get(4)?),
        archived: row.get(5)?,
        unpromoted: row.get(6)?,
        verified: row.get(7)?,
        locations_send_begin: row.get(8)?,
        locations_send_until: row.get(9)?,
    })
}

const CHAT_FIELDS: &str = "id, type, name, grpid, blocked, archived, unpromoted, verified, \
     locations_send_begin, locations_send_until";

pub fn get(sql: &Sql, chat_id: u32) -> Result<Option<Chat>> {
    sql.query_row_optional(
        &format!("SELECT {} FROM chats WHERE id=?", CHAT_FIELDS),
        [chat_id],
        row_to_chat,
    )
}

/// Create a single chat with one member besides self.
pub fn create_single(sql: &Sql, contact_id: u32, blocked: Blocked) -> Result<u32> {
    sql.transaction(|tx| {
        tx.execute(
            "INSERT INTO chats (type, name, blocked, created_at) VALUES (?, '', ?, ?)",
            params![Chattype::Single as i32, blocked as i32, time()],
        )?;
        let chat_id = tx.last_insert_rowid() as u32;
        tx.execute(
            "INSERT INTO chats_contacts (chat_id, contact_id) VALUES (?, ?)",
            params![chat_id, contact_id],
        )?;
        Ok(chat_id)
    })
}

pub fn create_group(
    sql: &Sql,
    name: &str,
    grpid: &str,
    verified: bool,
    unpromoted: bool,
) -> Result<u32> {
    let chattype = if verified {
        Chattype::VerifiedGroup
    } else {
        Chattype::Group
    };
    sql.transaction(|tx| {
        tx.execute(
            "INSERT INTO chats (type, name, grpid, verified, unpromoted, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![chattype as i32, name, grpid, verified, unpromoted, time()],
        )?;
        let chat_id = tx.last_insert_rowid() as u32;
        tx.execute(
            "INSERT INTO chats_contacts (chat_id, contact_id) VALUES (?, ?)",
            params![chat_id, crate::contact::CONTACT_ID_SELF],
        )?;
        Ok(chat_id)
    })
}

/// The single chat whose only non-self member is `contact_id`,
/// regardless of blocked state.
pub fn lookup_single_by_contact(sql: &Sql, contact_id: u32) -> Result<Option<u32>> {
    sql.query_row_optional(
        "SELECT c.id FROM chats c
         JOIN chats_contacts cc ON cc.chat_id=c.id
         WHERE c.type=? AND cc.contact_id=?",
        params![Chattype::Single as i32, contact_id],
        |row| row.get(0),
    )
}

pub fn lookup_group_by_grpid(sql: &Sql, grpid: &str) -> Result<Option<u32>> {
    sql.query_row_optional("SELECT id FROM chats WHERE grpid=?", [grpid], |row| {
        row.get(0)
    })
}

pub fn set_blocked(sql: &Sql, chat_id: u32, blocked: Blocked) -> Result<()> {
    sql.execute(
        "UPDATE chats SET blocked=? WHERE id=?",
        params![blocked as i32, chat_id],
    )?;
    Ok(())
}

pub fn set_archived(sql: &Sql, chat_id: u32, archived: bool) -> Result<()> {
    sql.execute(
        "UPDATE chats SET archived=? WHERE id=?",
        params![archived, chat_id],
    )?;
    Ok(())
}

pub fn set_name(sql: &Sql, chat_id: u32, name: &str) -> Result<()> {
    sql.execute("UPDATE chats SET name=? WHERE id=?", params![name, chat_id])?;
    Ok(())
}

pub fn set_promoted(sql: &Sql, chat_id: u32) -> Result<()> {
    sql.execute("UPDATE chats SET unpromoted=0 WHERE id=?", [chat_id])?;
    Ok(())
}

pub fn set_locations_window(sql: &Sql, chat_id: u32, begin: i64, until: i64) -> Result<()> {
    sql.execute(
        "UPDATE chats SET locations_send_begin=?, locations_send_until=? WHERE id=?",
        params![begin, until, chat_id],
    )?;
    Ok(())
}

pub fn add_member(sql: &Sql, chat_id: u32, contact_id: u32) -> Result<bool> {
    let n = sql.execute(
        "INSERT OR IGNORE INTO chats_contacts (chat_id, contact_id) VALUES (?, ?)",
        params![chat_id, contact_id],
    )?;
    Ok(n > 0)
}

pub fn remove_member(sql: &Sql, chat_id: u32, contact_id: u32) -> Result<bool> {
    let n = sql.execute(
        "DELETE FROM chats_contacts WHERE chat_id=? AND contact_id=?",
        params![chat_id, contact_id],
    )?;
    Ok(n > 0)
}

pub fn is_member(sql: &Sql, chat_id: u32, contact_id: u32) -> Result<bool> {
    sql.exists(
        "SELECT 1 FROM chats_contacts WHERE chat_id=? AND contact_id=?",
        params![chat_id, contact_id],
    )
}

pub fn get_members(sql: &Sql, chat_id: u32) -> Result<Vec<u32>> {
    sql.query_map(
        "SELECT contact_id FROM chats_contacts WHERE chat_id=? ORDER BY contact_id",
        [chat_id],
        |row| row.get(0),
    )
}

pub fn delete_chat(sql: &Sql, chat_id: u32) -> Result<()> {
    sql.transaction(|tx| {
        tx.execute("DELETE FROM msgs WHERE chat_id=?", [chat_id])?;
        tx.execute("DELETE FROM chats_contacts WHERE chat_id=?", [chat_id])?;
        tx.execute("DELETE FROM chats WHERE id=?", [chat_id])?;
        Ok(())
    })
}

/// One chatlist entry: chat id, the message that positions it, and the
/// sort key used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatlistEntry {
    pub chat_id: u32,
    pub msg_id: Option<u32>,
    pub sort_timestamp: i64,
}

/// Default listing: unblocked real chats, newest activity first, ties
/// broken by chat id. Drafts participate with their own timestamp.
pub fn get_chatlist(sql: &Sql, archived: bool) -> Result<Vec<ChatlistEntry>> {
    sql.query_map(
        "SELECT c.id,
                (SELECT m.id FROM msgs m
                  WHERE m.chat_id=c.id AND (m.hidden=0 OR m.state=?1)
                  ORDER BY m.timestamp_sort DESC, m.id DESC LIMIT 1),
                COALESCE((SELECT MAX(m.timestamp_sort) FROM msgs m
                  WHERE m.chat_id=c.id AND (m.hidden=0 OR m.state=?1)), c.created_at)
         FROM chats c
         WHERE c.id>?2 AND c.blocked=0 AND c.archived=?3
         ORDER BY 3 DESC, c.id DESC",
        params![MessageState::OutDraft as i32, CHAT_ID_LAST_SPECIAL, archived],
        |row| {
            Ok(ChatlistEntry {
                chat_id: row.get(0)?,
                msg_id: row.get(1)?,
                sort_timestamp: row.get(2)?,
            })
        },
    )
}

pub fn archived_count(sql: &Sql) -> Result<u32> {
    sql.count(
        "SELECT COUNT(*) FROM chats WHERE id>? AND blocked=0 AND archived=1",
        [CHAT_ID_LAST_SPECIAL],
    )
}

/// Ids of deaddrop-blocked chats.
pub fn deaddrop_chat_ids(sql: &Sql) -> Result<Vec<u32>> {
    sql.query_map(
        "SELECT id FROM chats WHERE id>? AND blocked=?",
        params![CHAT_ID_LAST_SPECIAL, Blocked::Deaddrop as i32],
        |row| row.get(0),
    )
}

/// Newest message across all deaddrop chats, if any.
pub fn newest_deaddrop_msg(sql: &Sql) -> Result<Option<(u32, i64)>> {
    sql.query_row_optional(
        "SELECT m.id, m.timestamp_sort FROM msgs m
         JOIN chats c ON c.id=m.chat_id
         WHERE c.blocked=? AND m.hidden=0
         ORDER BY m.timestamp_sort DESC, m.id DESC LIMIT 1",
        [Blocked::Deaddrop as i32],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

pub fn get_draft_msg_id(sql: &Sql, chat_id: u32) -> Result<Option<u32>> {
    sql.query_row_optional(
        "SELECT id FROM msgs WHERE chat_id=? AND state=?",
        params![chat_id, MessageState::OutDraft as i32],
        |row| row.get(0),
    )
}

/// Chats with an armed location-streaming window.
pub fn streaming_chat_ids(sql: &Sql, now: i64) -> Result<Vec<u32>> {
    sql.query_map(
        "SELECT id FROM chats WHERE locations_send_until>?",
        [now],
        |row| row.get(0),
    )
}
