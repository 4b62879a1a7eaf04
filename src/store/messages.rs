use rusqlite::params;

use crate::error::Result;
use crate::message::{Message, MessageState, MsgParams, Viewtype};

use super::Sql;

/// Fields for a fresh row; everything else is derived or defaulted.
#[derive(Debug, Clone, Default)]
pub struct NewMsg {
    pub rfc724_mid: String,
    pub chat_id: u32,
    pub from_id: u32,
    pub timestamp_sort: i64,
    pub timestamp_sent: i64,
    pub timestamp_rcvd: i64,
    pub viewtype: Viewtype,
    pub state: MessageState,
    pub text: Option<String>,
    pub param: MsgParams,
    pub hidden: bool,
    pub is_info: bool,
    pub server_folder: String,
    pub server_uid: u32,
    pub wants_mdn: bool,
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let param_json: String = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        rfc724_mid: row.get(1)?,
        chat_id: row.get(2)?,
        from_id: row.get(3)?,
        timestamp_sort: row.get(4)?,
        timestamp_sent: row.get(5)?,
        timestamp_rcvd: row.get(6)?,
        viewtype: Viewtype::from_i32(row.get(7)?),
        state: MessageState::from_i32(row.get(8)?),
        text: row.get(9)?,
        param: serde_json::from_str(&param_json).unwrap_or_default(),
        starred: row.get(11)?,
        forwarded: row.get(12)?,
        is_info: row.get(13)?,
        hidden: row.get(14)?,
        location_id: row.get(15)?,
        server_folder: row.get(16)?,
        server_uid: row.get(17)?,
        wants_mdn: row.get(18)?,
    })
}

const MSG_FIELDS: &str = "id, rfc724_mid, chat_id, from_id, timestamp_sort, timestamp_sent, \
     timestamp_rcvd, type, state, txt, param, starred, forwarded, is_info, hidden, \
     location_id, server_folder, server_uid, wants_mdn";

pub fn insert(sql: &Sql, msg: &NewMsg) -> Result<u32> {
    let param = serde_json::to_string(&msg.param)?;
    sql.transaction(|tx| {
        tx.execute(
            "INSERT INTO msgs (rfc724_mid, chat_id, from_id, timestamp_sort, timestamp_sent, \
             timestamp_rcvd, type, state, txt, param, hidden, is_info, server_folder, \
             server_uid, wants_mdn) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                msg.rfc724_mid,
                msg.chat_id,
                msg.from_id,
                msg.timestamp_sort,
                msg.timestamp_sent,
                msg.timestamp_rcvd,
                msg.viewtype as i32,
                msg.state as i32,
                msg.text,
                param,
                msg.hidden,
                msg.is_info,
                msg.server_folder,
                msg.server_uid,
                msg.wants_mdn,
            ],
        )?;
        Ok(tx.last_insert_rowid() as u32)
    })
}

pub fn get(sql: &Sql, msg_id: u32) -> Result<Option<Message>> {
    sql.query_row_optional(
        &format!("SELECT {} FROM msgs WHERE id=?", MSG_FIELDS),
        [msg_id],
        row_to_msg,
    )
}

pub fn set_state(sql: &Sql, msg_id: u32, state: MessageState) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET state=? WHERE id=?",
        params![state as i32, msg_id],
    )?;
    Ok(())
}

pub fn set_param(sql: &Sql, msg_id: u32, param: &MsgParams) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET param=? WHERE id=?",
        params![serde_json::to_string(param)?, msg_id],
    )?;
    Ok(())
}

pub fn set_starred(sql: &Sql, msg_id: u32, starred: bool) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET starred=? WHERE id=?",
        params![starred, msg_id],
    )?;
    Ok(())
}

pub fn set_location_id(sql: &Sql, msg_id: u32, location_id: u32) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET location_id=? WHERE id=?",
        params![location_id, msg_id],
    )?;
    Ok(())
}

pub fn set_server_ref(sql: &Sql, msg_id: u32, folder: &str, uid: u32) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET server_folder=?, server_uid=? WHERE id=?",
        params![folder, uid, msg_id],
    )?;
    Ok(())
}

pub fn move_to_chat(sql: &Sql, msg_id: u32, chat_id: u32) -> Result<()> {
    sql.execute(
        "UPDATE msgs SET chat_id=? WHERE id=?",
        params![chat_id, msg_id],
    )?;
    Ok(())
}

pub fn delete(sql: &Sql, msg_id: u32) -> Result<()> {
    sql.execute("DELETE FROM msgs WHERE id=?", [msg_id])?;
    Ok(())
}

pub fn lookup_by_rfc724_mid(sql: &Sql, rfc724_mid: &str) -> Result<Option<u32>> {
    sql.query_row_optional(
        "SELECT id FROM msgs WHERE rfc724_mid=? ORDER BY id DESC",
        [rfc724_mid],
        |row| row.get(0),
    )
}

/// Newest sort timestamp in a chat; used to keep arrival order
/// monotonic under clock skew.
pub fn newest_sort_timestamp(sql: &Sql, chat_id: u32) -> Result<i64> {
    Ok(sql
        .query_row_optional(
            "SELECT MAX(timestamp_sort) FROM msgs WHERE chat_id=? AND hidden=0",
            [chat_id],
            |row| row.get::<_, Option<i64>>(0),
        )?
        .flatten()
        .unwrap_or(0))
}

pub fn get_chat_msgs(sql: &Sql, chat_id: u32) -> Result<Vec<u32>> {
    sql.query_map(
        "SELECT id FROM msgs WHERE chat_id=? AND hidden=0 ORDER BY timestamp_sort, id",
        [chat_id],
        |row| row.get(0),
    )
}

pub fn get_fresh_msg_cnt(sql: &Sql, chat_id: u32) -> Result<u32> {
    sql.count(
        "SELECT COUNT(*) FROM msgs WHERE chat_id=? AND state=? AND hidden=0",
        params![chat_id, MessageState::InFresh as i32],
    )
}

/// fresh -> noticed for a whole chat; returns how many rows changed.
pub fn mark_noticed_chat(sql: &Sql, chat_id: u32) -> Result<usize> {
    sql.execute(
        "UPDATE msgs SET state=? WHERE chat_id=? AND state=?",
        params![
            MessageState::InNoticed as i32,
            chat_id,
            MessageState::InFresh as i32
        ],
    )
}

/// fresh -> noticed for all deaddropped messages of one sender.
pub fn mark_noticed_deaddrop_contact(
    sql: &Sql,
    deaddrop_chat_ids: &[u32],
    contact_id: u32,
) -> Result<usize> {
    let mut n = 0;
    for &chat_id in deaddrop_chat_ids {
        n += sql.execute(
            "UPDATE msgs SET state=? WHERE chat_id=? AND from_id=? AND state=?",
            params![
                MessageState::InNoticed as i32,
                chat_id,
                contact_id,
                MessageState::InFresh as i32
            ],
        )?;
    }
    Ok(n)
}
