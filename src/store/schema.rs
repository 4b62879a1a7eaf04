use rusqlite::Connection;

use crate::error::Result;

/// Ids 1..=9 are reserved for virtual chats, special contacts and
/// in-creation markers; real rows start at 10.
pub const LAST_SPECIAL_ID: u32 = 9;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS config (
            keyname     TEXT PRIMARY KEY,
            value       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contacts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL DEFAULT '',
            addr        TEXT NOT NULL UNIQUE,   -- normalized
            origin      INTEGER NOT NULL DEFAULT 0,
            blocked     INTEGER NOT NULL DEFAULT 0,
            verified    INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            type        INTEGER NOT NULL,       -- 100 single, 120 group, 130 verified group
            name        TEXT NOT NULL DEFAULT '',
            grpid       TEXT NOT NULL DEFAULT '',
            blocked     INTEGER NOT NULL DEFAULT 0, -- 0 ok, 1 blocked, 2 deaddrop
            archived    INTEGER NOT NULL DEFAULT 0,
            unpromoted  INTEGER NOT NULL DEFAULT 0,
            verified    INTEGER NOT NULL DEFAULT 0,
            -- location streaming window, unix seconds; until=0 disarmed
            locations_send_begin  INTEGER NOT NULL DEFAULT 0,
            locations_send_until  INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_chats_grpid ON chats(grpid);

        CREATE TABLE IF NOT EXISTS chats_contacts (
            chat_id     INTEGER NOT NULL,
            contact_id  INTEGER NOT NULL,
            PRIMARY KEY (chat_id, contact_id)
        );

        CREATE TABLE IF NOT EXISTS msgs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            rfc724_mid      TEXT NOT NULL DEFAULT '',
            chat_id         INTEGER NOT NULL,
            from_id         INTEGER NOT NULL,
            timestamp_sort  INTEGER NOT NULL DEFAULT 0,
            timestamp_sent  INTEGER NOT NULL DEFAULT 0,
            timestamp_rcvd  INTEGER NOT NULL DEFAULT 0,
            type            INTEGER NOT NULL DEFAULT 10, -- viewtype
            state           INTEGER NOT NULL DEFAULT 0,
            txt             TEXT,
            param           TEXT NOT NULL DEFAULT '{}',  -- JSON: file, dimensions, headers
            starred         INTEGER NOT NULL DEFAULT 0,
            forwarded       INTEGER NOT NULL DEFAULT 0,
            is_info         INTEGER NOT NULL DEFAULT 0,
            hidden          INTEGER NOT NULL DEFAULT 0,
            location_id     INTEGER NOT NULL DEFAULT 0,
            server_folder   TEXT NOT NULL DEFAULT '',
            server_uid      INTEGER NOT NULL DEFAULT 0,
            wants_mdn       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_msgs_chat ON msgs(chat_id, timestamp_sort);
        CREATE INDEX IF NOT EXISTS idx_msgs_mid  ON msgs(rfc724_mid);
        CREATE INDEX IF NOT EXISTS idx_msgs_state ON msgs(state);

        CREATE TABLE IF NOT EXISTS jobs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            added_timestamp     INTEGER NOT NULL,
            lane                INTEGER NOT NULL,   -- 100 inbox, 5000 smtp
            action              INTEGER NOT NULL,
            foreign_id          INTEGER NOT NULL DEFAULT 0,
            param               TEXT NOT NULL DEFAULT '{}',
            desired_timestamp   INTEGER NOT NULL DEFAULT 0,
            tries               INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_lane ON jobs(lane, desired_timestamp);

        CREATE TABLE IF NOT EXISTS locations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            latitude    REAL NOT NULL DEFAULT 0.0,
            longitude   REAL NOT NULL DEFAULT 0.0,
            accuracy    REAL NOT NULL DEFAULT 0.0,
            timestamp   INTEGER NOT NULL DEFAULT 0,
            chat_id     INTEGER NOT NULL DEFAULT 0,
            from_id     INTEGER NOT NULL DEFAULT 0,
            independent INTEGER NOT NULL DEFAULT 0,
            sent        INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_locations_chat ON locations(chat_id, timestamp);

        CREATE TABLE IF NOT EXISTS tokens (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            namespc     INTEGER NOT NULL DEFAULT 0,
            foreign_chat_id INTEGER NOT NULL DEFAULT 0,
            token       TEXT NOT NULL DEFAULT '',
            timestamp   INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;

    seed_reserved_ids(conn)?;

    Ok(())
}

/// Push AUTOINCREMENT past the reserved range and make sure the two
/// special contact rows exist.
fn seed_reserved_ids(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO contacts (id, name, addr) VALUES (1, 'self', '$SELF')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO contacts (id, name, addr) VALUES (2, 'device', '$DEVICE')",
        [],
    )?;
    for table in ["contacts", "chats", "msgs"] {
        let seeded: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_sequence WHERE name=? AND seq>=?)",
            rusqlite::params![table, LAST_SPECIAL_ID],
            |row| row.get(0),
        )?;
        if !seeded {
            // sqlite_sequence has no unique constraint on `name`, so
            // INSERT OR REPLACE would add a duplicate row that
            // AUTOINCREMENT ignores; update in place instead.
            let updated = conn.execute(
                "UPDATE sqlite_sequence SET seq=? WHERE name=?",
                rusqlite::params![LAST_SPECIAL_ID, table],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)",
                    rusqlite::params![table, LAST_SPECIAL_ID],
                )?;
            }
        }
    }
    Ok(())
}
