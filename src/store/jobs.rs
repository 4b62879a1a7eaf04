use rusqlite::params;

use crate::error::Result;
use crate::job::{Action, Job};

use super::Sql;

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Job>> {
    let action: i32 = row.get(2)?;
    let param_json: String = row.get(4)?;
    let Some(action) = Action::from_i32(action) else {
        return Ok(None);
    };
    Ok(Some(Job {
        id: row.get(0)?,
        added_timestamp: row.get(1)?,
        action,
        foreign_id: row.get(3)?,
        param: serde_json::from_str(&param_json).unwrap_or_default(),
        desired_timestamp: row.get(5)?,
        tries: row.get(6)?,
    }))
}

const JOB_FIELDS: &str =
    "id, added_timestamp, action, foreign_id, param, desired_timestamp, tries";

pub fn insert(sql: &Sql, job: &Job) -> Result<u32> {
    sql.transaction(|tx| {
        tx.execute(
            "INSERT INTO jobs (added_timestamp, lane, action, foreign_id, param, \
             desired_timestamp, tries) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                job.added_timestamp,
                job.action.lane_id(),
                job.action as i32,
                job.foreign_id,
                serde_json::to_string(&job.param)?,
                job.desired_timestamp,
                job.tries,
            ],
        )?;
        Ok(tx.last_insert_rowid() as u32)
    })
}

/// The oldest due job of a lane, insertion order. Rows with an action
/// value this build does not know are skipped (left for a newer build).
pub fn load_next(sql: &Sql, lane_id: i32, now: i64) -> Result<Option<Job>> {
    let jobs: Vec<Option<Job>> = sql.query_map(
        &format!(
            "SELECT {} FROM jobs WHERE lane=? AND desired_timestamp<=? \
             ORDER BY added_timestamp, id",
            JOB_FIELDS
        ),
        params![lane_id, now],
        row_to_job,
    )?;
    Ok(jobs.into_iter().flatten().next())
}

pub fn update_retry(sql: &Sql, job_id: u32, tries: u32, desired_timestamp: i64) -> Result<()> {
    sql.execute(
        "UPDATE jobs SET tries=?, desired_timestamp=? WHERE id=?",
        params![tries, desired_timestamp, job_id],
    )?;
    Ok(())
}

pub fn delete(sql: &Sql, job_id: u32) -> Result<()> {
    sql.execute("DELETE FROM jobs WHERE id=?", [job_id])?;
    Ok(())
}

/// Earliest wakeup a lane's delayed jobs ask for.
pub fn earliest_desired(sql: &Sql, lane_id: i32) -> Result<Option<i64>> {
    Ok(sql
        .query_row_optional(
            "SELECT MIN(desired_timestamp) FROM jobs WHERE lane=?",
            [lane_id],
            |row| row.get::<_, Option<i64>>(0),
        )?
        .flatten())
}

/// Make backoff-delayed jobs due now (network probe pass).
pub fn reset_delays(sql: &Sql, lane_id: i32, now: i64) -> Result<usize> {
    sql.execute(
        "UPDATE jobs SET desired_timestamp=? WHERE lane=? AND desired_timestamp>?",
        params![now, lane_id, now],
    )
}

pub fn exists_action(sql: &Sql, action: Action) -> Result<bool> {
    sql.exists("SELECT 1 FROM jobs WHERE action=?", [action as i32])
}

pub fn count(sql: &Sql) -> Result<u32> {
    sql.count("SELECT COUNT(*) FROM jobs", [])
}

pub fn get(sql: &Sql, job_id: u32) -> Result<Option<Job>> {
    Ok(sql
        .query_row_optional(
            &format!("SELECT {} FROM jobs WHERE id=?", JOB_FIELDS),
            [job_id],
            row_to_job,
        )?
        .flatten())
}
