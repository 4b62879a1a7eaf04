//! Backup export and import.
//!
//! A backup is a single self-contained database file written with
//! sqlite's online backup API. Export and import run as a job on the
//! inbox lane under the ongoing-process token, reporting `ImexProgress`
//! in permille (0 means failed).

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use rusqlite::DatabaseName;
use serde_json::json;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::job::{self, Action, Status};

const BACKUP_PREFIX: &str = "mailchat-backup-";
const BACKUP_SUFFIX: &str = ".db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImexMode {
    ExportBackup,
    ImportBackup,
}

/// Start a backup export into `dir`, or an import of the newest backup
/// found there. The inbox worker executes it.
pub fn imex(ctx: &Context, mode: ImexMode, dir: &Path) -> Result<()> {
    let param = match mode {
        ImexMode::ExportBackup => json!({ "mode": "export", "dir": dir }),
        ImexMode::ImportBackup => {
            let file = has_backup(dir)?
                .ok_or_else(|| Error::BadParameter(format!("no backup in {:?}", dir)))?;
            json!({ "mode": "import", "file": file })
        }
    };
    job::add(ctx, Action::ImexImap, 0, param, 0)?;
    Ok(())
}

/// Newest backup artifact in `dir`, if any.
pub fn has_backup(dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(BACKUP_PREFIX) || !name.ends_with(BACKUP_SUFFIX) {
            continue;
        }
        // names sort chronologically
        if newest.as_deref().map(|n| path.as_path() > n).unwrap_or(true) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

pub(crate) fn job_imex(ctx: &Context, job: &job::Job) -> Status {
    let cancel = match ctx.alloc_ongoing() {
        Ok(flag) => flag,
        Err(e) => return Status::RetryLater(e.to_string()),
    };
    let result = run_imex(ctx, job, &cancel);
    ctx.free_ongoing();
    match result {
        Ok(()) => Status::Finished,
        Err(Error::Cancelled) => {
            info!("imex cancelled");
            ctx.emit(Event::ImexProgress { progress: 0 });
            Status::Finished
        }
        Err(e) => {
            warn!("imex failed: {}", e);
            ctx.emit(Event::Error(e.to_string()));
            ctx.emit(Event::ImexProgress { progress: 0 });
            Status::Finished
        }
    }
}

fn run_imex(ctx: &Context, job: &job::Job, cancel: &crate::context::CancelFlag) -> Result<()> {
    let check = |progress: u32| -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        ctx.emit(Event::ImexProgress { progress });
        Ok(())
    };
    check(10)?;
    match job.param["mode"].as_str() {
        Some("export") => {
            let dir = PathBuf::from(job.param["dir"].as_str().unwrap_or_default());
            export_backup(ctx, &dir, &check)
        }
        Some("import") => {
            let file = PathBuf::from(job.param["file"].as_str().unwrap_or_default());
            import_backup(ctx, &file, &check)
        }
        _ => Err(Error::BadParameter("malformed imex job".into())),
    }
}

fn export_backup(ctx: &Context, dir: &Path, check: &dyn Fn(u32) -> Result<()>) -> Result<()> {
    let date = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let dest = dir.join(format!("{}{}{}", BACKUP_PREFIX, date, BACKUP_SUFFIX));
    check(300)?;

    let conn = ctx.sql.conn()?;
    conn.backup(DatabaseName::Main, &dest, None)?;
    drop(conn);

    check(900)?;
    ctx.emit(Event::ImexFileWritten {
        path: dest.display().to_string(),
    });
    ctx.emit(Event::ImexProgress { progress: 1000 });
    info!("backup written to {:?}", dest);
    Ok(())
}

fn import_backup(ctx: &Context, file: &Path, check: &dyn Fn(u32) -> Result<()>) -> Result<()> {
    check(300)?;
    let mut conn = ctx.sql.conn()?;
    conn.restore(DatabaseName::Main, file, None::<fn(rusqlite::backup::Progress)>)?;
    drop(conn);

    check(900)?;
    ctx.emit(Event::ImexProgress { progress: 1000 });
    info!("backup restored from {:?}", file);
    Ok(())
}
