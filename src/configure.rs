//! Login configuration.
//!
//! `configure` validates the stored credentials against both transports
//! and flips the `configured` flag. It runs as a job on the inbox lane
//! under the single ongoing-process token and reports progress in
//! permille over the event channel (0 means failed).

use std::sync::atomic::Ordering;

use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::job::{self, Action, Status};

/// Start configuration; the inbox worker picks it up.
pub fn configure(ctx: &Context) -> Result<()> {
    if ctx.get_config(Config::Addr)?.is_none() {
        return Err(Error::Config("no address configured".into()));
    }
    job::add(ctx, Action::ConfigureImap, 0, json!({}), 0)?;
    Ok(())
}

pub(crate) fn job_configure(ctx: &Context) -> Status {
    let cancel = match ctx.alloc_ongoing() {
        Ok(flag) => flag,
        Err(e) => return Status::RetryLater(e.to_string()),
    };
    let result = run_configure(ctx, &cancel);
    ctx.free_ongoing();
    match result {
        Ok(()) => Status::Finished,
        Err(Error::Cancelled) => {
            info!("configure cancelled");
            ctx.emit(Event::ConfigureProgress { progress: 0 });
            Status::Finished
        }
        Err(e) => {
            warn!("configure failed: {}", e);
            ctx.emit(Event::Error(e.to_string()));
            ctx.emit(Event::ConfigureProgress { progress: 0 });
            Status::Finished
        }
    }
}

fn run_configure(ctx: &Context, cancel: &crate::context::CancelFlag) -> Result<()> {
    let check = |progress: u32| -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        ctx.emit(Event::ConfigureProgress { progress });
        Ok(())
    };

    check(10)?;
    let addr = ctx.self_addr()?;
    info!("configuring account {}", addr);

    check(300)?;
    ctx.imap
        .connect()
        .map_err(|e| Error::Auth(format!("IMAP login failed: {}", e)))?;
    ctx.emit(Event::ImapConnected(addr.clone()));

    check(600)?;
    ctx.smtp
        .connect()
        .map_err(|e| Error::Auth(format!("SMTP login failed: {}", e)))?;
    ctx.emit(Event::SmtpConnected(addr));

    check(900)?;
    ctx.set_config(Config::Configured, Some("1"))?;
    ctx.emit(Event::ConfigureProgress { progress: 1000 });
    info!("configure succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;
    use crate::worker::Lane;

    fn progress_events(events: &[Event]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::ConfigureProgress { progress } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_configure_success() {
        let t = TestContext::unconfigured();
        t.ctx.set_config(Config::Addr, Some("alice@example.org")).unwrap();
        assert!(!t.ctx.is_configured().unwrap());

        configure(&t.ctx).unwrap();
        t.ctx.perform_jobs(Lane::Inbox);

        assert!(t.ctx.is_configured().unwrap());
        let progress = progress_events(&t.drain_events());
        assert_eq!(*progress.last().unwrap(), 1000);
        for pair in progress.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_configure_requires_addr() {
        let t = TestContext::unconfigured();
        assert!(configure(&t.ctx).is_err());
    }

    #[test]
    fn test_failed_login_reports_zero() {
        let t = TestContext::unconfigured();
        t.ctx.set_config(Config::Addr, Some("alice@example.org")).unwrap();
        t.imap.fail_connect("invalid credentials");

        configure(&t.ctx).unwrap();
        t.ctx.perform_jobs(Lane::Inbox);

        assert!(!t.ctx.is_configured().unwrap());
        let progress = progress_events(&t.drain_events());
        assert_eq!(*progress.last().unwrap(), 0);
    }
}
