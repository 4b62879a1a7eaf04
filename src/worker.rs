//! Worker-lane contract.
//!
//! The embedder runs one thread per lane, each looping
//! `perform_jobs -> fetch -> idle`. The core never spawns threads; it
//! only blocks the calling thread in `idle` until there is work. An
//! `interrupt` delivered while the lane is busy is remembered and makes
//! the next `idle` return immediately.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::job;
use crate::receive;
use crate::store::jobs;
use crate::tools::time;

pub const INBOX_FOLDER: &str = "INBOX";
pub const SENTBOX_FOLDER: &str = "Sent";
/// Folder chat messages are moved to when `mvbox_move` is on.
pub const MVBOX_FOLDER: &str = "MailChat";

/// Upper bound for one idle period; the loop re-checks watch flags and
/// pending jobs at least this often.
const IDLE_TIMEOUT: Duration = Duration::from_secs(23 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Lane {
    Inbox = 0,
    Mvbox = 1,
    Sentbox = 2,
    Smtp = 3,
}

impl Lane {
    /// Stored lane discriminator of the job rows this lane executes.
    pub(crate) fn lane_id(self) -> i32 {
        match self {
            Lane::Smtp => 5000,
            _ => 100,
        }
    }

    /// Only the inbox and SMTP lanes own job queues.
    fn runs_jobs(self) -> bool {
        matches!(self, Lane::Inbox | Lane::Smtp)
    }

    fn folder(self) -> Option<&'static str> {
        match self {
            Lane::Inbox => Some(INBOX_FOLDER),
            Lane::Mvbox => Some(MVBOX_FOLDER),
            Lane::Sentbox => Some(SENTBOX_FOLDER),
            Lane::Smtp => None,
        }
    }

    fn watch_key(self) -> Option<Config> {
        match self {
            Lane::Inbox => Some(Config::InboxWatch),
            Lane::Mvbox => Some(Config::MvboxWatch),
            Lane::Sentbox => Some(Config::SentboxWatch),
            Lane::Smtp => None,
        }
    }
}

impl Context {
    /// Execute all due jobs of the lane. No-op for the mvbox and
    /// sentbox lanes, which carry no queue.
    pub fn perform_jobs(&self, lane: Lane) {
        let probe = self.lane(lane).take_probe_network();
        if !lane.runs_jobs() {
            return;
        }
        if let Err(e) = job::perform(self, lane, probe) {
            warn!("perform_jobs({:?}): {}", lane, e);
            self.emit(crate::events::Event::Error(e.to_string()));
        }
    }

    /// Pull new messages from the lane's folder and project them into
    /// the store. No-op for the SMTP lane and for unwatched folders.
    pub fn fetch(&self, lane: Lane) {
        let Some(folder) = lane.folder() else {
            return;
        };
        match lane.watch_key().map(|k| self.get_config_bool(k)) {
            Some(Ok(true)) => {}
            Some(Ok(false)) => return,
            Some(Err(e)) => {
                warn!("fetch({:?}): cannot read watch flag: {}", lane, e);
                return;
            }
            None => return,
        }
        if !self.is_configured().unwrap_or(false) {
            return;
        }
        match self.imap.fetch_new(folder) {
            Ok(msgs) => {
                self.note_network_ok();
                if !msgs.is_empty() {
                    info!("fetched {} messages from {}", msgs.len(), folder);
                }
                for msg in &msgs {
                    if let Err(e) = receive::receive_inbound(self, msg) {
                        warn!("cannot store message {:?}: {}", msg.rfc724_mid, e);
                    }
                }
            }
            Err(e) => {
                self.emit(crate::events::Event::ErrorNetwork {
                    first: self.note_network_error(),
                    msg: e.to_string(),
                });
            }
        }
    }

    /// Block until the lane is interrupted or its earliest delayed job
    /// comes due (bounded by an internal timeout). Returns immediately
    /// if an interrupt arrived since the last idle.
    pub fn idle(&self, lane: Lane) {
        let mut timeout = IDLE_TIMEOUT;
        if lane.runs_jobs() {
            if let Ok(Some(desired)) = jobs::earliest_desired(&self.sql, lane.lane_id()) {
                let until_due = (desired - time()).max(0) as u64;
                timeout = timeout.min(Duration::from_secs(until_due));
            }
        }
        self.lane(lane).wait(timeout);
    }

    /// Wake the lane out of `idle`. Callable from any thread, including
    /// a transport's push/IDLE callback.
    pub fn interrupt(&self, lane: Lane) {
        self.lane(lane).interrupt(false);
    }

    /// Connectivity may be back: schedule a probe pass on all lanes.
    pub fn maybe_network(&self) {
        job::maybe_network(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;
    use std::time::Instant;

    #[test]
    fn test_interrupt_unblocks_concurrent_idle() {
        let t = TestContext::new();
        let started = Instant::now();
        std::thread::scope(|s| {
            let ctx = &t.ctx;
            let handle = s.spawn(move || {
                ctx.idle(Lane::Inbox);
                started.elapsed()
            });
            // give the idling thread time to actually block
            std::thread::sleep(Duration::from_millis(50));
            ctx.interrupt(Lane::Inbox);
            let blocked_for = handle.join().unwrap();
            assert!(blocked_for < Duration::from_secs(5));
        });
    }

    #[test]
    fn test_interrupt_before_idle_is_remembered() {
        let t = TestContext::new();
        t.ctx.interrupt(Lane::Smtp);
        let started = Instant::now();
        t.ctx.idle(Lane::Smtp);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fetch_respects_watch_flag() {
        let t = TestContext::new();
        t.queue_inbound("bob@example.org", "hi");
        t.ctx.set_config(Config::InboxWatch, Some("0")).unwrap();
        t.ctx.fetch(Lane::Inbox);
        assert!(t.drain_events().is_empty());

        t.ctx.set_config(Config::InboxWatch, Some("1")).unwrap();
        t.ctx.fetch(Lane::Inbox);
        assert!(t
            .drain_events()
            .iter()
            .any(|e| matches!(e, crate::events::Event::IncomingMsg { .. })));
    }

    #[test]
    fn test_mvbox_lane_runs_no_jobs() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        crate::chat::send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();

        t.ctx.perform_jobs(Lane::Mvbox);
        t.ctx.perform_jobs(Lane::Sentbox);
        // the queued send job is untouched
        assert_eq!(crate::store::jobs::count(&t.ctx.sql).unwrap(), 1);
    }
}
