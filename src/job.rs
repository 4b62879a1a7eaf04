//! Persistent job queue.
//!
//! Network side effects never happen inline; API calls enqueue a job
//! and interrupt the owning lane, the lane's worker thread executes it.
//! Jobs survive restarts, are drained in insertion order, and transient
//! failures are retried with a deterministic exponential backoff until
//! a tunable ceiling.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::blob;
use crate::chat;
use crate::config::Config;
use crate::context::{Context, JobConfig};
use crate::error::Result;
use crate::events::Event;
use crate::message::{self, MessageState};
use crate::store::jobs;
use crate::tools::time;
use crate::transport::{ImapActionResult, OutboundMessage, TransportError};
use crate::worker::{Lane, MVBOX_FOLDER};

/// Job kinds. Discriminants are stored in the database; the value range
/// encodes the owning lane (below 1000: inbox/IMAP, above: SMTP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Action {
    Housekeeping = 105,
    DeleteMsgOnServer = 110,
    MarkseenMsgOnServer = 130,
    MarkseenMdnOnServer = 140,
    MoveMsg = 200,
    ConfigureImap = 900,
    ImexImap = 910,

    MaybeSendLocations = 5005,
    MaybeSendLocationsEnded = 5007,
    SendMdn = 5011,
    SendMsgToSmtp = 5901,
}

impl Action {
    pub fn from_i32(v: i32) -> Option<Action> {
        Some(match v {
            105 => Action::Housekeeping,
            110 => Action::DeleteMsgOnServer,
            130 => Action::MarkseenMsgOnServer,
            140 => Action::MarkseenMdnOnServer,
            200 => Action::MoveMsg,
            900 => Action::ConfigureImap,
            910 => Action::ImexImap,
            5005 => Action::MaybeSendLocations,
            5007 => Action::MaybeSendLocationsEnded,
            5011 => Action::SendMdn,
            5901 => Action::SendMsgToSmtp,
            _ => return None,
        })
    }

    /// The lane whose worker thread executes this action.
    pub fn lane(self) -> Lane {
        if (self as i32) < 1000 {
            Lane::Inbox
        } else {
            Lane::Smtp
        }
    }

    pub(crate) fn lane_id(self) -> i32 {
        self.lane().lane_id()
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u32,
    pub added_timestamp: i64,
    pub action: Action,
    pub foreign_id: u32,
    pub param: serde_json::Value,
    pub desired_timestamp: i64,
    pub tries: u32,
}

/// Outcome of one job execution.
#[derive(Debug, Clone)]
pub enum Status {
    Finished,
    /// Transient failure; retry with backoff.
    RetryLater(String),
    /// Permanent failure; drop the job.
    Failed(String),
}

/// Insert a job and wake the owning lane.
pub fn add(
    ctx: &Context,
    action: Action,
    foreign_id: u32,
    param: serde_json::Value,
    delay_secs: i64,
) -> Result<u32> {
    let now = time();
    let job_id = jobs::insert(
        &ctx.sql,
        &Job {
            id: 0,
            added_timestamp: now,
            action,
            foreign_id,
            param,
            desired_timestamp: now + delay_secs,
            tries: 0,
        },
    )?;
    if delay_secs == 0 {
        ctx.interrupt(action.lane());
    }
    Ok(job_id)
}

pub(crate) fn send_msg_job(ctx: &Context, msg_id: u32, recipients: Vec<String>) -> Result<u32> {
    add(
        ctx,
        Action::SendMsgToSmtp,
        msg_id,
        json!({ "recipients": recipients }),
        0,
    )
}

/// Retry delay after `tries` failed attempts: deterministic, strictly
/// increasing until the cap.
pub(crate) fn backoff_delay(cfg: &JobConfig, tries: u32) -> i64 {
    let shift = tries.saturating_sub(1).min(30);
    std::cmp::min(cfg.backoff_base << shift, cfg.backoff_cap)
}

/// Drain all due jobs of a lane, oldest first.
pub(crate) fn perform(ctx: &Context, lane: Lane, probe_network: bool) -> Result<()> {
    if probe_network {
        let n = jobs::reset_delays(&ctx.sql, lane.lane_id(), time())?;
        if n > 0 {
            info!("network probe: {} delayed jobs made due on {:?}", n, lane);
        }
    }
    while let Some(mut job) = jobs::load_next(&ctx.sql, lane.lane_id(), time())? {
        job.tries += 1;
        match execute(ctx, &job) {
            Status::Finished => {
                jobs::delete(&ctx.sql, job.id)?;
            }
            Status::RetryLater(reason) => {
                if job.tries >= ctx.job_cfg.max_tries {
                    warn!(
                        "job {} ({:?}) exhausted {} tries: {}",
                        job.id, job.action, job.tries, reason
                    );
                    fail_permanently(ctx, &job, &reason)?;
                } else {
                    let delay = backoff_delay(&ctx.job_cfg, job.tries);
                    jobs::update_retry(&ctx.sql, job.id, job.tries, time() + delay)?;
                    info!(
                        "job {} ({:?}) failed transiently (try {}), next attempt in {}s: {}",
                        job.id, job.action, job.tries, delay, reason
                    );
                }
            }
            Status::Failed(reason) => {
                warn!("job {} ({:?}) failed permanently: {}", job.id, job.action, reason);
                fail_permanently(ctx, &job, &reason)?;
            }
        }
    }
    Ok(())
}

fn fail_permanently(ctx: &Context, job: &Job, reason: &str) -> Result<()> {
    jobs::delete(&ctx.sql, job.id)?;
    if job.action == Action::SendMsgToSmtp {
        message::set_msg_failed(ctx, job.foreign_id, Some(reason))?;
    }
    Ok(())
}

fn execute(ctx: &Context, job: &Job) -> Status {
    match job.action {
        Action::Housekeeping => by_result(ctx.sql.housekeeping()),
        Action::DeleteMsgOnServer => delete_msg_on_server(ctx, job),
        Action::MarkseenMsgOnServer => markseen_msg_on_server(ctx, job),
        Action::MarkseenMdnOnServer => markseen_mdn_on_server(ctx, job),
        Action::MoveMsg => move_msg(ctx, job),
        Action::ConfigureImap => crate::configure::job_configure(ctx),
        Action::ImexImap => crate::imex::job_imex(ctx, job),
        Action::MaybeSendLocations => crate::location::job_maybe_send_locations(ctx),
        Action::MaybeSendLocationsEnded => {
            crate::location::job_maybe_send_locations_ended(ctx, job.foreign_id)
        }
        Action::SendMdn => send_mdn(ctx, job),
        Action::SendMsgToSmtp => send_msg_to_smtp(ctx, job),
    }
}

fn by_result(res: Result<()>) -> Status {
    match res {
        Ok(()) => Status::Finished,
        Err(e) => Status::Failed(e.to_string()),
    }
}

fn by_imap_action(res: ImapActionResult, what: &str) -> Status {
    match res {
        ImapActionResult::Success | ImapActionResult::AlreadyGone => Status::Finished,
        ImapActionResult::RetryLater => Status::RetryLater(format!("{} deferred", what)),
        ImapActionResult::Failed => Status::Failed(format!("{} rejected", what)),
    }
}

fn delete_msg_on_server(ctx: &Context, job: &Job) -> Status {
    let Ok(Some(msg)) = crate::store::messages::get(&ctx.sql, job.foreign_id) else {
        return Status::Finished; // row already purged
    };
    match ctx.imap.delete_msg(&msg.server_folder, msg.server_uid) {
        ImapActionResult::Success | ImapActionResult::AlreadyGone => {
            // the local trash row kept the Message-ID known; now the
            // remote copy is gone it can be purged
            by_result(crate::store::messages::delete(&ctx.sql, msg.id))
        }
        ImapActionResult::RetryLater => Status::RetryLater("delete deferred".into()),
        ImapActionResult::Failed => Status::Failed("delete rejected".into()),
    }
}

fn markseen_msg_on_server(ctx: &Context, job: &Job) -> Status {
    let Ok(Some(msg)) = crate::store::messages::get(&ctx.sql, job.foreign_id) else {
        return Status::Finished;
    };
    if msg.server_folder.is_empty() {
        return Status::Finished; // never stored remotely
    }
    let status = by_imap_action(ctx.imap.set_seen(&msg.server_folder, msg.server_uid), "markseen");
    if matches!(status, Status::Finished) && msg.wants_mdn {
        let mdns_enabled = ctx.get_config_bool(Config::MdnsEnabled).unwrap_or(false);
        if mdns_enabled {
            let from = crate::contact::get_contact(ctx, msg.from_id)
                .map(|c| c.addr)
                .unwrap_or_default();
            if !from.is_empty() {
                if let Err(e) = add(
                    ctx,
                    Action::SendMdn,
                    msg.id,
                    json!({ "addr": from, "rfc724_mid": msg.rfc724_mid }),
                    0,
                ) {
                    warn!("cannot schedule MDN for message {}: {}", msg.id, e);
                }
            }
        }
    }
    status
}

fn markseen_mdn_on_server(ctx: &Context, job: &Job) -> Status {
    let Ok(Some(msg)) = crate::store::messages::get(&ctx.sql, job.foreign_id) else {
        return Status::Finished;
    };
    by_imap_action(ctx.imap.set_mdnsent(&msg.server_folder, msg.server_uid), "mdnsent")
}

fn move_msg(ctx: &Context, job: &Job) -> Status {
    let Ok(Some(msg)) = crate::store::messages::get(&ctx.sql, job.foreign_id) else {
        return Status::Finished;
    };
    if msg.server_folder == MVBOX_FOLDER {
        return Status::Finished;
    }
    match ctx.imap.mv(&msg.server_folder, msg.server_uid, MVBOX_FOLDER) {
        Ok(new_uid) => {
            by_result(crate::store::messages::set_server_ref(
                &ctx.sql,
                msg.id,
                MVBOX_FOLDER,
                new_uid,
            ))
        }
        Err(TransportError::Transient(e)) => Status::RetryLater(e),
        Err(TransportError::Permanent(e)) => Status::Failed(e),
    }
}

fn send_mdn(ctx: &Context, job: &Job) -> Status {
    let addr = job.param["addr"].as_str().unwrap_or_default().to_string();
    let rfc724_mid = job.param["rfc724_mid"].as_str().unwrap_or_default();
    if addr.is_empty() || rfc724_mid.is_empty() {
        return Status::Failed("malformed MDN job".into());
    }
    let Ok(self_addr) = ctx.self_addr() else {
        return Status::Failed("not configured".into());
    };
    let out = OutboundMessage {
        rfc724_mid: crate::tools::create_rfc724_mid(&self_addr),
        from_addr: self_addr,
        recipients: vec![addr],
        subject: "Read receipt".into(),
        text: None,
        file: None,
        viewtype: crate::message::Viewtype::Text,
        headers: [
            ("chat-version".to_string(), "1.0".to_string()),
            ("mdn-for".to_string(), rfc724_mid.to_string()),
        ]
        .into(),
        timestamp_sent: time(),
    };
    match ctx.smtp.send(&out) {
        Ok(()) => {
            ctx.note_network_ok();
            // flag the original message on the server so a re-sync does
            // not trigger a second receipt
            if let Err(e) = add(ctx, Action::MarkseenMdnOnServer, job.foreign_id, json!({}), 0) {
                warn!("cannot schedule mdnsent flag: {}", e);
            }
            Status::Finished
        }
        Err(e) => smtp_error_to_status(ctx, e),
    }
}

fn send_msg_to_smtp(ctx: &Context, job: &Job) -> Status {
    let Ok(Some(msg)) = crate::store::messages::get(&ctx.sql, job.foreign_id) else {
        return Status::Finished; // deleted while queued
    };
    if msg.state != MessageState::OutPending {
        return Status::Finished; // already delivered or failed
    }
    let recipients: Vec<String> = job.param["recipients"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if recipients.is_empty() {
        return Status::Failed("no recipients".into());
    }
    let Ok(self_addr) = ctx.self_addr() else {
        return Status::Failed("not configured".into());
    };
    let chat = match chat::get_chat(ctx, msg.chat_id) {
        Ok(chat) => chat,
        Err(e) => return Status::Failed(e.to_string()),
    };

    let mut headers = msg.param.headers.clone();
    headers.insert("chat-version".to_string(), "1.0".to_string());
    if chat.chattype.is_group() {
        headers.insert("chat-group-id".to_string(), chat.grpid.clone());
        headers.insert("chat-group-name".to_string(), chat.name.clone());
    }

    let subject = if chat.chattype.is_group() {
        format!("Chat: {}", chat.name)
    } else {
        "Chat message".to_string()
    };

    let out = OutboundMessage {
        rfc724_mid: msg.rfc724_mid.clone(),
        from_addr: self_addr,
        recipients,
        subject,
        text: msg.text.clone(),
        file: msg.param.file.as_deref().map(|name| blob::blob_path(ctx, name)),
        viewtype: msg.viewtype,
        headers,
        timestamp_sent: msg.timestamp_sent,
    };

    match ctx.smtp.send(&out) {
        Ok(()) => {
            ctx.note_network_ok();
            if let Err(e) = message::update_msg_state(ctx, msg.id, MessageState::OutDelivered) {
                return Status::Failed(e.to_string());
            }
            ctx.emit(Event::SmtpMessageSent(msg.rfc724_mid.clone()));
            ctx.emit(Event::MsgDelivered {
                chat_id: msg.chat_id,
                msg_id: msg.id,
            });
            info!("message {} delivered to smtp", msg.id);
            Status::Finished
        }
        Err(e) => smtp_error_to_status(ctx, e),
    }
}

fn smtp_error_to_status(ctx: &Context, e: TransportError) -> Status {
    match e {
        TransportError::Transient(msg) => {
            ctx.emit(Event::ErrorNetwork {
                first: ctx.note_network_error(),
                msg: msg.clone(),
            });
            Status::RetryLater(msg)
        }
        TransportError::Permanent(msg) => Status::Failed(msg),
    }
}

/// The network may be back: make delayed jobs due and wake every lane
/// for one probe pass.
pub fn maybe_network(ctx: &Context) {
    for lane in [Lane::Inbox, Lane::Mvbox, Lane::Sentbox, Lane::Smtp] {
        ctx.lane(lane).interrupt(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::jobs;
    use crate::test_utils::TestContext;

    #[test]
    fn test_backoff_strictly_increases_then_caps() {
        let cfg = JobConfig::default();
        let delays: Vec<i64> = (1..=17).map(|t| backoff_delay(&cfg, t)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        // strictly increasing until the cap kicks in
        let below_cap: Vec<i64> = delays.iter().copied().filter(|d| *d < cfg.backoff_cap).collect();
        for pair in below_cap.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(delays[0], 60);
        assert_eq!(*delays.last().unwrap(), cfg.backoff_cap);
    }

    #[test]
    fn test_send_pending_to_delivered() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        let msg_id = crate::chat::send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();
        assert_eq!(
            crate::message::get_msg(&t.ctx, msg_id).unwrap().state,
            MessageState::OutPending
        );
        t.drain_events();

        t.ctx.perform_jobs(Lane::Smtp);

        let msg = crate::message::get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::OutDelivered);
        assert!(t
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::MsgDelivered { msg_id: m, .. } if *m == msg_id)));
        assert_eq!(jobs::count(&t.ctx.sql).unwrap(), 0);

        let sent = t.smtp.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["bob@example.org"]);
        assert_eq!(sent[0].headers.get("chat-version").map(|s| s.as_str()), Some("1.0"));
    }

    #[test]
    fn test_transient_failures_backoff_then_give_up() {
        let mut t = TestContext::new();
        t.ctx.job_cfg.max_tries = 5;
        let chat_id = t.chat_with("bob@example.org");
        let msg_id = crate::chat::send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();
        t.smtp.fail_transient(100);
        t.drain_events();

        let mut desired = Vec::new();
        for round in 0..5 {
            t.ctx.perform_jobs(Lane::Smtp);
            if round < 4 {
                let job = jobs::load_next(&t.ctx.sql, Lane::Smtp.lane_id(), i64::MAX)
                    .unwrap()
                    .unwrap();
                assert_eq!(job.tries, round + 1);
                desired.push(job.desired_timestamp);
                // pretend the embedder noticed the network coming back
                maybe_network(&t.ctx);
            }
        }
        // each retry was scheduled further out than the previous one
        for pair in desired.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        // ceiling reached: job gone, message failed terminally, and the
        // failure event fired exactly once
        assert_eq!(jobs::count(&t.ctx.sql).unwrap(), 0);
        let msg = crate::message::get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::OutFailed);
        let events = t.drain_events();
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::MsgFailed { .. })).count(),
            1
        );
        // ErrorNetwork was raised with first=true only once
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::ErrorNetwork { first: true, .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_permanent_smtp_failure_fails_message() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        let msg_id = crate::chat::send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();
        t.smtp.fail_permanent("550 no such user");

        t.ctx.perform_jobs(Lane::Smtp);

        let msg = crate::message::get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::OutFailed);
        assert_eq!(msg.param.error.as_deref(), Some("550 no such user"));
        assert_eq!(jobs::count(&t.ctx.sql).unwrap(), 0);
    }

    #[test]
    fn test_jobs_drain_in_insertion_order() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        let a = crate::chat::send_text_msg(&t.ctx, chat_id, "first".into()).unwrap();
        let b = crate::chat::send_text_msg(&t.ctx, chat_id, "second".into()).unwrap();

        t.ctx.perform_jobs(Lane::Smtp);

        let sent = t.smtp.sent();
        assert_eq!(sent.len(), 2);
        let mid_a = crate::message::get_msg(&t.ctx, a).unwrap().rfc724_mid;
        let mid_b = crate::message::get_msg(&t.ctx, b).unwrap().rfc724_mid;
        assert_eq!(sent[0].rfc724_mid, mid_a);
        assert_eq!(sent[1].rfc724_mid, mid_b);
    }

    #[test]
    fn test_markseen_schedules_mdn_when_requested() {
        let t = TestContext::new();
        t.ctx.set_config(Config::MvboxMove, Some("0")).unwrap();
        let msg_id = t.receive_text_with(|m| {
            m.from_addr = "bob@example.org".into();
            m.text = Some("please confirm".into());
            m.wants_mdn = true;
        });
        crate::message::markseen_msgs(&t.ctx, &[msg_id]).unwrap();

        t.ctx.perform_jobs(Lane::Inbox);
        t.ctx.perform_jobs(Lane::Smtp);

        let sent = t.smtp.sent();
        let mdn = sent
            .iter()
            .find(|m| m.headers.contains_key("mdn-for"))
            .expect("mdn sent");
        assert_eq!(mdn.recipients, vec!["bob@example.org"]);
        assert!(t.imap.seen().contains(&("INBOX".to_string(), msg_id_uid(&t, msg_id))));
    }

    fn msg_id_uid(t: &TestContext, msg_id: u32) -> u32 {
        crate::message::get_msg(&t.ctx, msg_id).unwrap().server_uid
    }
}
