//! Message model and state machine.
//!
//! Incoming messages move `fresh → noticed → seen`, outgoing messages
//! `preparing → draft | pending → delivered → mdn-received` (or
//! `failed`). States only move forward; `failed` is terminal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chat::CHAT_ID_TRASH;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::job::{self, Action};
use crate::store::messages;

/// Message states, numeric values preserved in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize, Default)]
#[repr(i32)]
pub enum MessageState {
    #[default]
    Undefined = 0,
    InFresh = 10,
    InNoticed = 13,
    InSeen = 16,
    /// Outgoing, attachment still being produced by the caller.
    OutPreparing = 18,
    OutDraft = 19,
    /// Queued for SMTP; only the send job moves it out of here.
    OutPending = 20,
    /// Terminal.
    OutFailed = 24,
    OutDelivered = 26,
    OutMdnRcvd = 28,
}

impl MessageState {
    pub fn from_i32(v: i32) -> MessageState {
        match v {
            10 => MessageState::InFresh,
            13 => MessageState::InNoticed,
            16 => MessageState::InSeen,
            18 => MessageState::OutPreparing,
            19 => MessageState::OutDraft,
            20 => MessageState::OutPending,
            24 => MessageState::OutFailed,
            26 => MessageState::OutDelivered,
            28 => MessageState::OutMdnRcvd,
            _ => MessageState::Undefined,
        }
    }

    pub fn is_outgoing(self) -> bool {
        self >= MessageState::OutPreparing
    }

    /// Legal forward transitions. Everything else is refused.
    pub fn can_transition(self, to: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, to),
            (Undefined, _)
                | (InFresh, InNoticed)
                | (InFresh, InSeen)
                | (InNoticed, InSeen)
                | (OutPreparing, OutDraft)
                | (OutPreparing, OutPending)
                | (OutPreparing, OutFailed)
                | (OutPending, OutDelivered)
                | (OutPending, OutFailed)
                | (OutDelivered, OutMdnRcvd)
        )
    }
}

/// Content type of a message, numeric values preserved in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(i32)]
pub enum Viewtype {
    #[default]
    Text = 10,
    Image = 20,
    Gif = 21,
    Audio = 40,
    Voice = 41,
    Video = 50,
    File = 60,
}

impl Viewtype {
    pub fn from_i32(v: i32) -> Viewtype {
        match v {
            20 => Viewtype::Image,
            21 => Viewtype::Gif,
            40 => Viewtype::Audio,
            41 => Viewtype::Voice,
            50 => Viewtype::Video,
            60 => Viewtype::File,
            _ => Viewtype::Text,
        }
    }

    pub fn has_file(self) -> bool {
        self != Viewtype::Text
    }
}

/// Serialized per-message extras, stored as JSON in the `param` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MsgParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    /// Extra headers the composer must put on the wire (secure-join
    /// steps, group management markers).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Why the message failed, for terminal `OutFailed` rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable snapshot of a message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u32,
    pub rfc724_mid: String,
    pub chat_id: u32,
    pub from_id: u32,
    pub viewtype: Viewtype,
    pub state: MessageState,
    pub timestamp_sort: i64,
    pub timestamp_sent: i64,
    pub timestamp_rcvd: i64,
    pub text: Option<String>,
    pub param: MsgParams,
    pub starred: bool,
    pub forwarded: bool,
    pub is_info: bool,
    pub hidden: bool,
    pub location_id: u32,
    pub server_folder: String,
    pub server_uid: u32,
    pub wants_mdn: bool,
}

pub fn get_msg(ctx: &Context, msg_id: u32) -> Result<Message> {
    messages::get(&ctx.sql, msg_id)?.ok_or(Error::NoMessage(msg_id))
}

/// Move a message forward in its state machine. Backward moves are
/// refused with a warning; returns whether the row changed.
pub fn update_msg_state(ctx: &Context, msg_id: u32, state: MessageState) -> Result<bool> {
    let Some(msg) = messages::get(&ctx.sql, msg_id)? else {
        return Ok(false);
    };
    if msg.state == state {
        return Ok(false);
    }
    if !msg.state.can_transition(state) {
        warn!(
            "refusing message {} state change {:?} -> {:?}",
            msg_id, msg.state, state
        );
        return Ok(false);
    }
    messages::set_state(&ctx.sql, msg_id, state)?;
    Ok(true)
}

/// Mark messages seen: sets the terminal incoming state, schedules the
/// server-side flag and, where the sender asked for one, a read
/// receipt. Idempotent; already-seen messages produce no event and no
/// job.
pub fn markseen_msgs(ctx: &Context, msg_ids: &[u32]) -> Result<()> {
    let mdns_enabled = ctx.get_config_bool(Config::MdnsEnabled)?;
    for &msg_id in msg_ids {
        let Some(msg) = messages::get(&ctx.sql, msg_id)? else {
            continue;
        };
        if msg.state.is_outgoing() || msg.state == MessageState::InSeen {
            continue;
        }
        if !update_msg_state(ctx, msg_id, MessageState::InSeen)? {
            continue;
        }
        job::add(ctx, Action::MarkseenMsgOnServer, msg_id, serde_json::json!({}), 0)?;
        if msg.wants_mdn && mdns_enabled {
            info!("message {} wants an MDN, scheduled with markseen", msg_id);
        }
        ctx.emit(Event::MsgsChanged {
            chat_id: msg.chat_id,
            msg_id,
        });
    }
    Ok(())
}

/// Toggle the star flag on a message set.
pub fn star_msgs(ctx: &Context, msg_ids: &[u32], star: bool) -> Result<()> {
    for &msg_id in msg_ids {
        messages::set_starred(&ctx.sql, msg_id, star)?;
    }
    ctx.emit(Event::MsgsChanged { chat_id: 0, msg_id: 0 });
    Ok(())
}

/// Delete messages locally and schedule server-side removal. The rows
/// move to the trash chat so the Message-ID stays known until the
/// remote copy is gone (otherwise the next fetch re-downloads them).
pub fn delete_msgs(ctx: &Context, msg_ids: &[u32]) -> Result<()> {
    for &msg_id in msg_ids {
        let Some(msg) = messages::get(&ctx.sql, msg_id)? else {
            continue;
        };
        messages::move_to_chat(&ctx.sql, msg_id, CHAT_ID_TRASH)?;
        if !msg.server_folder.is_empty() {
            job::add(ctx, Action::DeleteMsgOnServer, msg_id, serde_json::json!({}), 0)?;
        } else {
            messages::delete(&ctx.sql, msg_id)?;
        }
    }
    ctx.emit(Event::MsgsChanged { chat_id: 0, msg_id: 0 });
    Ok(())
}

/// Terminal failure of an outgoing message. Raises exactly one event
/// and records the reason so a restart observes the same outcome.
pub fn set_msg_failed(ctx: &Context, msg_id: u32, error: Option<&str>) -> Result<()> {
    let Some(mut msg) = messages::get(&ctx.sql, msg_id)? else {
        return Ok(());
    };
    if msg.state == MessageState::OutFailed {
        return Ok(());
    }
    if !msg.state.can_transition(MessageState::OutFailed) {
        return Ok(());
    }
    msg.param.error = error.map(|e| e.to_string());
    messages::set_param(&ctx.sql, msg_id, &msg.param)?;
    messages::set_state(&ctx.sql, msg_id, MessageState::OutFailed)?;
    warn!("message {} failed: {:?}", msg_id, error);
    ctx.emit(Event::MsgFailed {
        chat_id: msg.chat_id,
        msg_id,
    });
    Ok(())
}

/// An incoming read receipt referenced this Message-ID.
pub fn handle_mdn(ctx: &Context, rfc724_mid: &str) -> Result<()> {
    let Some(msg_id) = messages::lookup_by_rfc724_mid(&ctx.sql, rfc724_mid)? else {
        return Ok(());
    };
    if update_msg_state(ctx, msg_id, MessageState::OutMdnRcvd)? {
        let msg = get_msg(ctx, msg_id)?;
        ctx.emit(Event::MsgRead {
            chat_id: msg.chat_id,
            msg_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_states_only_move_forward() {
        use MessageState::*;
        assert!(InFresh.can_transition(InNoticed));
        assert!(InFresh.can_transition(InSeen));
        assert!(InNoticed.can_transition(InSeen));
        assert!(OutPreparing.can_transition(OutDraft));
        assert!(OutPreparing.can_transition(OutPending));
        assert!(OutPending.can_transition(OutDelivered));
        assert!(OutDelivered.can_transition(OutMdnRcvd));

        assert!(!InSeen.can_transition(InFresh));
        assert!(!InSeen.can_transition(InNoticed));
        assert!(!OutDelivered.can_transition(OutPending));
        // failed is terminal, also for retries
        assert!(!OutFailed.can_transition(OutPending));
        assert!(!OutFailed.can_transition(OutDelivered));
        // a read receipt cannot "unfail" a message
        assert!(!OutFailed.can_transition(OutMdnRcvd));
    }

    #[test]
    fn test_markseen_is_idempotent() {
        let t = TestContext::new();
        let msg_id = t.receive_text("bob@example.org", "hello");
        t.drain_events();

        markseen_msgs(&t.ctx, &[msg_id]).unwrap();
        let first: Vec<_> = t.drain_events();
        assert!(first
            .iter()
            .any(|e| matches!(e, Event::MsgsChanged { msg_id: m, .. } if *m == msg_id)));
        assert_eq!(get_msg(&t.ctx, msg_id).unwrap().state, MessageState::InSeen);

        markseen_msgs(&t.ctx, &[msg_id]).unwrap();
        let second: Vec<_> = t.drain_events();
        assert!(second.is_empty());
        assert_eq!(get_msg(&t.ctx, msg_id).unwrap().state, MessageState::InSeen);
    }

    #[test]
    fn test_star_msgs_roundtrip() {
        let t = TestContext::new();
        let msg_id = t.receive_text("bob@example.org", "keep this");

        star_msgs(&t.ctx, &[msg_id], true).unwrap();
        assert!(get_msg(&t.ctx, msg_id).unwrap().starred);

        star_msgs(&t.ctx, &[msg_id], false).unwrap();
        assert!(!get_msg(&t.ctx, msg_id).unwrap().starred);
    }

    #[test]
    fn test_delete_msgs_purges_after_server_removal() {
        let t = TestContext::new();
        t.ctx.set_config(Config::MvboxMove, Some("0")).unwrap();
        let msg_id = t.receive_text("bob@example.org", "remove me");
        let uid = get_msg(&t.ctx, msg_id).unwrap().server_uid;

        delete_msgs(&t.ctx, &[msg_id]).unwrap();
        // parked in the trash chat until the remote copy is gone
        assert_eq!(get_msg(&t.ctx, msg_id).unwrap().chat_id, CHAT_ID_TRASH);

        t.ctx.perform_jobs(crate::worker::Lane::Inbox);
        assert!(t.imap.deleted().contains(&("INBOX".to_string(), uid)));
        assert!(matches!(get_msg(&t.ctx, msg_id), Err(Error::NoMessage(_))));
        assert_eq!(crate::store::jobs::count(&t.ctx.sql).unwrap(), 0);
    }

    #[test]
    fn test_set_msg_failed_only_once() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        let msg_id = crate::chat::send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();
        t.drain_events();

        set_msg_failed(&t.ctx, msg_id, Some("recipient rejected")).unwrap();
        set_msg_failed(&t.ctx, msg_id, Some("again")).unwrap();

        let events = t.drain_events();
        let failed = events
            .iter()
            .filter(|e| matches!(e, Event::MsgFailed { .. }))
            .count();
        assert_eq!(failed, 1);

        let msg = get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::OutFailed);
        assert_eq!(msg.param.error.as_deref(), Some("recipient rejected"));
    }
}
