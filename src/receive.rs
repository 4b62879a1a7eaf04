//! Projection of fetched messages into the store.
//!
//! Messages arrive in the order the remote reports them and are
//! projected one by one: contact bookkeeping, chat assignment (with the
//! deaddrop policy for strangers), monotonic sort timestamps, duplicate
//! suppression by Message-ID, MDN recognition, group-membership changes
//! and secure-join dispatch.

use tracing::{info, warn};

use crate::chat::{self, Blocked, CHAT_ID_DEADDROP};
use crate::config::Config;
use crate::contact::{self, Origin, CONTACT_ID_SELF};
use crate::context::Context;
use crate::error::Result;
use crate::events::Event;
use crate::job::{self, Action};
use crate::message::MessageState;
use crate::securejoin;
use crate::store::{chats, locations, messages};
use crate::tools::{clamp_sent_timestamp, normalize_addr, time};
use crate::transport::InboundMessage;
use crate::worker::INBOX_FOLDER;

/// Store one fetched message. Returns the new message id, or `None`
/// when the message was a duplicate, a receipt, or filtered out by the
/// `show_emails` policy.
pub fn receive_inbound(ctx: &Context, inbound: &InboundMessage) -> Result<Option<u32>> {
    if inbound.rfc724_mid.is_empty() {
        warn!("dropping message without Message-ID from {:?}", inbound.from_addr);
        return Ok(None);
    }

    // duplicate suppression; a second sighting may still teach us a
    // better server location (e.g. after a move)
    if let Some(existing) = messages::lookup_by_rfc724_mid(&ctx.sql, &inbound.rfc724_mid)? {
        if !inbound.folder.is_empty() {
            messages::set_server_ref(&ctx.sql, existing, &inbound.folder, inbound.server_uid)?;
        }
        return Ok(None);
    }

    // a read receipt never becomes a chat row
    if let Some(mdn_for) = &inbound.mdn_for {
        crate::message::handle_mdn(ctx, mdn_for)?;
        return Ok(None);
    }

    let self_addr = ctx.self_addr_normalized()?;
    if normalize_addr(&inbound.from_addr) == self_addr {
        return receive_sent_copy(ctx, inbound);
    }

    // the policy decision needs the origin from *before* this message
    let prior_origin = match contact::lookup_id_by_addr(ctx, &inbound.from_addr)? {
        Some(id) => contact::get_contact(ctx, id)?.origin,
        None => Origin::Unknown,
    };
    let (from_id, _) = contact::add_or_lookup(
        ctx,
        inbound.from_display.as_deref().unwrap_or(""),
        &inbound.from_addr,
        Origin::IncomingReplyTo,
    )?;
    for to in &inbound.to_addrs {
        if normalize_addr(to) != self_addr {
            contact::add_or_lookup(ctx, "", to, Origin::IncomingUnknown)?;
        }
    }

    if !inbound.is_chat_message() && !accepts_plain_email(ctx, prior_origin)? {
        info!("ignoring plain email from {:?} per show_emails policy", inbound.from_addr);
        return Ok(None);
    }

    let Some((chat_id, blocked)) = assign_chat(ctx, inbound, from_id, prior_origin)? else {
        return Ok(None);
    };

    let step = inbound.secure_join_step().map(|s| s.to_string());
    // handshake traffic stays out of the visible chat, except the final
    // member-added message which doubles as the group change
    let hidden = matches!(step.as_deref(), Some(s) if s != "vg-member-added");

    let timestamp_sort = std::cmp::max(
        clamp_sent_timestamp(inbound.timestamp_sent),
        messages::newest_sort_timestamp(&ctx.sql, chat_id)?,
    );

    let msg_id = messages::insert(
        &ctx.sql,
        &messages::NewMsg {
            rfc724_mid: inbound.rfc724_mid.clone(),
            chat_id,
            from_id,
            timestamp_sort,
            timestamp_sent: inbound.timestamp_sent,
            timestamp_rcvd: time(),
            viewtype: inbound.viewtype,
            state: MessageState::InFresh,
            text: inbound.text.clone(),
            hidden,
            server_folder: inbound.folder.clone(),
            server_uid: inbound.server_uid,
            wants_mdn: inbound.wants_mdn,
            ..Default::default()
        },
    )?;

    apply_group_changes(ctx, inbound, chat_id, from_id)?;

    if let Some((lat, lng, acc)) = inbound.location {
        let location_id = locations::insert(&ctx.sql, lat, lng, acc, time(), chat_id, from_id, false)?;
        messages::set_location_id(&ctx.sql, msg_id, location_id)?;
        ctx.emit(Event::LocationChanged {
            contact_id: Some(from_id),
        });
    }

    if !hidden {
        let visible_chat = if blocked == Blocked::Deaddrop {
            CHAT_ID_DEADDROP
        } else {
            chat_id
        };
        ctx.emit(Event::IncomingMsg {
            chat_id: visible_chat,
            msg_id,
        });
    }

    if inbound.is_chat_message()
        && inbound.folder == INBOX_FOLDER
        && ctx.get_config_bool(Config::MvboxMove)?
    {
        job::add(ctx, Action::MoveMsg, msg_id, serde_json::json!({}), 0)?;
    }

    if let Some(step) = step {
        if let Err(e) = securejoin::handle_securejoin(ctx, inbound, &step, from_id, chat_id) {
            warn!("secure-join step {:?} failed: {}", step, e);
        }
    }

    Ok(Some(msg_id))
}

/// `show_emails` policy for messages without a chat-client marker:
/// 0 = only from contacts the user wrote to, 1 = from any known
/// contact, 2 = all (strangers land in the deaddrop).
fn accepts_plain_email(ctx: &Context, prior_origin: Origin) -> Result<bool> {
    Ok(match ctx.get_config_u32(Config::ShowEmails)? {
        0 => prior_origin >= Origin::OutgoingTo,
        1 => prior_origin.is_known(),
        _ => true,
    })
}

/// Find or create the chat a message belongs to. Returns the chat id
/// and its blocked state, or `None` when no chat can be derived.
fn assign_chat(
    ctx: &Context,
    inbound: &InboundMessage,
    from_id: u32,
    prior_origin: Origin,
) -> Result<Option<(u32, Blocked)>> {
    // group messages are grouped by their persistent group id
    if let Some(grpid) = inbound.headers.get("chat-group-id").filter(|g| !g.is_empty()) {
        if let Some(chat_id) = chats::lookup_group_by_grpid(&ctx.sql, grpid)? {
            let blocked = chat::get_chat(ctx, chat_id)?.blocked;
            return Ok(Some((chat_id, blocked)));
        }
        let name = inbound
            .headers
            .get("chat-group-name")
            .cloned()
            .unwrap_or_default();
        let chat_id = chats::create_group(&ctx.sql, &name, grpid, false, false)?;
        chats::add_member(&ctx.sql, chat_id, from_id)?;
        ctx.emit(Event::ChatModified { chat_id });
        return Ok(Some((chat_id, Blocked::Not)));
    }

    // a reply lands in the chat of its parent
    if let Some(parent_mid) = &inbound.in_reply_to {
        if let Some(parent_id) = messages::lookup_by_rfc724_mid(&ctx.sql, parent_mid)? {
            if let Ok(parent) = crate::message::get_msg(ctx, parent_id) {
                if parent.chat_id > chat::CHAT_ID_LAST_SPECIAL {
                    let blocked = chat::get_chat(ctx, parent.chat_id)?.blocked;
                    return Ok(Some((parent.chat_id, blocked)));
                }
            }
        }
    }

    if let Some(chat_id) = chats::lookup_single_by_contact(&ctx.sql, from_id)? {
        let blocked = chat::get_chat(ctx, chat_id)?.blocked;
        return Ok(Some((chat_id, blocked)));
    }

    // strangers start out deaddropped; contacts the user already wrote
    // to are accepted directly
    let blocked = if prior_origin >= Origin::OutgoingTo {
        Blocked::Not
    } else {
        Blocked::Deaddrop
    };
    let chat_id = chats::create_single(&ctx.sql, from_id, blocked)?;
    Ok(Some((chat_id, blocked)))
}

/// Project member-added / member-removed markers onto the local
/// membership table.
fn apply_group_changes(
    ctx: &Context,
    inbound: &InboundMessage,
    chat_id: u32,
    _from_id: u32,
) -> Result<()> {
    let chat = chat::get_chat(ctx, chat_id)?;
    if !chat.chattype.is_group() {
        return Ok(());
    }
    if let Some(added) = inbound.headers.get("chat-group-member-added") {
        let (member_id, _) = contact::add_or_lookup(ctx, "", added, Origin::IncomingUnknown)?;
        if chats::add_member(&ctx.sql, chat_id, member_id)? {
            ctx.emit(Event::ChatModified { chat_id });
        }
    }
    if let Some(removed) = inbound.headers.get("chat-group-member-removed") {
        if let Some(member_id) = contact::lookup_id_by_addr(ctx, removed)? {
            if chats::remove_member(&ctx.sql, chat_id, member_id)? {
                ctx.emit(Event::ChatModified { chat_id });
            }
        }
    }
    if let Some(name) = inbound.headers.get("chat-group-name") {
        if !name.is_empty() && *name != chat.name {
            chats::set_name(&ctx.sql, chat_id, name)?;
            ctx.emit(Event::ChatModified { chat_id });
        }
    }
    Ok(())
}

/// A copy of an own outgoing message (e.g. found in the sent folder).
/// Stored as delivered so the Message-ID is known, without events.
fn receive_sent_copy(ctx: &Context, inbound: &InboundMessage) -> Result<Option<u32>> {
    let chat_id = if let Some(grpid) = inbound.headers.get("chat-group-id") {
        chats::lookup_group_by_grpid(&ctx.sql, grpid)?
    } else if let Some(to) = inbound.to_addrs.first() {
        match contact::lookup_id_by_addr(ctx, to)? {
            Some(contact_id) => chats::lookup_single_by_contact(&ctx.sql, contact_id)?,
            None => None,
        }
    } else {
        None
    };
    let Some(chat_id) = chat_id else {
        return Ok(None);
    };
    let msg_id = messages::insert(
        &ctx.sql,
        &messages::NewMsg {
            rfc724_mid: inbound.rfc724_mid.clone(),
            chat_id,
            from_id: CONTACT_ID_SELF,
            timestamp_sort: std::cmp::max(
                clamp_sent_timestamp(inbound.timestamp_sent),
                messages::newest_sort_timestamp(&ctx.sql, chat_id)?,
            ),
            timestamp_sent: inbound.timestamp_sent,
            timestamp_rcvd: time(),
            viewtype: inbound.viewtype,
            state: MessageState::OutDelivered,
            text: inbound.text.clone(),
            server_folder: inbound.folder.clone(),
            server_uid: inbound.server_uid,
            ..Default::default()
        },
    )?;
    Ok(Some(msg_id))
}
