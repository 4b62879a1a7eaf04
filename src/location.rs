//! Location streaming.
//!
//! A chat can be armed for a bounded time window; while armed, every
//! reported position becomes a track point for that chat and is shipped
//! to the members in batches by a background job. When the window
//! elapses the chat disarms itself and a final `LocationChanged(None)`
//! closes the stream. Independent locations (user-placed markers) are
//! attached to a message and never part of a track.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::chat;
use crate::contact::CONTACT_ID_SELF;
use crate::context::Context;
use crate::error::Result;
use crate::events::Event;
use crate::job::{self, Action, Status};
use crate::store::{chats, jobs, locations};
use crate::tools::time;

/// One stored position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: i64,
    pub chat_id: u32,
    pub contact_id: u32,
    /// User-placed marker rather than a track point.
    pub independent: bool,
}

/// Batching delay before unsent track points go out.
const SEND_DELAY_SECS: i64 = 60;

/// Arm (or with `seconds == 0` disarm) location streaming for a chat.
pub fn send_locations_to_chat(ctx: &Context, chat_id: u32, seconds: i64) -> Result<()> {
    let chat = chat::get_chat(ctx, chat_id)?;
    if chat.is_special() {
        return Err(crate::error::Error::BadParameter(
            "cannot stream locations to a virtual chat".into(),
        ));
    }
    let now = time();
    if seconds > 0 {
        chats::set_locations_window(&ctx.sql, chat_id, now, now + seconds)?;
        // the end-of-window check disarms and closes the stream
        job::add(ctx, Action::MaybeSendLocationsEnded, chat_id, json!({}), seconds)?;
        info!("location streaming armed for chat {} ({}s)", chat_id, seconds);
    } else {
        chats::set_locations_window(&ctx.sql, chat_id, 0, 0)?;
        ctx.emit(Event::LocationChanged { contact_id: None });
        info!("location streaming disarmed for chat {}", chat_id);
    }
    ctx.emit(Event::ChatModified { chat_id });
    Ok(())
}

pub fn is_sending_locations_to_chat(ctx: &Context, chat_id: u32) -> Result<bool> {
    Ok(chat::get_chat(ctx, chat_id)?.is_sending_locations())
}

/// Record the current position. Returns whether any chat is still
/// armed, so the embedder knows when to stop its position source.
pub fn set_location(ctx: &Context, latitude: f64, longitude: f64, accuracy: f64) -> Result<bool> {
    let now = time();
    let armed = chats::streaming_chat_ids(&ctx.sql, now)?;
    if armed.is_empty() {
        return Ok(false);
    }
    for &chat_id in &armed {
        locations::insert(
            &ctx.sql,
            latitude,
            longitude,
            accuracy,
            now,
            chat_id,
            CONTACT_ID_SELF,
            false,
        )?;
    }
    if !jobs::exists_action(&ctx.sql, Action::MaybeSendLocations)? {
        job::add(ctx, Action::MaybeSendLocations, 0, json!({}), SEND_DELAY_SECS)?;
    }
    ctx.emit(Event::LocationChanged {
        contact_id: Some(CONTACT_ID_SELF),
    });
    Ok(true)
}

/// Track points of a chat (zero `contact_id` for all senders) between
/// `timestamp_begin` and `timestamp_end` (0 means now).
pub fn get_locations(
    ctx: &Context,
    chat_id: u32,
    contact_id: u32,
    timestamp_begin: i64,
    timestamp_end: i64,
) -> Result<Vec<Location>> {
    let end = if timestamp_end == 0 { time() } else { timestamp_end };
    locations::get_range(&ctx.sql, chat_id, contact_id, timestamp_begin, end)
}

pub fn delete_all_locations(ctx: &Context) -> Result<()> {
    locations::delete_all(&ctx.sql)?;
    ctx.emit(Event::LocationChanged { contact_id: None });
    Ok(())
}

/// Job body: ship unsent own track points of every armed chat as one
/// hidden message per chat.
pub(crate) fn job_maybe_send_locations(ctx: &Context) -> Status {
    let now = time();
    let armed = match chats::streaming_chat_ids(&ctx.sql, now) {
        Ok(ids) => ids,
        Err(e) => return Status::Failed(e.to_string()),
    };
    for chat_id in armed {
        let pending = match locations::unsent_for_chat(&ctx.sql, chat_id, CONTACT_ID_SELF) {
            Ok(p) => p,
            Err(e) => return Status::Failed(e.to_string()),
        };
        if pending.is_empty() {
            continue;
        }
        let payload = serde_json::to_string(
            &pending
                .iter()
                .map(|l| json!([l.latitude, l.longitude, l.accuracy, l.timestamp]))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default();
        if let Err(e) = chat::send_hidden_msg(
            ctx,
            chat_id,
            String::new(),
            [("chat-location-track".to_string(), payload)],
        ) {
            return Status::Failed(e.to_string());
        }
        let ids: Vec<u32> = pending.iter().map(|l| l.id).collect();
        if let Err(e) = locations::mark_sent(&ctx.sql, &ids) {
            return Status::Failed(e.to_string());
        }
        info!("shipped {} track points for chat {}", ids.len(), chat_id);
    }
    Status::Finished
}

/// Job body: disarm a chat whose streaming window elapsed.
pub(crate) fn job_maybe_send_locations_ended(ctx: &Context, chat_id: u32) -> Status {
    let chat = match chat::get_chat(ctx, chat_id) {
        Ok(chat) => chat,
        Err(_) => return Status::Finished, // chat deleted meanwhile
    };
    if chat.locations_send_until == 0 {
        return Status::Finished; // already disarmed by hand
    }
    if chat.locations_send_until > time() {
        // the window was extended after this job was scheduled
        return Status::RetryLater("streaming window still open".into());
    }
    if let Err(e) = chats::set_locations_window(&ctx.sql, chat_id, 0, 0) {
        return Status::Failed(e.to_string());
    }
    ctx.emit(Event::LocationChanged { contact_id: None });
    ctx.emit(Event::ChatModified { chat_id });
    info!("location streaming window elapsed for chat {}", chat_id);
    Status::Finished
}
