//! Chat lifecycle: creation, listing, drafts, membership, sending.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::blob;
use crate::contact::{self, Origin, CONTACT_ID_SELF};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::job;
use crate::message::{self, MessageState, MsgParams, Viewtype};
use crate::store::chats::{self, ChatlistEntry};
use crate::store::messages::{self, NewMsg};
use crate::tools::{self, time};

/// Virtual chat aggregating messages from unconfirmed senders.
pub const CHAT_ID_DEADDROP: u32 = 1;
/// Holding pen for locally deleted messages until the server copy is
/// gone.
pub const CHAT_ID_TRASH: u32 = 3;
/// Messages in preparation, not yet assigned to a chat.
pub const CHAT_ID_MSGS_IN_CREATION: u32 = 4;
/// Virtual chat of starred messages.
pub const CHAT_ID_STARRED: u32 = 5;
/// Chatlist indicator linking to the archived chats.
pub const CHAT_ID_ARCHIVED_LINK: u32 = 6;
/// Chatlist indicator that the deaddrop is empty.
pub const CHAT_ID_ALLDONE_HINT: u32 = 7;
pub const CHAT_ID_LAST_SPECIAL: u32 = 9;

/// Suppress synthesized chatlist rows.
pub const CHATLIST_NO_SPECIALS: u32 = 0x1;
/// List archived chats instead of the default listing.
pub const CHATLIST_ARCHIVED_ONLY: u32 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Chattype {
    Undefined = 0,
    Single = 100,
    Group = 120,
    VerifiedGroup = 130,
}

impl Chattype {
    pub fn from_i32(v: i32) -> Chattype {
        match v {
            100 => Chattype::Single,
            120 => Chattype::Group,
            130 => Chattype::VerifiedGroup,
            _ => Chattype::Undefined,
        }
    }

    pub fn is_group(self) -> bool {
        matches!(self, Chattype::Group | Chattype::VerifiedGroup)
    }
}

/// Why a chat is withheld from the default listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Blocked {
    Not = 0,
    Manually = 1,
    /// Sender not yet accepted; messages show up in the deaddrop.
    Deaddrop = 2,
}

impl Blocked {
    pub fn from_i32(v: i32) -> Blocked {
        match v {
            1 => Blocked::Manually,
            2 => Blocked::Deaddrop,
            _ => Blocked::Not,
        }
    }
}

/// Immutable snapshot of a chat row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: u32,
    pub chattype: Chattype,
    pub name: String,
    pub grpid: String,
    pub blocked: Blocked,
    pub archived: bool,
    /// True until the first outbound message is dispatched; while set,
    /// membership/name edits are local-only.
    pub unpromoted: bool,
    pub verified: bool,
    pub locations_send_begin: i64,
    pub locations_send_until: i64,
}

impl Chat {
    pub fn is_special(&self) -> bool {
        self.id <= CHAT_ID_LAST_SPECIAL
    }

    pub fn is_sending_locations(&self) -> bool {
        self.locations_send_until > time()
    }
}

pub fn get_chat(ctx: &Context, chat_id: u32) -> Result<Chat> {
    chats::get(&ctx.sql, chat_id)?.ok_or(Error::NoChat(chat_id))
}

/// Get or create the single chat with a contact. An existing
/// deaddrop-blocked chat is accepted and unblocked.
pub fn create_by_contact_id(ctx: &Context, contact_id: u32) -> Result<u32> {
    contact::get_contact(ctx, contact_id)?;
    let chat_id = match chats::lookup_single_by_contact(&ctx.sql, contact_id)? {
        Some(chat_id) => {
            let chat = get_chat(ctx, chat_id)?;
            if chat.blocked != Blocked::Not {
                chats::set_blocked(&ctx.sql, chat_id, Blocked::Not)?;
            }
            chat_id
        }
        None => chats::create_single(&ctx.sql, contact_id, Blocked::Not)?,
    };
    ctx.emit(Event::MsgsChanged { chat_id, msg_id: 0 });
    Ok(chat_id)
}

/// Accept a deaddrop message: promote the hidden chat it lives in to a
/// normal chat. All other deaddropped messages from the same sender
/// live in the same per-contact chat and surface with it.
pub fn create_by_msg_id(ctx: &Context, msg_id: u32) -> Result<u32> {
    let msg = message::get_msg(ctx, msg_id)?;
    let chat = get_chat(ctx, msg.chat_id)?;
    if chat.is_special() {
        return Err(Error::BadParameter("message has no real chat".into()));
    }
    if chat.blocked != Blocked::Not {
        chats::set_blocked(&ctx.sql, chat.id, Blocked::Not)?;
        // accepting the sender makes them a known contact
        let sender = contact::get_contact(ctx, msg.from_id)?;
        contact::add_or_lookup(ctx, "", &sender.addr, Origin::ManuallyCreated)?;
    }
    ctx.emit(Event::MsgsChanged {
        chat_id: chat.id,
        msg_id: 0,
    });
    Ok(chat.id)
}

/// Create an empty, unpromoted group chat with self as only member.
pub fn create_group_chat(ctx: &Context, verified: bool, name: &str) -> Result<u32> {
    if name.trim().is_empty() {
        return Err(Error::BadParameter("group name must not be empty".into()));
    }
    let grpid = uuid::Uuid::new_v4().simple().to_string();
    let chat_id = chats::create_group(&ctx.sql, name.trim(), &grpid, verified, true)?;
    ctx.emit(Event::MsgsChanged { chat_id, msg_id: 0 });
    Ok(chat_id)
}

pub fn is_contact_in_chat(ctx: &Context, chat_id: u32, contact_id: u32) -> Result<bool> {
    chats::is_member(&ctx.sql, chat_id, contact_id)
}

pub fn get_chat_contacts(ctx: &Context, chat_id: u32) -> Result<Vec<u32>> {
    chats::get_members(&ctx.sql, chat_id)
}

fn ensure_group_membership(ctx: &Context, chat: &Chat) -> Result<()> {
    if !chats::is_member(&ctx.sql, chat.id, CONTACT_ID_SELF)? {
        ctx.emit(Event::ErrorSelfNotInGroup(format!(
            "not a member of chat {}",
            chat.id
        )));
        return Err(Error::NotInGroup);
    }
    Ok(())
}

/// Add a member. Verified groups only admit fingerprint-verified
/// contacts. While the group is unpromoted the edit is silent; once
/// promoted, an informational status message is sent to all members.
pub fn add_contact_to_chat(ctx: &Context, chat_id: u32, contact_id: u32) -> Result<()> {
    let chat = get_chat(ctx, chat_id)?;
    if !chat.chattype.is_group() {
        return Err(Error::BadParameter("not a group chat".into()));
    }
    ensure_group_membership(ctx, &chat)?;
    let member = contact::get_contact(ctx, contact_id)?;
    if chat.chattype == Chattype::VerifiedGroup && !member.verified {
        return Err(Error::BadParameter(format!(
            "{} is not verified, cannot join a verified group",
            member.addr
        )));
    }
    if !chats::add_member(&ctx.sql, chat_id, contact_id)? {
        return Ok(()); // already a member, nothing to announce
    }
    if !chat.unpromoted {
        send_status_msg(
            ctx,
            chat_id,
            format!("Member {} added.", member.addr),
            [("chat-group-member-added".to_string(), member.addr.clone())],
        )?;
    }
    ctx.emit(Event::ChatModified { chat_id });
    Ok(())
}

pub fn remove_contact_from_chat(ctx: &Context, chat_id: u32, contact_id: u32) -> Result<()> {
    let chat = get_chat(ctx, chat_id)?;
    if !chat.chattype.is_group() {
        return Err(Error::BadParameter("not a group chat".into()));
    }
    ensure_group_membership(ctx, &chat)?;
    let member = contact::get_contact(ctx, contact_id)?;
    if !chats::remove_member(&ctx.sql, chat_id, contact_id)? {
        return Ok(());
    }
    if !chat.unpromoted {
        send_status_msg(
            ctx,
            chat_id,
            format!("Member {} removed.", member.addr),
            [(
                "chat-group-member-removed".to_string(),
                member.addr.clone(),
            )],
        )?;
    }
    ctx.emit(Event::ChatModified { chat_id });
    Ok(())
}

pub fn set_chat_name(ctx: &Context, chat_id: u32, new_name: &str) -> Result<()> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err(Error::BadParameter("chat name must not be empty".into()));
    }
    let chat = get_chat(ctx, chat_id)?;
    if !chat.chattype.is_group() {
        return Err(Error::BadParameter("not a group chat".into()));
    }
    ensure_group_membership(ctx, &chat)?;
    if chat.name == new_name {
        return Ok(());
    }
    chats::set_name(&ctx.sql, chat_id, new_name)?;
    if !chat.unpromoted {
        send_status_msg(
            ctx,
            chat_id,
            format!("Group name changed from \"{}\" to \"{}\".", chat.name, new_name),
            [("chat-group-name-changed".to_string(), new_name.to_string())],
        )?;
    }
    ctx.emit(Event::ChatModified { chat_id });
    Ok(())
}

/// Archive or unarchive. Archiving implicitly marks the chat noticed;
/// membership and message states are untouched otherwise.
pub fn set_archived(ctx: &Context, chat_id: u32, archived: bool) -> Result<()> {
    let chat = get_chat(ctx, chat_id)?;
    if chat.is_special() {
        return Err(Error::BadParameter("cannot archive a virtual chat".into()));
    }
    if archived {
        messages::mark_noticed_chat(&ctx.sql, chat_id)?;
    }
    chats::set_archived(&ctx.sql, chat_id, archived)?;
    ctx.emit(Event::MsgsChanged { chat_id, msg_id: 0 });
    Ok(())
}

/// fresh -> noticed for a chat the user opened. Raises an event only
/// when something actually changed.
pub fn marknoticed_chat(ctx: &Context, chat_id: u32) -> Result<()> {
    if messages::mark_noticed_chat(&ctx.sql, chat_id)? > 0 {
        ctx.emit(Event::MsgsChanged { chat_id, msg_id: 0 });
    }
    Ok(())
}

/// Deaddrop variant: mark all fresh messages of one unconfirmed sender
/// noticed.
pub fn marknoticed_contact(ctx: &Context, contact_id: u32) -> Result<()> {
    let deaddrops = chats::deaddrop_chat_ids(&ctx.sql)?;
    if messages::mark_noticed_deaddrop_contact(&ctx.sql, &deaddrops, contact_id)? > 0 {
        ctx.emit(Event::MsgsChanged {
            chat_id: CHAT_ID_DEADDROP,
            msg_id: 0,
        });
    }
    Ok(())
}

pub fn delete_chat(ctx: &Context, chat_id: u32) -> Result<()> {
    let chat = get_chat(ctx, chat_id)?;
    if chat.is_special() {
        return Err(Error::BadParameter("cannot delete a virtual chat".into()));
    }
    chats::delete_chat(&ctx.sql, chat_id)?;
    ctx.emit(Event::MsgsChanged { chat_id: 0, msg_id: 0 });
    Ok(())
}

/// Replace the draft wholesale; an empty or absent text deletes it.
pub fn set_draft(ctx: &Context, chat_id: u32, text: Option<&str>) -> Result<()> {
    get_chat(ctx, chat_id)?;
    if let Some(old) = chats::get_draft_msg_id(&ctx.sql, chat_id)? {
        messages::delete(&ctx.sql, old)?;
    }
    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
        messages::insert(
            &ctx.sql,
            &NewMsg {
                chat_id,
                from_id: CONTACT_ID_SELF,
                timestamp_sort: time(),
                state: MessageState::OutDraft,
                viewtype: Viewtype::Text,
                text: Some(text.to_string()),
                hidden: true,
                ..Default::default()
            },
        )?;
    }
    ctx.emit(Event::MsgsChanged { chat_id, msg_id: 0 });
    Ok(())
}

pub fn get_draft(ctx: &Context, chat_id: u32) -> Result<Option<message::Message>> {
    match chats::get_draft_msg_id(&ctx.sql, chat_id)? {
        Some(id) => Ok(Some(message::get_msg(ctx, id)?)),
        None => Ok(None),
    }
}

pub fn get_chat_msgs(ctx: &Context, chat_id: u32) -> Result<Vec<u32>> {
    messages::get_chat_msgs(&ctx.sql, chat_id)
}

pub fn get_fresh_msg_cnt(ctx: &Context, chat_id: u32) -> Result<u32> {
    messages::get_fresh_msg_cnt(&ctx.sql, chat_id)
}

/// Resolve and validate the wire recipients for a chat.
fn resolve_recipients(ctx: &Context, chat: &Chat) -> Result<Vec<String>> {
    let mut recipients = Vec::new();
    for contact_id in chats::get_members(&ctx.sql, chat.id)? {
        if contact_id == CONTACT_ID_SELF {
            continue;
        }
        let member = contact::get_contact(ctx, contact_id)?;
        if mailparse::addrparse(&member.addr).is_err() {
            warn!("skipping invalid recipient {:?}", member.addr);
            continue;
        }
        recipients.push(member.addr);
    }
    if recipients.is_empty() {
        return Err(Error::BadParameter("chat has no valid recipients".into()));
    }
    Ok(recipients)
}

/// Sort timestamp for a new outbound message: now, but never behind
/// what is already in the chat.
fn outgoing_sort_timestamp(ctx: &Context, chat_id: u32) -> Result<i64> {
    Ok(std::cmp::max(
        time(),
        messages::newest_sort_timestamp(&ctx.sql, chat_id)?,
    ))
}

/// Shared insert for outgoing rows; does not enqueue anything.
pub(crate) fn create_outgoing_msg(
    ctx: &Context,
    chat_id: u32,
    viewtype: Viewtype,
    text: Option<String>,
    param: MsgParams,
    state: MessageState,
    hidden: bool,
    is_info: bool,
) -> Result<u32> {
    let self_addr = ctx.self_addr()?;
    messages::insert(
        &ctx.sql,
        &NewMsg {
            rfc724_mid: tools::create_rfc724_mid(&self_addr),
            chat_id,
            from_id: CONTACT_ID_SELF,
            timestamp_sort: outgoing_sort_timestamp(ctx, chat_id)?,
            timestamp_sent: time(),
            viewtype,
            state,
            text,
            param,
            hidden,
            is_info,
            ..Default::default()
        },
    )
}

fn prepare_send_checks(ctx: &Context, chat_id: u32) -> Result<Chat> {
    let chat = get_chat(ctx, chat_id)?;
    if chat.is_special() {
        return Err(Error::BadParameter("cannot send to a virtual chat".into()));
    }
    if chat.chattype.is_group() {
        ensure_group_membership(ctx, &chat)?;
    }
    Ok(chat)
}

/// Send a message: synchronously resolves recipients, copies the file
/// into the blob area, inserts a pending row, enqueues the SMTP job and
/// interrupts the SMTP lane. Only the job execution moves the message
/// out of `pending`.
pub fn send_msg(
    ctx: &Context,
    chat_id: u32,
    viewtype: Viewtype,
    text: Option<String>,
    file: Option<&Path>,
) -> Result<u32> {
    let chat = prepare_send_checks(ctx, chat_id)?;
    let recipients = resolve_recipients(ctx, &chat)?;

    let mut param = MsgParams::default();
    if let Some(file) = file {
        let blob = blob::create_from_path(ctx, file)?;
        param.file = Some(blob);
    } else if viewtype.has_file() {
        return Err(Error::BadParameter("viewtype needs a file".into()));
    }

    if chat.unpromoted {
        chats::set_promoted(&ctx.sql, chat_id)?;
    }

    let msg_id =
        create_outgoing_msg(ctx, chat_id, viewtype, text, param, MessageState::OutPending, false, false)?;
    job::send_msg_job(ctx, msg_id, recipients)?;
    info!("message {} queued for chat {}", msg_id, chat_id);
    ctx.emit(Event::MsgsChanged { chat_id, msg_id });
    Ok(msg_id)
}

pub fn send_text_msg(ctx: &Context, chat_id: u32, text: String) -> Result<u32> {
    if text.trim().is_empty() {
        return Err(Error::BadParameter("refusing to send empty message".into()));
    }
    send_msg(ctx, chat_id, Viewtype::Text, Some(text), None)
}

/// Insert a message whose attachment is still being produced. The
/// caller finishes it with [`send_prepared_msg`].
pub fn prepare_msg(ctx: &Context, chat_id: u32, viewtype: Viewtype, text: Option<String>) -> Result<u32> {
    let chat = prepare_send_checks(ctx, chat_id)?;
    if chat.unpromoted {
        chats::set_promoted(&ctx.sql, chat_id)?;
    }
    let msg_id = create_outgoing_msg(
        ctx,
        chat_id,
        viewtype,
        text,
        MsgParams::default(),
        MessageState::OutPreparing,
        false,
        false,
    )?;
    ctx.emit(Event::MsgsChanged { chat_id, msg_id });
    Ok(msg_id)
}

/// Attach the finished file and move a prepared message into the send
/// pipeline.
pub fn send_prepared_msg(ctx: &Context, msg_id: u32, file: &Path) -> Result<()> {
    let mut msg = message::get_msg(ctx, msg_id)?;
    if msg.state != MessageState::OutPreparing {
        return Err(Error::BadParameter("message is not in preparation".into()));
    }
    let chat = get_chat(ctx, msg.chat_id)?;
    let recipients = resolve_recipients(ctx, &chat)?;
    msg.param.file = Some(blob::create_from_path(ctx, file)?);
    messages::set_param(&ctx.sql, msg_id, &msg.param)?;
    message::update_msg_state(ctx, msg_id, MessageState::OutPending)?;
    job::send_msg_job(ctx, msg_id, recipients)?;
    ctx.emit(Event::MsgsChanged {
        chat_id: msg.chat_id,
        msg_id,
    });
    Ok(())
}

/// Informational status message (member added, name changed, ...):
/// shown in the chat and dispatched to all members.
pub(crate) fn send_status_msg(
    ctx: &Context,
    chat_id: u32,
    text: String,
    headers: impl IntoIterator<Item = (String, String)>,
) -> Result<u32> {
    let chat = get_chat(ctx, chat_id)?;
    let recipients = resolve_recipients(ctx, &chat)?;
    let mut param = MsgParams::default();
    param.headers.extend(headers);
    let msg_id = create_outgoing_msg(
        ctx,
        chat_id,
        Viewtype::Text,
        Some(text),
        param,
        MessageState::OutPending,
        false,
        true,
    )?;
    job::send_msg_job(ctx, msg_id, recipients)?;
    ctx.emit(Event::MsgsChanged { chat_id, msg_id });
    Ok(msg_id)
}

/// Hidden protocol message (secure-join steps). Not shown in the chat.
pub(crate) fn send_hidden_msg(
    ctx: &Context,
    chat_id: u32,
    text: String,
    headers: impl IntoIterator<Item = (String, String)>,
) -> Result<u32> {
    let chat = get_chat(ctx, chat_id)?;
    let recipients = resolve_recipients(ctx, &chat)?;
    let mut param = MsgParams::default();
    param.headers.extend(headers);
    let msg_id = create_outgoing_msg(
        ctx,
        chat_id,
        Viewtype::Text,
        Some(text),
        param,
        MessageState::OutPending,
        true,
        false,
    )?;
    job::send_msg_job(ctx, msg_id, recipients)?;
    Ok(msg_id)
}

/// The default chatlist plus synthesized special rows; see
/// [`CHATLIST_NO_SPECIALS`] and [`CHATLIST_ARCHIVED_ONLY`].
pub fn get_chatlist(ctx: &Context, flags: u32) -> Result<Vec<ChatlistEntry>> {
    if flags & CHATLIST_ARCHIVED_ONLY != 0 {
        return chats::get_chatlist(&ctx.sql, true);
    }
    let mut list = chats::get_chatlist(&ctx.sql, false)?;
    if flags & CHATLIST_NO_SPECIALS == 0 {
        if let Some((msg_id, ts)) = chats::newest_deaddrop_msg(&ctx.sql)? {
            list.insert(
                0,
                ChatlistEntry {
                    chat_id: CHAT_ID_DEADDROP,
                    msg_id: Some(msg_id),
                    sort_timestamp: ts,
                },
            );
        }
        if chats::archived_count(&ctx.sql)? > 0 {
            list.push(ChatlistEntry {
                chat_id: CHAT_ID_ARCHIVED_LINK,
                msg_id: None,
                sort_timestamp: 0,
            });
        }
    }
    Ok(list)
}

/// Free-running check used by configure and tests: a chat is visible in
/// the default listing.
pub fn is_listed(ctx: &Context, chat_id: u32) -> Result<bool> {
    Ok(get_chatlist(ctx, CHATLIST_NO_SPECIALS)?
        .iter()
        .any(|e| e.chat_id == chat_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_create_by_contact_id_reuses_chat() {
        let t = TestContext::new();
        let bob = contact::create_contact(&t.ctx, "Bob", "bob@example.org").unwrap();
        let a = create_by_contact_id(&t.ctx, bob).unwrap();
        let b = create_by_contact_id(&t.ctx, bob).unwrap();
        assert_eq!(a, b);
        assert!(a > CHAT_ID_LAST_SPECIAL);
    }

    #[test]
    fn test_archive_roundtrip_restores_visibility() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        send_text_msg(&t.ctx, chat_id, "hi".into()).unwrap();
        let members = get_chat_contacts(&t.ctx, chat_id).unwrap();

        assert!(is_listed(&t.ctx, chat_id).unwrap());
        set_archived(&t.ctx, chat_id, true).unwrap();
        assert!(!is_listed(&t.ctx, chat_id).unwrap());
        // archived-link indicator appears in the default listing
        assert!(get_chatlist(&t.ctx, 0)
            .unwrap()
            .iter()
            .any(|e| e.chat_id == CHAT_ID_ARCHIVED_LINK));

        set_archived(&t.ctx, chat_id, false).unwrap();
        assert!(is_listed(&t.ctx, chat_id).unwrap());
        assert_eq!(get_chat_contacts(&t.ctx, chat_id).unwrap(), members);
    }

    #[test]
    fn test_archive_marks_noticed() {
        let t = TestContext::new();
        let msg_id = t.receive_text("bob@example.org", "hello");
        let msg = message::get_msg(&t.ctx, msg_id).unwrap();
        let chat_id = create_by_msg_id(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::InFresh);

        set_archived(&t.ctx, chat_id, true).unwrap();
        let msg = message::get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::InNoticed);
    }

    #[test]
    fn test_chatlist_ordering_with_draft() {
        let t = TestContext::new();
        let older = t.chat_with("bob@example.org");
        let newer = t.chat_with("claire@example.org");
        t.receive_text_at("bob@example.org", "first", time() - 100);
        t.receive_text_at("claire@example.org", "second", time() - 50);

        let list = get_chatlist(&t.ctx, CHATLIST_NO_SPECIALS).unwrap();
        let order: Vec<u32> = list.iter().map(|e| e.chat_id).collect();
        assert_eq!(order, vec![newer, older]);

        // an edited draft resurfaces the older chat
        set_draft(&t.ctx, older, Some("typing...")).unwrap();
        let list = get_chatlist(&t.ctx, CHATLIST_NO_SPECIALS).unwrap();
        assert_eq!(list[0].chat_id, older);
    }

    #[test]
    fn test_draft_replaced_wholesale_and_deleted() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");

        set_draft(&t.ctx, chat_id, Some("one")).unwrap();
        set_draft(&t.ctx, chat_id, Some("two")).unwrap();
        let draft = get_draft(&t.ctx, chat_id).unwrap().unwrap();
        assert_eq!(draft.text.as_deref(), Some("two"));
        assert_eq!(draft.state, MessageState::OutDraft);

        // at most one draft per chat
        let conn = t.ctx.sql.conn().unwrap();
        let n: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM msgs WHERE chat_id=? AND state=19",
                [chat_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        drop(conn);

        set_draft(&t.ctx, chat_id, Some("   ")).unwrap();
        assert!(get_draft(&t.ctx, chat_id).unwrap().is_none());
    }

    #[test]
    fn test_deaddrop_listing_and_promotion() {
        let t = TestContext::new();
        let msg_id = t.receive_text("stranger@example.org", "psst");

        // stranger messages surface only through the deaddrop row
        let list = get_chatlist(&t.ctx, 0).unwrap();
        assert_eq!(list[0].chat_id, CHAT_ID_DEADDROP);
        assert_eq!(list[0].msg_id, Some(msg_id));
        assert_eq!(get_chatlist(&t.ctx, CHATLIST_NO_SPECIALS).unwrap().len(), 0);

        let chat_id = create_by_msg_id(&t.ctx, msg_id).unwrap();
        assert!(is_listed(&t.ctx, chat_id).unwrap());
        // message stayed with the (now unblocked) chat
        assert_eq!(message::get_msg(&t.ctx, msg_id).unwrap().chat_id, chat_id);
        // deaddrop row is gone
        let list = get_chatlist(&t.ctx, 0).unwrap();
        assert!(list.iter().all(|e| e.chat_id != CHAT_ID_DEADDROP));
    }

    #[test]
    fn test_unpromoted_group_edits_are_silent() {
        let t = TestContext::new();
        let bob = contact::create_contact(&t.ctx, "Bob", "bob@example.org").unwrap();
        let chat_id = create_group_chat(&t.ctx, false, "gang").unwrap();
        assert!(get_chat(&t.ctx, chat_id).unwrap().unpromoted);

        add_contact_to_chat(&t.ctx, chat_id, bob).unwrap();
        set_chat_name(&t.ctx, chat_id, "the gang").unwrap();
        assert_eq!(get_chat_msgs(&t.ctx, chat_id).unwrap().len(), 0);
        assert_eq!(t.smtp.sent().len(), 0);

        // first send promotes the chat
        send_text_msg(&t.ctx, chat_id, "hello all".into()).unwrap();
        assert!(!get_chat(&t.ctx, chat_id).unwrap().unpromoted);

        // subsequent edits announce themselves
        let claire = contact::create_contact(&t.ctx, "Claire", "claire@example.org").unwrap();
        add_contact_to_chat(&t.ctx, chat_id, claire).unwrap();
        let msgs = get_chat_msgs(&t.ctx, chat_id).unwrap();
        let last = message::get_msg(&t.ctx, *msgs.last().unwrap()).unwrap();
        assert!(last.is_info);
        assert!(last.text.unwrap().contains("claire@example.org"));
    }

    #[test]
    fn test_not_in_group_is_surfaced() {
        let t = TestContext::new();
        let bob = contact::create_contact(&t.ctx, "Bob", "bob@example.org").unwrap();
        let chat_id = create_group_chat(&t.ctx, false, "gang").unwrap();
        add_contact_to_chat(&t.ctx, chat_id, bob).unwrap();
        crate::store::chats::remove_member(&t.ctx.sql, chat_id, CONTACT_ID_SELF).unwrap();
        t.drain_events();

        let res = send_text_msg(&t.ctx, chat_id, "hi".into());
        assert!(matches!(res, Err(Error::NotInGroup)));
        assert!(t
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::ErrorSelfNotInGroup(_))));
    }

    #[test]
    fn test_verified_group_requires_verified_members() {
        let t = TestContext::new();
        let bob = contact::create_contact(&t.ctx, "Bob", "bob@example.org").unwrap();
        let chat_id = create_group_chat(&t.ctx, true, "vault").unwrap();
        assert!(add_contact_to_chat(&t.ctx, chat_id, bob).is_err());

        contact::mark_verified(&t.ctx, bob).unwrap();
        add_contact_to_chat(&t.ctx, chat_id, bob).unwrap();
        assert!(is_contact_in_chat(&t.ctx, chat_id, bob).unwrap());
    }

    #[test]
    fn test_send_to_virtual_chat_refused() {
        let t = TestContext::new();
        assert!(send_text_msg(&t.ctx, CHAT_ID_DEADDROP, "x".into()).is_err());
        assert!(send_text_msg(&t.ctx, CHAT_ID_TRASH, "x".into()).is_err());
    }

    #[test]
    fn test_prepare_then_send() {
        let t = TestContext::new();
        let chat_id = t.chat_with("bob@example.org");
        let msg_id = prepare_msg(&t.ctx, chat_id, Viewtype::File, Some("report".into())).unwrap();
        assert_eq!(
            message::get_msg(&t.ctx, msg_id).unwrap().state,
            MessageState::OutPreparing
        );

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        std::fs::write(&file, b"pdf").unwrap();
        send_prepared_msg(&t.ctx, msg_id, &file).unwrap();
        let msg = message::get_msg(&t.ctx, msg_id).unwrap();
        assert_eq!(msg.state, MessageState::OutPending);
        assert!(msg.param.file.is_some());
    }
}
