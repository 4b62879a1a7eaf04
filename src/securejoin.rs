//! Secure-join: out-of-band contact and group verification.
//!
//! The handshake runs over ordinary hidden chat messages carrying a
//! `Secure-Join:` header. Contact setup:
//!
//! ```text
//! joiner                       inviter
//!   | -- vc-request -------------> |   (inviter 300)
//!   | <- vc-auth-required -------- |
//!   | -- vc-request-with-auth ---> |   (inviter 600, joiner 400)
//!   | <- vc-contact-confirm ------ |   (inviter 1000, joiner 1000)
//! ```
//!
//! The `vg-` variants end with a visible `vg-member-added` group
//! message instead of the confirm; the joiner acknowledges it with a
//! hidden `vg-member-added-received`, which triggers inviter 800 and
//! 1000. Progress is reported per handshake attempt and strictly
//! monotonic within it; a wrong auth token or fingerprint aborts with
//! progress 0 and a warning.

use tracing::{info, warn};

use crate::chat::{self, Blocked, Chattype};
use crate::contact::{self, Origin};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::qr::{self, Qr};
use crate::store::tokens::{self, Namespace};
use crate::store::chats;
use crate::transport::InboundMessage;

const HEADER_STEP: &str = "secure-join";
const HEADER_INVITENUMBER: &str = "secure-join-invitenumber";
const HEADER_AUTH: &str = "secure-join-auth";
const HEADER_FINGERPRINT: &str = "secure-join-fingerprint";

/// Joiner-side session state; at most one at a time, owned by the
/// context and completed by the receive pipeline.
#[derive(Debug)]
pub(crate) struct JoinerSession {
    pub contact_id: u32,
    pub contact_chat_id: u32,
    pub fingerprint: String,
    pub auth: String,
    pub grpid: Option<String>,
    pub last_progress: u32,
    /// `Some(Some(chat))` joined, `Some(None)` aborted or failed.
    pub result: Option<Option<u32>>,
}

/// Render the invite code the inviter shows as QR.
///
/// With a chat id the invite admits into that verified group; without,
/// it sets up a verified 1:1 contact. The tokens are persisted so the
/// invite survives restarts.
pub fn get_securejoin_qr(ctx: &Context, group_chat_id: Option<u32>) -> Result<String> {
    let self_addr = ctx.self_addr()?;
    let fingerprint = ctx.keys.self_fingerprint();

    let token_chat = group_chat_id.unwrap_or(0);
    let invitenumber = tokens::lookup_or_new(&ctx.sql, Namespace::InviteNumber, token_chat)?;
    let auth = tokens::lookup_or_new(&ctx.sql, Namespace::Auth, token_chat)?;

    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("a", &self_addr);
    if let Some(chat_id) = group_chat_id {
        let group = chat::get_chat(ctx, chat_id)?;
        if group.chattype != Chattype::VerifiedGroup {
            return Err(Error::BadParameter(
                "secure-join invites require a verified group".into(),
            ));
        }
        params.append_pair("g", &group.name);
        params.append_pair("x", &group.grpid);
    }
    params.append_pair("i", &invitenumber);
    params.append_pair("s", &auth);

    info!(
        "issued secure-join invite for {}",
        group_chat_id.map(|c| c.to_string()).unwrap_or_else(|| "contact setup".into())
    );
    Ok(format!("OPENPGP4FPR:{}#{}", fingerprint, params.finish()))
}

/// Join via a scanned invite. Blocks the calling thread across the
/// handshake round-trips; [`abort_securejoin`] (or a failed
/// verification) makes it return `Ok(None)`.
pub fn join_securejoin(ctx: &Context, qr_payload: &str) -> Result<Option<u32>> {
    let (contact_id, fingerprint, invitenumber, auth, grpid, step) =
        match qr::check_qr(ctx, qr_payload) {
            Qr::AskVerifyContact {
                contact_id,
                fingerprint,
                invitenumber,
                auth,
            } => (contact_id, fingerprint, invitenumber, auth, None, "vc-request"),
            Qr::AskVerifyGroup {
                contact_id,
                fingerprint,
                invitenumber,
                auth,
                grpid,
                ..
            } => (contact_id, fingerprint, invitenumber, auth, Some(grpid), "vg-request"),
            other => {
                return Err(Error::BadParameter(format!(
                    "not a secure-join invite (class {})",
                    other.class()
                )))
            }
        };

    let contact_chat_id = chat::create_by_contact_id(ctx, contact_id)?;

    {
        let mut session = ctx.joiner.lock().unwrap();
        if session.is_some() {
            return Err(Error::Ongoing);
        }
        *session = Some(JoinerSession {
            contact_id,
            contact_chat_id,
            fingerprint,
            auth,
            grpid,
            last_progress: 0,
            result: None,
        });
    }

    chat::send_hidden_msg(
        ctx,
        contact_chat_id,
        "Secure-Join: request".into(),
        [
            (HEADER_STEP.to_string(), step.to_string()),
            (HEADER_INVITENUMBER.to_string(), invitenumber),
        ],
    )?;
    info!("secure-join started towards contact {}", contact_id);

    let mut session = ctx.joiner.lock().unwrap();
    loop {
        if let Some(result) = session.as_ref().and_then(|s| s.result) {
            *session = None;
            return Ok(result);
        }
        session = ctx.joiner_cond.wait(session).unwrap();
    }
}

/// Abort a blocked [`join_securejoin`]; it returns `Ok(None)`.
pub fn abort_securejoin(ctx: &Context) {
    let mut session = ctx.joiner.lock().unwrap();
    if let Some(session) = session.as_mut() {
        if session.result.is_none() {
            session.result = Some(None);
            ctx.emit(Event::SecurejoinJoinerProgress {
                contact_id: session.contact_id,
                progress: 0,
            });
            warn!("secure-join aborted");
        }
    }
    ctx.joiner_cond.notify_all();
}

/// Dispatch one received handshake step. Called from the receive
/// pipeline after the message row is stored.
pub(crate) fn handle_securejoin(
    ctx: &Context,
    inbound: &InboundMessage,
    step: &str,
    contact_id: u32,
    chat_id: u32,
) -> Result<()> {
    info!("secure-join step {:?} from contact {}", step, contact_id);
    match step {
        "vc-request" | "vg-request" => inviter_on_request(ctx, inbound, step, contact_id, chat_id),
        "vc-request-with-auth" | "vg-request-with-auth" => {
            inviter_on_request_with_auth(ctx, inbound, step, contact_id, chat_id)
        }
        "vc-auth-required" | "vg-auth-required" => joiner_on_auth_required(ctx, step, contact_id),
        "vc-contact-confirm" => joiner_on_contact_confirm(ctx, contact_id),
        "vg-member-added" => joiner_on_member_added(ctx, inbound, chat_id),
        "vg-member-added-received" => inviter_on_member_added_received(ctx, contact_id),
        other => {
            warn!("unknown secure-join step {:?}, ignored", other);
            Ok(())
        }
    }
}

// --- inviter side ------------------------------------------------------

fn inviter_on_request(
    ctx: &Context,
    inbound: &InboundMessage,
    step: &str,
    contact_id: u32,
    chat_id: u32,
) -> Result<()> {
    let Some(invitenumber) = inbound.headers.get(HEADER_INVITENUMBER) else {
        warn!("secure-join request without invite number, ignored");
        return Ok(());
    };
    if !tokens::exists(&ctx.sql, Namespace::InviteNumber, invitenumber)? {
        warn!("secure-join request with unknown invite number, ignored");
        return Ok(());
    }
    // a fresh request starts a new handshake attempt; the progress
    // sequence is reported again from the beginning
    ctx.inviter_progress.lock().unwrap().remove(&contact_id);
    emit_inviter_progress(ctx, contact_id, 300);
    let reply_step = if step.starts_with("vg") {
        "vg-auth-required"
    } else {
        "vc-auth-required"
    };
    chat::send_hidden_msg(
        ctx,
        chat_id,
        "Secure-Join: auth required".into(),
        [(HEADER_STEP.to_string(), reply_step.to_string())],
    )?;
    Ok(())
}

fn inviter_on_request_with_auth(
    ctx: &Context,
    inbound: &InboundMessage,
    step: &str,
    contact_id: u32,
    chat_id: u32,
) -> Result<()> {
    let auth = inbound.headers.get(HEADER_AUTH).cloned().unwrap_or_default();
    if !tokens::exists(&ctx.sql, Namespace::Auth, &auth)? {
        ctx.emit(Event::Warning("secure-join: wrong auth token".into()));
        ctx.emit(Event::SecurejoinInviterProgress {
            contact_id,
            progress: 0,
        });
        return Ok(());
    }
    let claimed_fpr = inbound
        .headers
        .get(HEADER_FINGERPRINT)
        .cloned()
        .unwrap_or_default();
    match ctx.keys.peer_fingerprint(&inbound.from_addr) {
        Some(known) if known == claimed_fpr => {}
        _ => {
            ctx.emit(Event::Warning("secure-join: fingerprint mismatch".into()));
            ctx.emit(Event::SecurejoinInviterProgress {
                contact_id,
                progress: 0,
            });
            return Ok(());
        }
    }

    contact::add_or_lookup(ctx, "", &inbound.from_addr, Origin::SecurejoinVerified)?;
    contact::mark_verified(ctx, contact_id)?;
    emit_inviter_progress(ctx, contact_id, 600);

    if step.starts_with("vg") {
        let Some(group_chat_id) = tokens::chat_id_for(&ctx.sql, Namespace::Auth, &auth)?
            .filter(|id| *id > 0)
        else {
            warn!("group secure-join with a contact-setup token, ignored");
            return Ok(());
        };
        chats::add_member(&ctx.sql, group_chat_id, contact_id)?;
        let member = contact::get_contact(ctx, contact_id)?;
        chat::send_status_msg(
            ctx,
            group_chat_id,
            format!("Member {} added.", member.addr),
            [
                (HEADER_STEP.to_string(), "vg-member-added".to_string()),
                ("chat-group-member-added".to_string(), member.addr.clone()),
            ],
        )?;
        ctx.emit(Event::ChatModified {
            chat_id: group_chat_id,
        });
        // 800/1000 follow once the joiner acknowledges the member-added
    } else {
        chat::send_hidden_msg(
            ctx,
            chat_id,
            "Secure-Join: contact confirmed".into(),
            [(HEADER_STEP.to_string(), "vc-contact-confirm".to_string())],
        )?;
        // accept the chat on the inviter side as well
        chats::set_blocked(&ctx.sql, chat_id, Blocked::Not)?;
        emit_inviter_progress(ctx, contact_id, 1000);
    }
    Ok(())
}

/// The joiner saw our `vg-member-added`; the group join is complete on
/// both ends.
fn inviter_on_member_added_received(ctx: &Context, contact_id: u32) -> Result<()> {
    let through_auth = ctx
        .inviter_progress
        .lock()
        .unwrap()
        .get(&contact_id)
        .is_some_and(|p| *p >= 600);
    if !through_auth {
        warn!("member-added ack without a verified handshake, ignored");
        return Ok(());
    }
    emit_inviter_progress(ctx, contact_id, 800);
    emit_inviter_progress(ctx, contact_id, 1000);
    Ok(())
}

// --- joiner side -------------------------------------------------------

fn joiner_on_auth_required(ctx: &Context, step: &str, contact_id: u32) -> Result<()> {
    let mut guard = ctx.joiner.lock().unwrap();
    let Some(session) = guard.as_mut().filter(|s| s.contact_id == contact_id) else {
        warn!("auth-required without a running join session, ignored");
        return Ok(());
    };
    if session.result.is_some() || session.last_progress >= 400 {
        // done or a replayed auth-required; the secret goes out once
        return Ok(());
    }

    // the inviter's key must match the fingerprint from the scanned
    // invite before we hand over the auth secret
    let inviter_addr = contact::get_contact(ctx, contact_id)?.addr;
    match ctx.keys.peer_fingerprint(&inviter_addr) {
        Some(known) if known == session.fingerprint => {}
        _ => {
            session.result = Some(None);
            ctx.emit(Event::Warning("secure-join: inviter fingerprint mismatch".into()));
            ctx.emit(Event::SecurejoinJoinerProgress {
                contact_id,
                progress: 0,
            });
            ctx.joiner_cond.notify_all();
            return Ok(());
        }
    }

    let reply_step = if step.starts_with("vg") {
        "vg-request-with-auth"
    } else {
        "vc-request-with-auth"
    };
    let auth = session.auth.clone();
    let chat_id = session.contact_chat_id;
    session.last_progress = 400;
    drop(guard);

    chat::send_hidden_msg(
        ctx,
        chat_id,
        "Secure-Join: request with auth".into(),
        [
            (HEADER_STEP.to_string(), reply_step.to_string()),
            (HEADER_AUTH.to_string(), auth),
            (HEADER_FINGERPRINT.to_string(), ctx.keys.self_fingerprint()),
        ],
    )?;
    ctx.emit(Event::SecurejoinJoinerProgress {
        contact_id,
        progress: 400,
    });
    Ok(())
}

fn joiner_on_contact_confirm(ctx: &Context, contact_id: u32) -> Result<()> {
    let mut guard = ctx.joiner.lock().unwrap();
    let Some(session) = guard.as_mut().filter(|s| s.contact_id == contact_id) else {
        return Ok(());
    };
    if session.result.is_some() {
        return Ok(());
    }
    contact::add_or_lookup(
        ctx,
        "",
        &contact::get_contact(ctx, contact_id)?.addr,
        Origin::SecurejoinVerified,
    )?;
    contact::mark_verified(ctx, contact_id)?;
    session.result = Some(Some(session.contact_chat_id));
    ctx.emit(Event::SecurejoinJoinerProgress {
        contact_id,
        progress: 1000,
    });
    ctx.joiner_cond.notify_all();
    info!("secure-join: contact {} verified", contact_id);
    Ok(())
}

fn joiner_on_member_added(ctx: &Context, inbound: &InboundMessage, chat_id: u32) -> Result<()> {
    let added = inbound
        .headers
        .get("chat-group-member-added")
        .cloned()
        .unwrap_or_default();
    if crate::tools::normalize_addr(&added) != ctx.self_addr_normalized()? {
        return Ok(()); // someone else joined, membership already applied
    }
    let mut guard = ctx.joiner.lock().unwrap();
    let Some(session) = guard.as_mut().filter(|s| s.result.is_none()) else {
        return Ok(());
    };
    let expected_grpid = session.grpid.as_deref().unwrap_or_default();
    if inbound.headers.get("chat-group-id").map(|g| g.as_str()) != Some(expected_grpid) {
        return Ok(());
    }
    let contact_id = session.contact_id;
    let contact_chat_id = session.contact_chat_id;
    contact::mark_verified(ctx, contact_id)?;
    session.result = Some(Some(chat_id));
    ctx.emit(Event::SecurejoinJoinerProgress {
        contact_id,
        progress: 1000,
    });
    ctx.joiner_cond.notify_all();
    drop(guard);

    // let the inviter know the member-added arrived
    chat::send_hidden_msg(
        ctx,
        contact_chat_id,
        "Secure-Join: member added received".into(),
        [(
            HEADER_STEP.to_string(),
            "vg-member-added-received".to_string(),
        )],
    )?;
    info!("secure-join: joined group chat {}", chat_id);
    Ok(())
}

/// Strictly monotonic inviter progress per contact; 0 (abort) always
/// passes through.
fn emit_inviter_progress(ctx: &Context, contact_id: u32, progress: u32) {
    let mut map = ctx.inviter_progress.lock().unwrap();
    let last = map.entry(contact_id).or_insert(0);
    if progress != 0 && progress <= *last {
        return;
    }
    *last = progress;
    drop(map);
    ctx.emit(Event::SecurejoinInviterProgress {
        contact_id,
        progress,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;
    use std::time::Duration;

    const ALICE_FPR: &str = "AAAA567890ABCDEF1234567890ABCDEF12345678";
    const BOB_FPR: &str = "BBBB567890ABCDEF1234567890ABCDEF12345678";

    fn setup_pair() -> (TestContext, TestContext) {
        let alice = TestContext::with_addr("alice@example.org");
        let bob = TestContext::with_addr("bob@example.org");
        alice.keys.set_self_fingerprint(ALICE_FPR);
        bob.keys.set_self_fingerprint(BOB_FPR);
        alice.keys.set_peer_fingerprint("bob@example.org", BOB_FPR);
        bob.keys.set_peer_fingerprint("alice@example.org", ALICE_FPR);
        (alice, bob)
    }

    /// Push pending outbound mail on both sides and ferry it across,
    /// until the joiner thread finishes or the round budget is spent.
    fn ferry_until_done(
        alice: &TestContext,
        bob: &TestContext,
        done: impl Fn() -> bool,
    ) {
        for _ in 0..100 {
            if done() {
                return;
            }
            bob.ctx.perform_jobs(crate::worker::Lane::Smtp);
            bob.deliver_sent_to(alice);
            alice.ctx.perform_jobs(crate::worker::Lane::Smtp);
            alice.deliver_sent_to(bob);
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("handshake did not complete");
    }

    fn progress_of(events: &[Event]) -> (Vec<u32>, Vec<u32>) {
        let inviter = events
            .iter()
            .filter_map(|e| match e {
                Event::SecurejoinInviterProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        let joiner = events
            .iter()
            .filter_map(|e| match e {
                Event::SecurejoinJoinerProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        (inviter, joiner)
    }

    #[test]
    fn test_verify_contact_handshake() {
        let (alice, bob) = setup_pair();
        let qr = get_securejoin_qr(&alice.ctx, None).unwrap();

        let joined = std::thread::scope(|s| {
            let handle = s.spawn(|| join_securejoin(&bob.ctx, &qr));
            ferry_until_done(&alice, &bob, || handle.is_finished());
            handle.join().unwrap()
        })
        .unwrap();
        let chat_id = joined.expect("join completed");
        assert!(chat_id > crate::chat::CHAT_ID_LAST_SPECIAL);

        let (inviter, _) = progress_of(&alice.drain_events());
        assert_eq!(inviter, vec![300, 600, 1000]);
        let (_, joiner) = progress_of(&bob.drain_events());
        assert_eq!(joiner, vec![400, 1000]);

        // both ends verified each other
        let bob_on_alice = contact::lookup_id_by_addr(&alice.ctx, "bob@example.org")
            .unwrap()
            .unwrap();
        assert!(contact::get_contact(&alice.ctx, bob_on_alice).unwrap().verified);
        let alice_on_bob = contact::lookup_id_by_addr(&bob.ctx, "alice@example.org")
            .unwrap()
            .unwrap();
        assert!(contact::get_contact(&bob.ctx, alice_on_bob).unwrap().verified);
    }

    #[test]
    fn test_verify_group_handshake() {
        let (alice, bob) = setup_pair();
        let group_id = chat::create_group_chat(&alice.ctx, true, "vault").unwrap();
        // promote so membership changes are announced
        let claire = contact::create_contact(&alice.ctx, "", "claire@example.org").unwrap();
        contact::mark_verified(&alice.ctx, claire).unwrap();
        chat::add_contact_to_chat(&alice.ctx, group_id, claire).unwrap();
        chat::send_text_msg(&alice.ctx, group_id, "welcome".into()).unwrap();
        alice.ctx.perform_jobs(crate::worker::Lane::Smtp);
        alice.smtp.clear();
        alice.drain_events();

        let qr = get_securejoin_qr(&alice.ctx, Some(group_id)).unwrap();
        let joined = std::thread::scope(|s| {
            let handle = s.spawn(|| join_securejoin(&bob.ctx, &qr));
            ferry_until_done(&alice, &bob, || handle.is_finished());
            handle.join().unwrap()
        })
        .unwrap();
        let bob_group = joined.expect("join completed");
        // the member-added ack may still sit in bob's queue; one more
        // ferry round carries it over
        bob.ctx.perform_jobs(crate::worker::Lane::Smtp);
        bob.deliver_sent_to(&alice);

        let (inviter, _) = progress_of(&alice.drain_events());
        assert_eq!(inviter, vec![300, 600, 800, 1000]);
        let (_, joiner) = progress_of(&bob.drain_events());
        assert_eq!(joiner, vec![400, 1000]);

        // bob is a member on the inviter side and landed in a group
        // chat with the same group id locally
        let bob_on_alice = contact::lookup_id_by_addr(&alice.ctx, "bob@example.org")
            .unwrap()
            .unwrap();
        assert!(chat::is_contact_in_chat(&alice.ctx, group_id, bob_on_alice).unwrap());
        let local = chat::get_chat(&bob.ctx, bob_group).unwrap();
        assert!(local.chattype.is_group());
        assert_eq!(local.grpid, chat::get_chat(&alice.ctx, group_id).unwrap().grpid);
    }

    #[test]
    fn test_repeat_handshake_reports_progress_again() {
        let (alice, bob) = setup_pair();
        let qr = get_securejoin_qr(&alice.ctx, None).unwrap();

        // re-verification runs the same invite twice, e.g. after a key
        // change; both attempts must report the full sequence
        for _ in 0..2 {
            let joined = std::thread::scope(|s| {
                let handle = s.spawn(|| join_securejoin(&bob.ctx, &qr));
                ferry_until_done(&alice, &bob, || handle.is_finished());
                handle.join().unwrap()
            })
            .unwrap();
            assert!(joined.is_some());

            let (inviter, _) = progress_of(&alice.drain_events());
            assert_eq!(inviter, vec![300, 600, 1000]);
            let (_, joiner) = progress_of(&bob.drain_events());
            assert_eq!(joiner, vec![400, 1000]);
        }
    }

    #[test]
    fn test_abort_unblocks_join() {
        let (alice, bob) = setup_pair();
        let qr = get_securejoin_qr(&alice.ctx, None).unwrap();

        let result = std::thread::scope(|s| {
            let handle = s.spawn(|| join_securejoin(&bob.ctx, &qr));
            // never ferry anything; just abort after the request went out
            std::thread::sleep(Duration::from_millis(50));
            abort_securejoin(&bob.ctx);
            handle.join().unwrap()
        })
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_wrong_inviter_fingerprint_aborts() {
        let (alice, bob) = setup_pair();
        // bob knows a different key for alice than the invite claims
        bob.keys
            .set_peer_fingerprint("alice@example.org", &ALICE_FPR.replace('A', "C"));
        let qr = get_securejoin_qr(&alice.ctx, None).unwrap();

        let result = std::thread::scope(|s| {
            let handle = s.spawn(|| join_securejoin(&bob.ctx, &qr));
            ferry_until_done(&alice, &bob, || handle.is_finished());
            handle.join().unwrap()
        })
        .unwrap();
        assert!(result.is_none());

        let (_, joiner) = progress_of(&bob.drain_events());
        assert_eq!(joiner, vec![0]);
    }

    #[test]
    fn test_wrong_auth_token_reports_zero_progress() {
        let (alice, _bob) = setup_pair();
        let msg_id = {
            // forge a request-with-auth carrying a bogus token
            let mut msg = alice.inbound_text("bob@example.org", "Secure-Join: request with auth");
            msg.headers.insert(HEADER_STEP.into(), "vc-request-with-auth".into());
            msg.headers.insert(HEADER_AUTH.into(), "bogus".into());
            msg.headers.insert(HEADER_FINGERPRINT.into(), BOB_FPR.into());
            crate::receive::receive_inbound(&alice.ctx, &msg).unwrap()
        };
        assert!(msg_id.is_some());
        let (inviter, _) = progress_of(&alice.drain_events());
        assert_eq!(inviter, vec![0]);
    }
}
