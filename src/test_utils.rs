//! Shared test fixtures: a temp-dir context plus mock transports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use tempfile::TempDir;

use crate::config::Config;
use crate::contact;
use crate::context::Context;
use crate::events::{Event, EventEmitter};
use crate::receive;
use crate::tools::time;
use crate::transport::{
    ImapActionResult, ImapTransport, InboundMessage, KeyVerifier, OutboundMessage, SmtpTransport,
    TransportError, TransportResult,
};
use crate::worker::INBOX_FOLDER;

static INIT_LOGGING: Once = Once::new();

/// A fully wired context over a temporary database, plus handles to the
/// mock transports for scripting and inspection.
pub struct TestContext {
    pub ctx: Context,
    pub imap: Arc<MockImap>,
    pub smtp: Arc<MockSmtp>,
    pub keys: Arc<MockKeys>,
    emitter: EventEmitter,
    next_uid: AtomicU32,
    next_mid: AtomicU32,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_addr("alice@example.org")
    }

    pub fn with_addr(addr: &str) -> Self {
        let t = Self::unconfigured();
        t.ctx.set_config(Config::Addr, Some(addr)).unwrap();
        t.ctx.set_config(Config::Configured, Some("1")).unwrap();
        t
    }

    pub fn unconfigured() -> Self {
        INIT_LOGGING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
        let dir = tempfile::tempdir().unwrap();
        let imap = Arc::new(MockImap::default());
        let smtp = Arc::new(MockSmtp::default());
        let keys = Arc::new(MockKeys::default());
        let ctx = Context::new(
            &dir.path().join("db.sqlite"),
            imap.clone(),
            smtp.clone(),
            keys.clone(),
        )
        .unwrap();
        let emitter = ctx.get_event_emitter();
        Self {
            ctx,
            imap,
            smtp,
            keys,
            emitter,
            next_uid: AtomicU32::new(1),
            next_mid: AtomicU32::new(1),
            dir,
        }
    }

    /// A chat-client message as the parser would project it.
    pub fn inbound_text(&self, from: &str, text: &str) -> InboundMessage {
        let mut msg = self.inbound_plain(from, text);
        msg.headers.insert("chat-version".into(), "1.0".into());
        msg
    }

    /// A plain-MUA message without chat markers.
    pub fn inbound_plain(&self, from: &str, text: &str) -> InboundMessage {
        InboundMessage {
            rfc724_mid: format!(
                "Mr.test{}.{}@example.org",
                self.next_mid.fetch_add(1, Ordering::Relaxed),
                time()
            ),
            from_addr: from.to_string(),
            to_addrs: vec![self.ctx.self_addr().unwrap_or_default()],
            text: Some(text.to_string()),
            timestamp_sent: time(),
            folder: INBOX_FOLDER.to_string(),
            server_uid: self.next_uid.fetch_add(1, Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Receive a chat message from `from`; returns the stored row id.
    pub fn receive_text(&self, from: &str, text: &str) -> u32 {
        let msg = self.inbound_text(from, text);
        receive::receive_inbound(&self.ctx, &msg).unwrap().unwrap()
    }

    /// Like [`receive_text`], with a sender-claimed send time.
    pub fn receive_text_at(&self, from: &str, text: &str, timestamp_sent: i64) -> u32 {
        let mut msg = self.inbound_text(from, text);
        msg.timestamp_sent = timestamp_sent;
        receive::receive_inbound(&self.ctx, &msg).unwrap().unwrap()
    }

    /// Receive a chat message customized by the caller.
    pub fn receive_text_with(&self, customize: impl FnOnce(&mut InboundMessage)) -> u32 {
        let mut msg = self.inbound_text("peer@example.org", "");
        customize(&mut msg);
        receive::receive_inbound(&self.ctx, &msg).unwrap().unwrap()
    }

    /// Put a message into the mock inbox for the next `fetch`.
    pub fn queue_inbound(&self, from: &str, text: &str) {
        let msg = self.inbound_text(from, text);
        self.imap.inbox.lock().unwrap().push(msg);
    }

    /// Contact plus accepted 1:1 chat.
    pub fn chat_with(&self, addr: &str) -> u32 {
        let contact_id = contact::create_contact(&self.ctx, "", addr).unwrap();
        crate::chat::create_by_contact_id(&self.ctx, contact_id).unwrap()
    }

    /// Ferry everything this side handed to SMTP (since the last call)
    /// into the other side's receive pipeline.
    pub fn deliver_sent_to(&self, other: &TestContext) {
        let outbound: Vec<OutboundMessage> = {
            let sent = self.smtp.sent.lock().unwrap();
            let cursor = self.smtp.delivered.swap(sent.len(), Ordering::Relaxed);
            sent[cursor..].to_vec()
        };
        for out in outbound {
            let inbound = InboundMessage {
                rfc724_mid: out.rfc724_mid,
                from_addr: out.from_addr,
                to_addrs: out.recipients,
                subject: Some(out.subject),
                text: out.text,
                viewtype: out.viewtype,
                timestamp_sent: out.timestamp_sent,
                folder: INBOX_FOLDER.to_string(),
                server_uid: other.next_uid.fetch_add(1, Ordering::Relaxed),
                headers: out.headers,
                ..Default::default()
            };
            if let Err(e) = receive::receive_inbound(&other.ctx, &inbound) {
                panic!("ferry failed: {}", e);
            }
        }
    }

    /// All events raised so far, emptying the queue.
    pub fn drain_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.emitter.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct MockImap {
    pub inbox: Mutex<Vec<InboundMessage>>,
    seen: Mutex<Vec<(String, u32)>>,
    mdnsent: Mutex<Vec<(String, u32)>>,
    deleted: Mutex<Vec<(String, u32)>>,
    fail_connect: Mutex<Option<String>>,
    next_moved_uid: AtomicU32,
}

impl MockImap {
    pub fn fail_connect(&self, reason: &str) {
        *self.fail_connect.lock().unwrap() = Some(reason.to_string());
    }

    pub fn seen(&self) -> Vec<(String, u32)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<(String, u32)> {
        self.deleted.lock().unwrap().clone()
    }
}

impl ImapTransport for MockImap {
    fn connect(&self) -> TransportResult<()> {
        match self.fail_connect.lock().unwrap().as_ref() {
            Some(reason) => Err(TransportError::Permanent(reason.clone())),
            None => Ok(()),
        }
    }

    fn fetch_new(&self, folder: &str) -> TransportResult<Vec<InboundMessage>> {
        let mut inbox = self.inbox.lock().unwrap();
        let (matching, rest) = inbox.drain(..).partition(|m| m.folder == folder);
        *inbox = rest;
        Ok(matching)
    }

    fn set_seen(&self, folder: &str, uid: u32) -> ImapActionResult {
        self.seen.lock().unwrap().push((folder.to_string(), uid));
        ImapActionResult::Success
    }

    fn set_mdnsent(&self, folder: &str, uid: u32) -> ImapActionResult {
        self.mdnsent.lock().unwrap().push((folder.to_string(), uid));
        ImapActionResult::Success
    }

    fn mv(&self, _folder: &str, _uid: u32, _dest_folder: &str) -> TransportResult<u32> {
        Ok(10_000 + self.next_moved_uid.fetch_add(1, Ordering::Relaxed))
    }

    fn delete_msg(&self, folder: &str, uid: u32) -> ImapActionResult {
        self.deleted.lock().unwrap().push((folder.to_string(), uid));
        ImapActionResult::Success
    }
}

#[derive(Default)]
pub struct MockSmtp {
    sent: Mutex<Vec<OutboundMessage>>,
    delivered: AtomicUsize,
    fail_transient: AtomicU32,
    fail_permanent: Mutex<Option<String>>,
}

impl MockSmtp {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.delivered.store(0, Ordering::Relaxed);
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_transient(&self, n: u32) {
        self.fail_transient.store(n, Ordering::Relaxed);
    }

    /// Fail every send permanently from now on.
    pub fn fail_permanent(&self, reason: &str) {
        *self.fail_permanent.lock().unwrap() = Some(reason.to_string());
    }
}

impl SmtpTransport for MockSmtp {
    fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    fn send(&self, msg: &OutboundMessage) -> TransportResult<()> {
        if let Some(reason) = self.fail_permanent.lock().unwrap().as_ref() {
            return Err(TransportError::Permanent(reason.clone()));
        }
        let remaining = self.fail_transient.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_transient.store(remaining - 1, Ordering::Relaxed);
            return Err(TransportError::Transient("connection timed out".into()));
        }
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockKeys {
    self_fpr: Mutex<String>,
    peers: Mutex<BTreeMap<String, String>>,
}

impl MockKeys {
    pub fn set_self_fingerprint(&self, fpr: &str) {
        *self.self_fpr.lock().unwrap() = fpr.to_string();
    }

    pub fn set_peer_fingerprint(&self, addr: &str, fpr: &str) {
        self.peers
            .lock()
            .unwrap()
            .insert(addr.to_string(), fpr.to_string());
    }
}

impl KeyVerifier for MockKeys {
    fn self_fingerprint(&self) -> String {
        let fpr = self.self_fpr.lock().unwrap();
        if fpr.is_empty() {
            // stable placeholder so QR rendering works without setup
            "0000000000000000000000000000000000000000".to_string()
        } else {
            fpr.clone()
        }
    }

    fn peer_fingerprint(&self, addr: &str) -> Option<String> {
        self.peers.lock().unwrap().get(addr).cloned()
    }
}
