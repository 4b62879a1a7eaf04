//! Seams to the wire-level collaborators.
//!
//! The IMAP/SMTP protocol clients, MIME parsing/composition and the PGP
//! engine are external to this core. The core hands them structs that
//! sit *after* MIME parsing and *before* MIME composition, and gets
//! back results classified as transient or permanent so the job queue
//! can decide between retry and discard.
//!
//! Remote-push delivery: an IMAP transport that runs its own IDLE loop
//! signals new mail by calling [`crate::context::Context::interrupt`]
//! for the watching lane; the core's `idle` then returns and the worker
//! thread fetches.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::message::Viewtype;

/// Failure classification for network operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Worth retrying with backoff: timeouts, connection resets,
    /// temporary server errors.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Retrying cannot help: permanently rejected recipient, protocol
    /// violation, message gone.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A message as projected by the external MIME parser.
///
/// `headers` carries the chat-relevant headers verbatim (lowercased
/// names): `secure-join`, `secure-join-invitenumber`,
/// `secure-join-auth`, `secure-join-fingerprint`, `chat-group-id`,
/// `chat-group-name`, `chat-group-member-added`,
/// `chat-group-member-removed`, `chat-version`.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub rfc724_mid: String,
    pub in_reply_to: Option<String>,
    pub from_addr: String,
    pub from_display: Option<String>,
    pub to_addrs: Vec<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub viewtype: Viewtype,
    /// Remote-claimed send time, unix seconds.
    pub timestamp_sent: i64,
    pub folder: String,
    pub server_uid: u32,
    pub headers: BTreeMap<String, String>,
    /// Sender asked for a read receipt.
    pub wants_mdn: bool,
    /// Set when this message *is* a read receipt: the Message-ID it
    /// confirms.
    pub mdn_for: Option<String>,
    /// `(latitude, longitude, accuracy)` reported alongside the text.
    pub location: Option<(f64, f64, f64)>,
}

impl InboundMessage {
    /// Sent by a chat client rather than a plain MUA.
    pub fn is_chat_message(&self) -> bool {
        self.headers.contains_key("chat-version")
    }

    pub fn secure_join_step(&self) -> Option<&str> {
        self.headers.get("secure-join").map(|s| s.as_str())
    }
}

/// A message ready for the external MIME composer and SMTP client.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub rfc724_mid: String,
    pub from_addr: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
    pub viewtype: Viewtype,
    pub headers: BTreeMap<String, String>,
    pub timestamp_sent: i64,
}

/// Result of a single-message IMAP mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapActionResult {
    /// Server accepted the change.
    Success,
    /// Transient problem, retry later.
    RetryLater,
    /// The message no longer exists remotely; treat as done.
    AlreadyGone,
    /// Permanent failure.
    Failed,
}

/// Receiving side of a configured mailbox.
pub trait ImapTransport: Send + Sync {
    /// Establish (or verify) the connection. Used by configure and
    /// lazily by the worker loops.
    fn connect(&self) -> TransportResult<()>;

    /// Pull messages that arrived in `folder` since the last call and
    /// return them in the order the remote reports them.
    fn fetch_new(&self, folder: &str) -> TransportResult<Vec<InboundMessage>>;

    fn set_seen(&self, folder: &str, uid: u32) -> ImapActionResult;

    /// Record that an MDN was dispatched for this message.
    fn set_mdnsent(&self, folder: &str, uid: u32) -> ImapActionResult;

    /// Move a message; returns the UID in the destination folder.
    fn mv(&self, folder: &str, uid: u32, dest_folder: &str) -> TransportResult<u32>;

    fn delete_msg(&self, folder: &str, uid: u32) -> ImapActionResult;
}

/// Sending side of a configured mailbox.
pub trait SmtpTransport: Send + Sync {
    fn connect(&self) -> TransportResult<()>;

    fn send(&self, msg: &OutboundMessage) -> TransportResult<()>;
}

/// Seam to the PGP/Autocrypt engine for secure-join.
pub trait KeyVerifier: Send + Sync {
    /// Fingerprint of the own key, uppercase hex without spaces.
    fn self_fingerprint(&self) -> String;

    /// Fingerprint of the peer's known key, if any.
    fn peer_fingerprint(&self, addr: &str) -> Option<String>;
}
