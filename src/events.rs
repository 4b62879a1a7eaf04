//! Typed event channel.
//!
//! Every unsolicited state change raises exactly one [`Event`] on a
//! multi-producer channel. Emitting never blocks; events may be raised
//! from any worker thread and consumers are expected to return quickly.

use serde::{Deserialize, Serialize};

/// Closed set of events the core raises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Informational log line, not an error.
    Info(String),

    Warning(String),

    /// Non-network error surfaced to the user.
    Error(String),

    /// Transient network trouble. `first` is true only for the first
    /// occurrence of an error sequence; retries of the same job do not
    /// re-raise it.
    ErrorNetwork { first: bool, msg: String },

    /// The caller acted on a group they are no longer a member of.
    ErrorSelfNotInGroup(String),

    SmtpConnected(String),
    ImapConnected(String),
    SmtpMessageSent(String),

    /// Messages or chats changed in a way not covered by a more
    /// specific event. `msg_id` is 0 when unspecific.
    MsgsChanged { chat_id: u32, msg_id: u32 },

    /// A fresh incoming message was stored.
    IncomingMsg { chat_id: u32, msg_id: u32 },

    /// An outgoing message was accepted by the SMTP server.
    MsgDelivered { chat_id: u32, msg_id: u32 },

    /// An outgoing message could not be sent and is now in a terminal
    /// failed state.
    MsgFailed { chat_id: u32, msg_id: u32 },

    /// A read receipt for an outgoing message arrived.
    MsgRead { chat_id: u32, msg_id: u32 },

    /// Chat name, membership, image or similar properties changed.
    ChatModified { chat_id: u32 },

    /// `contact_id` is None for bulk changes.
    ContactsChanged { contact_id: Option<u32> },

    /// A location record changed. `contact_id` is None when location
    /// streaming ended for a chat.
    LocationChanged { contact_id: Option<u32> },

    /// Configure progress, 0..=1000 permille. 0 means failed.
    ConfigureProgress { progress: u32 },

    /// Import/export progress, 0..=1000 permille. 0 means failed.
    ImexProgress { progress: u32 },

    /// A backup artifact was completely written.
    ImexFileWritten { path: String },

    /// Secure-join progress on the inviting side: 300, 600, 800, 1000.
    SecurejoinInviterProgress { contact_id: u32, progress: u32 },

    /// Secure-join progress on the joining side: 400, 1000.
    SecurejoinJoinerProgress { contact_id: u32, progress: u32 },
}

/// Event queue shared by all producers inside one context.
#[derive(Debug, Clone)]
pub struct Events {
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Queue an event. Never blocks.
    pub fn emit(&self, event: Event) {
        // The channel is unbounded and the receiver half is kept alive
        // by the context itself, so a send can only fail after drop.
        if let Err(e) = self.tx.send(event) {
            tracing::warn!("event channel closed: {}", e);
        }
    }

    /// Hand out a consumer handle for the embedding application.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            rx: self.rx.clone(),
        }
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the event channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    rx: flume::Receiver<Event>,
}

impl EventEmitter {
    /// Block until the next event arrives.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }
}
