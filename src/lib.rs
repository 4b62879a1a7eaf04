//! mailchat — a chat-over-email synchronization core.
//!
//! The crate turns an ordinary mailbox into a chat backend: messages,
//! chats and contacts live in a local sqlite store, network side
//! effects run through a persistent job queue, and the wire protocols
//! (IMAP, SMTP, MIME, PGP) are injected as trait seams. The embedder
//! supplies one thread per worker lane and drives each with the
//! `perform_jobs -> fetch -> idle` loop on [`context::Context`];
//! everything the core does is reported through the typed event channel
//! ([`events::Event`]).

pub mod blob;
pub mod chat;
pub mod config;
pub mod configure;
pub mod contact;
pub mod context;
pub mod error;
pub mod events;
pub mod imex;
pub mod job;
pub mod location;
pub mod message;
pub mod qr;
pub mod receive;
pub mod securejoin;
pub mod store;
pub mod tools;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

pub use context::Context;
pub use error::{Error, Result};
pub use events::{Event, EventEmitter};
