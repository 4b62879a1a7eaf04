//! Contacts: one row per normalized address.

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::store::contacts;
use crate::tools::{may_be_valid_addr, normalize_addr};

/// The account owner.
pub const CONTACT_ID_SELF: u32 = 1;
/// Device-generated messages (status notes, errors shown as messages).
pub const CONTACT_ID_DEVICE: u32 = 2;
pub const CONTACT_ID_LAST_SPECIAL: u32 = 9;

/// How the core first learned about an address. Higher origins carry
/// more trust; only contacts at [`Origin::IncomingReplyTo`] or better
/// show up in the default contact list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum Origin {
    Unknown = 0,
    /// Seen in a To/Cc of an incoming message from a stranger.
    IncomingUnknown = 0x10,
    /// The sender of an incoming message.
    IncomingReplyTo = 0x100,
    /// An address the user sent a message to.
    OutgoingTo = 0x1000,
    /// Secure-join verified this address.
    SecurejoinVerified = 0x10000,
    /// Explicitly created through the API.
    ManuallyCreated = 0x1000000,
}

impl Origin {
    pub fn from_i32(v: i32) -> Origin {
        match v {
            0x10 => Origin::IncomingUnknown,
            0x100 => Origin::IncomingReplyTo,
            0x1000 => Origin::OutgoingTo,
            0x10000 => Origin::SecurejoinVerified,
            0x1000000 => Origin::ManuallyCreated,
            _ => Origin::Unknown,
        }
    }

    /// Known well enough to list and to auto-accept chats for.
    pub fn is_known(self) -> bool {
        self >= Origin::IncomingReplyTo
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: u32,
    pub addr: String,
    pub display_name: String,
    pub origin: Origin,
    pub blocked: bool,
    pub verified: bool,
}

impl Contact {
    pub fn is_special(&self) -> bool {
        self.id <= CONTACT_ID_LAST_SPECIAL
    }
}

/// Create a contact (or raise the origin of an existing row) from an
/// explicit API call. Returns the contact id.
pub fn create_contact(ctx: &Context, name: &str, addr: &str) -> Result<u32> {
    if !may_be_valid_addr(addr) {
        return Err(Error::BadParameter(format!("bad address: {:?}", addr)));
    }
    let (contact_id, modified) =
        add_or_lookup(ctx, name, addr, Origin::ManuallyCreated)?;
    if modified {
        ctx.emit(Event::ContactsChanged {
            contact_id: Some(contact_id),
        });
    }
    Ok(contact_id)
}

/// Look up or create the row for a normalized address.
///
/// The uniqueness invariant lives here: every caller that needs a
/// contact id for an address goes through this function.
pub fn add_or_lookup(
    ctx: &Context,
    name: &str,
    addr: &str,
    origin: Origin,
) -> Result<(u32, bool)> {
    let addr = normalize_addr(addr);
    if addr == ctx.self_addr_normalized()? {
        return Ok((CONTACT_ID_SELF, false));
    }
    contacts::add_or_lookup(&ctx.sql, name, &addr, origin)
}

pub fn get_contact(ctx: &Context, contact_id: u32) -> Result<Contact> {
    if contact_id == CONTACT_ID_SELF {
        let addr = ctx.get_config_str(crate::config::Config::Addr)?.unwrap_or_default();
        let name = ctx
            .get_config_str(crate::config::Config::Displayname)?
            .unwrap_or_default();
        return Ok(Contact {
            id: CONTACT_ID_SELF,
            addr,
            display_name: name,
            origin: Origin::ManuallyCreated,
            blocked: false,
            verified: true,
        });
    }
    contacts::get(&ctx.sql, contact_id)?.ok_or(Error::NoContact(contact_id))
}

pub fn lookup_id_by_addr(ctx: &Context, addr: &str) -> Result<Option<u32>> {
    let addr = normalize_addr(addr);
    if !addr.is_empty() && addr == ctx.self_addr_normalized()? {
        return Ok(Some(CONTACT_ID_SELF));
    }
    contacts::lookup_id_by_addr(&ctx.sql, &addr)
}

pub fn block_contact(ctx: &Context, contact_id: u32, blocked: bool) -> Result<()> {
    if contact_id <= CONTACT_ID_LAST_SPECIAL {
        return Err(Error::BadParameter("cannot block special contact".into()));
    }
    contacts::set_blocked(&ctx.sql, contact_id, blocked)?;
    ctx.emit(Event::ContactsChanged {
        contact_id: Some(contact_id),
    });
    Ok(())
}

/// Flag a contact as fingerprint-verified (secure-join outcome).
pub fn mark_verified(ctx: &Context, contact_id: u32) -> Result<()> {
    contacts::set_verified(&ctx.sql, contact_id, true)?;
    Ok(())
}

/// List known, unblocked contacts sorted by display name.
pub fn get_contacts(ctx: &Context) -> Result<Vec<u32>> {
    contacts::get_all_known(&ctx.sql)
}
