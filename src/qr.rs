//! QR payload classification.
//!
//! `check_qr` never panics and never fails: anything it cannot make
//! sense of comes back as [`Qr::Text`], syntactically broken invite
//! payloads as [`Qr::Error`].

use tracing::info;

use crate::contact::{self, Origin};
use crate::context::Context;
use crate::error::Result;
use crate::tools::may_be_valid_addr;

/// Classified QR payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Qr {
    /// Secure-join invite for verifying a contact.
    AskVerifyContact {
        contact_id: u32,
        fingerprint: String,
        invitenumber: String,
        auth: String,
    },
    /// Secure-join invite into a verified group.
    AskVerifyGroup {
        grpname: String,
        grpid: String,
        contact_id: u32,
        fingerprint: String,
        invitenumber: String,
        auth: String,
    },
    /// Fingerprint matches the known key of this contact.
    FprOk { contact_id: u32 },
    /// Fingerprint differs from the known key.
    FprMismatch { contact_id: Option<u32> },
    /// A bare fingerprint without address context.
    FprWithoutAddr { fingerprint: String },
    /// A plain email address (or mailto:).
    Addr { contact_id: u32 },
    /// Unclassifiable free text.
    Text(String),
    Url(String),
    /// Recognizably an invite, but malformed.
    Error(String),
}

impl Qr {
    /// Stable numeric class, usable across FFI-ish boundaries.
    pub fn class(&self) -> u32 {
        match self {
            Qr::AskVerifyContact { .. } => 200,
            Qr::AskVerifyGroup { .. } => 202,
            Qr::FprOk { .. } => 210,
            Qr::FprMismatch { .. } => 220,
            Qr::FprWithoutAddr { .. } => 230,
            Qr::Addr { .. } => 320,
            Qr::Text(_) => 330,
            Qr::Url(_) => 332,
            Qr::Error(_) => 400,
        }
    }
}

const OPENPGP4FPR_SCHEME: &str = "OPENPGP4FPR:";

/// Classify a scanned payload.
pub fn check_qr(ctx: &Context, payload: &str) -> Qr {
    let payload = payload.trim();
    info!("classifying qr payload ({} bytes)", payload.len());

    if payload.len() >= OPENPGP4FPR_SCHEME.len()
        && payload[..OPENPGP4FPR_SCHEME.len()].eq_ignore_ascii_case(OPENPGP4FPR_SCHEME)
    {
        return check_openpgp4fpr(ctx, &payload[OPENPGP4FPR_SCHEME.len()..])
            .unwrap_or_else(|e| Qr::Error(e.to_string()));
    }

    if let Some(addr) = payload.strip_prefix("mailto:") {
        let addr = addr.split('?').next().unwrap_or(addr);
        return classify_addr(ctx, addr).unwrap_or_else(|e| Qr::Error(e.to_string()));
    }

    if payload.starts_with("http://") || payload.starts_with("https://") {
        return Qr::Url(payload.to_string());
    }

    if may_be_valid_addr(payload) {
        return classify_addr(ctx, payload).unwrap_or_else(|e| Qr::Error(e.to_string()));
    }

    Qr::Text(payload.to_string())
}

fn check_openpgp4fpr(ctx: &Context, rest: &str) -> Result<Qr> {
    let (fpr_part, query) = match rest.split_once('#') {
        Some((f, q)) => (f, Some(q)),
        None => (rest, None),
    };

    let fingerprint = normalize_fingerprint(fpr_part);
    if fingerprint.len() != 40 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(Qr::Error(format!("bad fingerprint: {:?}", fpr_part)));
    }

    let mut addr = None;
    let mut grpname = None;
    let mut grpid = None;
    let mut invitenumber = None;
    let mut auth = None;
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "a" => addr = Some(value.into_owned()),
                "g" => grpname = Some(value.into_owned()),
                "x" => grpid = Some(value.into_owned()),
                "i" => invitenumber = Some(value.into_owned()),
                "s" => auth = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    let Some(addr) = addr else {
        return Ok(Qr::FprWithoutAddr { fingerprint });
    };
    if !may_be_valid_addr(&addr) {
        return Ok(Qr::Error(format!("bad address in invite: {:?}", addr)));
    }

    match (invitenumber, auth) {
        (Some(invitenumber), Some(auth)) => {
            let (contact_id, _) =
                contact::add_or_lookup(ctx, "", &addr, Origin::IncomingUnknown)?;
            match (grpname, grpid) {
                (Some(grpname), Some(grpid)) => Ok(Qr::AskVerifyGroup {
                    grpname,
                    grpid,
                    contact_id,
                    fingerprint,
                    invitenumber,
                    auth,
                }),
                (None, None) => Ok(Qr::AskVerifyContact {
                    contact_id,
                    fingerprint,
                    invitenumber,
                    auth,
                }),
                _ => Ok(Qr::Error("incomplete group invite".to_string())),
            }
        }
        (None, None) => {
            // fingerprint comparison against the known key
            let contact_id = contact::lookup_id_by_addr(ctx, &addr)?;
            match ctx.keys.peer_fingerprint(&addr) {
                Some(known) if known == fingerprint => {
                    let (contact_id, _) =
                        contact::add_or_lookup(ctx, "", &addr, Origin::IncomingUnknown)?;
                    Ok(Qr::FprOk { contact_id })
                }
                Some(_) => Ok(Qr::FprMismatch { contact_id }),
                None => Ok(Qr::FprMismatch { contact_id }),
            }
        }
        _ => Ok(Qr::Error("incomplete invite".to_string())),
    }
}

fn classify_addr(ctx: &Context, addr: &str) -> Result<Qr> {
    if !may_be_valid_addr(addr) {
        return Ok(Qr::Error(format!("bad address: {:?}", addr)));
    }
    let (contact_id, _) = contact::add_or_lookup(ctx, "", addr, Origin::IncomingUnknown)?;
    Ok(Qr::Addr { contact_id })
}

fn normalize_fingerprint(fpr: &str) -> String {
    fpr.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
