//! Managed blob directory.
//!
//! Attachments are copied into a directory next to the database at send
//! time, so the original file can disappear without breaking the
//! message. Names are deduplicated with a numeric suffix.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};

/// Copy a file into the blob directory; returns the stored name.
pub fn create_from_path(ctx: &Context, src: &Path) -> Result<String> {
    let file_name = src
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::BadParameter(format!("unusable file name: {:?}", src)))?;

    // already managed by us, nothing to copy
    if src.starts_with(&ctx.blobdir) {
        return Ok(file_name.to_string());
    }

    let name = free_name(&ctx.blobdir, file_name);
    std::fs::copy(src, ctx.blobdir.join(&name))?;
    info!("copied {:?} into blobdir as {:?}", src, name);
    Ok(name)
}

/// Absolute path of a stored blob.
pub fn blob_path(ctx: &Context, name: &str) -> PathBuf {
    ctx.blobdir.join(name)
}

fn free_name(blobdir: &Path, wanted: &str) -> String {
    if !blobdir.join(wanted).exists() {
        return wanted.to_string();
    }
    let (stem, ext) = match wanted.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (wanted, None),
    };
    for i in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{}-{}.{}", stem, i, ext),
            None => format!("{}-{}", stem, i),
        };
        if !blobdir.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!()
}
