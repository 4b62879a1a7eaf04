//! Small shared helpers: wall clock, address normalization, random ids.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Current unix time in seconds.
pub fn time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Normalize an email address for the one-row-per-address invariant.
pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim().to_lowercase();

    let Some((local, domain)) = addr.split_once('@') else {
        return addr;
    };

    // Strip +tag subaddressing so replies and originals collapse into
    // the same contact row.
    let local = match local.split_once('+') {
        Some((base, _)) => base,
        None => local,
    };

    format!("{}@{}", local, domain)
}

/// Loose validity check; full grammar lives in the MIME layer.
pub fn may_be_valid_addr(addr: &str) -> bool {
    let addr = addr.trim();
    if addr.is_empty() || addr.contains(char::is_whitespace) {
        return false;
    }
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

/// Random token for secure-join invites and similar one-shot secrets.
pub fn create_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Mint an RFC 5322 Message-ID for an outgoing message.
pub fn create_rfc724_mid(self_addr: &str) -> String {
    let rand_part: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let domain = self_addr.split_once('@').map(|(_, d)| d).unwrap_or("local");
    format!("Mr.{}.{}@{}", rand_part, time(), domain)
}

/// Clamp a remote-claimed send timestamp into the sane past.
///
/// Senders with broken clocks must not push their messages into the
/// future of the chat.
pub fn clamp_sent_timestamp(ts_sent: i64) -> i64 {
    let now = time();
    if ts_sent > now {
        now
    } else {
        ts_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("Bob@Example.ORG "), "bob@example.org");
        assert_eq!(normalize_addr("bob+tag@example.org"), "bob@example.org");
        assert_eq!(normalize_addr("not-an-addr"), "not-an-addr");
    }

    #[test]
    fn test_may_be_valid_addr() {
        assert!(may_be_valid_addr("bob@example.org"));
        assert!(!may_be_valid_addr("bob@localhost"));
        assert!(!may_be_valid_addr("bob"));
        assert!(!may_be_valid_addr(""));
        assert!(!may_be_valid_addr("b ob@example.org"));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(create_token(), create_token());
    }

    #[test]
    fn test_rfc724_mid_uses_self_domain() {
        let mid = create_rfc724_mid("alice@example.org");
        assert!(mid.ends_with("@example.org"));
    }

    #[test]
    fn test_clamp_sent_timestamp() {
        let now = time();
        assert_eq!(clamp_sent_timestamp(now - 100), now - 100);
        assert!(clamp_sent_timestamp(now + 100_000) <= time());
    }
}
