//! Recognized configuration keys.
//!
//! The configuration surface is a flat string key/value store with a
//! closed key set; unknown keys are rejected so typos cannot silently
//! create dead settings. `sys.*` keys are computed and read-only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Config {
    Addr,
    Displayname,
    Selfstatus,
    MailServer,
    MailUser,
    MailPw,
    MailPort,
    SendServer,
    SendUser,
    SendPw,
    SendPort,
    ServerFlags,
    E2eeEnabled,
    MdnsEnabled,
    InboxWatch,
    SentboxWatch,
    MvboxWatch,
    MvboxMove,
    ShowEmails,
    SaveMimeHeaders,
    /// Set to "1" by a successful configure run.
    Configured,
}

pub const ALL_KEYS: &[Config] = &[
    Config::Addr,
    Config::Displayname,
    Config::Selfstatus,
    Config::MailServer,
    Config::MailUser,
    Config::MailPw,
    Config::MailPort,
    Config::SendServer,
    Config::SendUser,
    Config::SendPw,
    Config::SendPort,
    Config::ServerFlags,
    Config::E2eeEnabled,
    Config::MdnsEnabled,
    Config::InboxWatch,
    Config::SentboxWatch,
    Config::MvboxWatch,
    Config::MvboxMove,
    Config::ShowEmails,
    Config::SaveMimeHeaders,
    Config::Configured,
];

impl Config {
    pub fn as_str(self) -> &'static str {
        match self {
            Config::Addr => "addr",
            Config::Displayname => "displayname",
            Config::Selfstatus => "selfstatus",
            Config::MailServer => "mail_server",
            Config::MailUser => "mail_user",
            Config::MailPw => "mail_pw",
            Config::MailPort => "mail_port",
            Config::SendServer => "send_server",
            Config::SendUser => "send_user",
            Config::SendPw => "send_pw",
            Config::SendPort => "send_port",
            Config::ServerFlags => "server_flags",
            Config::E2eeEnabled => "e2ee_enabled",
            Config::MdnsEnabled => "mdns_enabled",
            Config::InboxWatch => "inbox_watch",
            Config::SentboxWatch => "sentbox_watch",
            Config::MvboxWatch => "mvbox_watch",
            Config::MvboxMove => "mvbox_move",
            Config::ShowEmails => "show_emails",
            Config::SaveMimeHeaders => "save_mime_headers",
            Config::Configured => "configured",
        }
    }

    /// Built-in value used when the key is unset.
    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Config::E2eeEnabled
            | Config::MdnsEnabled
            | Config::InboxWatch
            | Config::SentboxWatch
            | Config::MvboxWatch
            | Config::MvboxMove => Some("1"),
            Config::ShowEmails | Config::ServerFlags | Config::SaveMimeHeaders => Some("0"),
            _ => None,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Config, Error> {
        ALL_KEYS
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::BadParameter(format!("unknown config key: {:?}", s)))
    }
}

/// Computed read-only keys, resolved without touching the store.
pub fn get_sys_config(key: &str) -> Option<String> {
    match key {
        "sys.version" => Some(env!("CARGO_PKG_VERSION").to_string()),
        "sys.msgsize_max_recommended" => Some((24 * 1024 * 1024).to_string()),
        "sys.config_keys" => Some(
            ALL_KEYS
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_key_surface_is_closed() {
        assert!("addr".parse::<Config>().is_ok());
        assert!("mvbox_move".parse::<Config>().is_ok());
        assert!("no_such_key".parse::<Config>().is_err());
        assert!("".parse::<Config>().is_err());
    }

    #[test]
    fn test_defaults_apply_until_set() {
        let t = TestContext::new();
        assert!(t.ctx.get_config_bool(Config::MdnsEnabled).unwrap());
        t.ctx.set_config(Config::MdnsEnabled, Some("0")).unwrap();
        assert!(!t.ctx.get_config_bool(Config::MdnsEnabled).unwrap());
        t.ctx.set_config(Config::MdnsEnabled, None).unwrap();
        assert!(t.ctx.get_config_bool(Config::MdnsEnabled).unwrap());
    }

    #[test]
    fn test_sys_keys() {
        let t = TestContext::new();
        let version = t.ctx.get_config_by_key("sys.version").unwrap().unwrap();
        assert!(!version.is_empty());
        let keys = t.ctx.get_config_by_key("sys.config_keys").unwrap().unwrap();
        assert!(keys.split(' ').any(|k| k == "addr"));
        // computed keys are read-only, unknown keys are rejected
        assert!(t.ctx.get_config_by_key("sys.nope").is_err());
    }
}
