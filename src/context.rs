//! The `Context`: one opened account.
//!
//! Owns the store, the event channel, the per-lane wakeup state and the
//! injected transports. All entry points take `&self` and are safe to
//! call from any thread; the embedder supplies one thread per worker
//! lane and drives the `perform/fetch/idle` loops on it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::events::{Event, EventEmitter, Events};
use crate::securejoin::JoinerSession;
use crate::store::{config as config_store, Sql};
use crate::tools::normalize_addr;
use crate::transport::{ImapTransport, KeyVerifier, SmtpTransport};
use crate::worker::Lane;

/// Tunables for the job queue retry policy.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// First retry delay, seconds.
    pub backoff_base: i64,
    /// Upper bound for a single retry delay, seconds.
    pub backoff_cap: i64,
    /// A job failing this often is dropped for good.
    pub max_tries: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            backoff_base: 60,
            backoff_cap: 24 * 3600,
            max_tries: 17,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LaneFlags {
    /// Edge-triggered wakeup; set while not idling makes the next idle
    /// return immediately, so interrupts are never lost.
    pub interrupted: bool,
    /// The next perform pass should retry backoff-delayed jobs at once.
    pub probe_network: bool,
}

#[derive(Debug, Default)]
pub(crate) struct LaneState {
    flags: Mutex<LaneFlags>,
    cond: Condvar,
}

impl LaneState {
    pub fn interrupt(&self, probe_network: bool) {
        let mut flags = self.flags.lock().unwrap();
        flags.interrupted = true;
        flags.probe_network |= probe_network;
        self.cond.notify_all();
    }

    /// Block until interrupted or `timeout` elapses; consumes the
    /// interrupt flag.
    pub fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock().unwrap();
        while !flags.interrupted {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(flags, deadline - now).unwrap();
            flags = guard;
        }
        flags.interrupted = false;
    }

    /// Consume the probe-network flag for the next perform pass.
    pub fn take_probe_network(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        std::mem::take(&mut flags.probe_network)
    }
}

/// Cooperative cancellation token for the single ongoing process
/// (configure, import/export).
pub type CancelFlag = Arc<AtomicBool>;

pub struct Context {
    pub sql: Sql,
    pub blobdir: PathBuf,
    pub job_cfg: JobConfig,

    pub(crate) events: Events,
    pub(crate) imap: Arc<dyn ImapTransport>,
    pub(crate) smtp: Arc<dyn SmtpTransport>,
    pub(crate) keys: Arc<dyn KeyVerifier>,

    pub(crate) lanes: [LaneState; 4],

    /// At most one configure/imex at a time.
    ongoing: Mutex<Option<CancelFlag>>,

    /// Joiner-side secure-join session; the condvar wakes the blocked
    /// `join_securejoin` call.
    pub(crate) joiner: Mutex<Option<JoinerSession>>,
    pub(crate) joiner_cond: Condvar,
    /// Last emitted inviter progress per contact, to keep the reported
    /// sequence strictly monotonic.
    pub(crate) inviter_progress: Mutex<BTreeMap<u32, u32>>,

    /// Whether the previous network attempt already failed; gates the
    /// `first` flag of [`Event::ErrorNetwork`].
    network_errored: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dbfile", &self.sql.dbfile())
            .field("blobdir", &self.blobdir)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Open (or create) the account database at `dbfile`. The blob
    /// directory is created next to it.
    pub fn new(
        dbfile: &Path,
        imap: Arc<dyn ImapTransport>,
        smtp: Arc<dyn SmtpTransport>,
        keys: Arc<dyn KeyVerifier>,
    ) -> Result<Self> {
        let sql = Sql::open(dbfile)?;
        let mut blobdir = dbfile.as_os_str().to_os_string();
        blobdir.push("-blobs");
        let blobdir = PathBuf::from(blobdir);
        std::fs::create_dir_all(&blobdir)?;
        info!("opened context at {}", dbfile.display());
        Ok(Self {
            sql,
            blobdir,
            job_cfg: JobConfig::default(),
            events: Events::new(),
            imap,
            smtp,
            keys,
            lanes: Default::default(),
            ongoing: Mutex::new(None),
            joiner: Mutex::new(None),
            joiner_cond: Condvar::new(),
            inviter_progress: Mutex::new(BTreeMap::new()),
            network_errored: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// Consumer handle for the embedding application.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.emitter()
    }

    pub(crate) fn lane(&self, lane: Lane) -> &LaneState {
        &self.lanes[lane as usize]
    }

    // --- configuration -------------------------------------------------

    pub fn set_config(&self, key: Config, value: Option<&str>) -> Result<()> {
        let value = match (key, value) {
            (Config::Addr, Some(addr)) => {
                if !crate::tools::may_be_valid_addr(addr) {
                    return Err(Error::BadParameter(format!("bad address: {:?}", addr)));
                }
                Some(normalize_addr(addr))
            }
            (_, v) => v.map(|v| v.to_string()),
        };
        config_store::set(&self.sql, key.as_str(), value.as_deref())
    }

    /// Stored value, falling back to the built-in default.
    pub fn get_config(&self, key: Config) -> Result<Option<String>> {
        Ok(config_store::get(&self.sql, key.as_str())?
            .or_else(|| key.default_value().map(|v| v.to_string())))
    }

    /// String-keyed lookup covering both stored and computed `sys.*`
    /// keys; unknown keys are rejected.
    pub fn get_config_by_key(&self, key: &str) -> Result<Option<String>> {
        if key.starts_with("sys.") {
            return config::get_sys_config(key)
                .map(Some)
                .ok_or_else(|| Error::BadParameter(format!("unknown config key: {:?}", key)));
        }
        self.get_config(key.parse::<Config>()?)
    }

    pub fn get_config_str(&self, key: Config) -> Result<Option<String>> {
        self.get_config(key)
    }

    pub fn get_config_bool(&self, key: Config) -> Result<bool> {
        Ok(self.get_config(key)?.map(|v| v == "1").unwrap_or(false))
    }

    pub fn get_config_u32(&self, key: Config) -> Result<u32> {
        Ok(self
            .get_config(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn is_configured(&self) -> Result<bool> {
        self.get_config_bool(Config::Configured)
    }

    pub fn self_addr(&self) -> Result<String> {
        self.get_config(Config::Addr)?
            .ok_or_else(|| Error::Config("no address configured".into()))
    }

    pub fn self_addr_normalized(&self) -> Result<String> {
        Ok(normalize_addr(&self.self_addr()?))
    }

    // --- ongoing process ----------------------------------------------

    /// Claim the single ongoing-process slot. Fails with
    /// [`Error::Ongoing`] while another process holds it.
    pub(crate) fn alloc_ongoing(&self) -> Result<CancelFlag> {
        let mut slot = self.ongoing.lock().unwrap();
        if slot.is_some() {
            return Err(Error::Ongoing);
        }
        let flag: CancelFlag = Arc::new(AtomicBool::new(false));
        *slot = Some(flag.clone());
        Ok(flag)
    }

    pub(crate) fn free_ongoing(&self) {
        *self.ongoing.lock().unwrap() = None;
    }

    /// Ask the running ongoing process (if any) to stop. The process
    /// notices at its next cancellation point and reports `Cancelled`.
    pub fn stop_ongoing(&self) {
        if let Some(flag) = self.ongoing.lock().unwrap().as_ref() {
            flag.store(true, Ordering::Relaxed);
            info!("signaled ongoing process to stop");
        }
    }

    // --- network state -------------------------------------------------

    /// True exactly once per error sequence; resets on success.
    pub(crate) fn note_network_error(&self) -> bool {
        !self.network_errored.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn note_network_ok(&self) {
        self.network_errored.store(false, Ordering::Relaxed);
    }
}
