//! Signal dispatch against live processes.
//!
//! A dispatch never trusts an earlier snapshot: the target pid is looked up
//! again right before delivery and the signal is only sent if the process is
//! still there, is the incarnation the caller expects, is not protected, and
//! the caller has the rights to signal it. Delivery is fire-and-forget; the
//! call returns once the kernel accepted the signal. Nothing is retried.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::collector::ProcessSource;
use crate::config::SignalConfig;
use crate::error::{Error, Result};
use crate::types::{ProcessRecord, current_epoch_millis};

const AUDIT_TARGET: &str = "procpanel_audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Signal {
    Term,
    Kill,
    Hup,
    Int,
    Quit,
    Usr1,
    Usr2,
    Stop,
    Cont,
}

impl Signal {
    pub const ALL: [Signal; 9] = [
        Self::Term,
        Self::Kill,
        Self::Hup,
        Self::Int,
        Self::Quit,
        Self::Usr1,
        Self::Usr2,
        Self::Stop,
        Self::Cont,
    ];

    /// Conventional name, e.g. `SIGTERM`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Stop => "SIGSTOP",
            Self::Cont => "SIGCONT",
        }
    }

    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
            Self::Stop => libc::SIGSTOP,
            Self::Cont => libc::SIGCONT,
        }
    }

    /// Only SIGCONT may be sent to protected processes.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Cont)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts `TERM`, `SIGTERM`, `sigterm`, ...; numbers are not accepted.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(Self::Term),
            "KILL" => Ok(Self::Kill),
            "HUP" => Ok(Self::Hup),
            "INT" => Ok(Self::Int),
            "QUIT" => Ok(Self::Quit),
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            "STOP" => Ok(Self::Stop),
            "CONT" => Ok(Self::Cont),
            _ => Err(Error::UnsupportedSignal {
                name: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Signal {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Signal> for String {
    fn from(signal: Signal) -> Self {
        signal.name().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub pid: u32,
    pub signal: Signal,
    /// Start time (epoch seconds) the caller saw for this pid. When set, a
    /// live process with a different start time is treated as gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_start_time: Option<u64>,
}

impl SignalRequest {
    pub fn new(pid: u32, signal: Signal) -> Self {
        Self {
            pid,
            signal,
            expected_start_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalAck {
    pub dispatch_id: Uuid,
    pub pid: u32,
    pub signal: Signal,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub dispatched_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Requested,
    Resolved,
    Validated,
    Dispatched,
    Acknowledged,
    Failed,
}

/// Delivery of a signal to one pid.
pub trait SignalSender: Send + Sync {
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Delivers through kill(2).
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcSender;

impl SignalSender for LibcSender {
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()> {
        // 0 and negative values address process groups
        let raw = libc::pid_t::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESRCH))?;
        // SAFETY: kill(2) only reads its integer arguments.
        let rc = unsafe { libc::kill(raw, signal.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Identity the dispatcher acts under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub cap_kill: bool,
    pub pid: u32,
}

impl Credentials {
    pub fn current() -> Self {
        // SAFETY: getuid(2) and geteuid(2) cannot fail and have no preconditions.
        let (uid, euid) = unsafe { (libc::getuid(), libc::geteuid()) };
        let cap_kill = caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_KILL)
            .unwrap_or_else(|err| {
                debug!("[signal] capability query failed: {err}");
                false
            });
        Self {
            uid,
            euid,
            cap_kill,
            pid: std::process::id(),
        }
    }

    pub fn privileged(&self) -> bool {
        self.euid == 0 || self.cap_kill
    }

    /// kill(2)'s rule for unprivileged senders: the sender's real or
    /// effective uid equals the target's real or saved set-user-id.
    pub fn may_signal(&self, target_uid: u32, target_saved_uid: Option<u32>) -> bool {
        let sender = [self.uid, self.euid];
        std::iter::once(target_uid)
            .chain(target_saved_uid)
            .any(|id| sender.contains(&id))
    }
}

struct Trace {
    id: Uuid,
    pid: u32,
    signal: Signal,
    state: DispatchState,
}

impl Trace {
    fn new(pid: u32, signal: Signal) -> Self {
        let trace = Self {
            id: Uuid::new_v4(),
            pid,
            signal,
            state: DispatchState::Requested,
        };
        debug!(
            "[signal] {} requested {} for pid {}",
            trace.id, signal, pid
        );
        trace
    }

    fn advance(&mut self, next: DispatchState) {
        debug!(
            "[signal] {} {} pid={} {:?} -> {:?}",
            self.id, self.signal, self.pid, self.state, next
        );
        self.state = next;
    }
}

#[derive(Clone)]
pub struct SignalDispatcher {
    source: Arc<dyn ProcessSource>,
    sender: Arc<dyn SignalSender>,
    config: SignalConfig,
    credentials: Credentials,
    audit: bool,
}

impl SignalDispatcher {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        sender: Arc<dyn SignalSender>,
        config: SignalConfig,
        credentials: Credentials,
    ) -> Self {
        Self {
            source,
            sender,
            config,
            credentials,
            audit: true,
        }
    }

    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    pub fn kill_signal(&self) -> Signal {
        self.config.kill_signal
    }

    /// Parse `name` and dispatch. An unknown name fails before the process
    /// table is touched.
    pub fn dispatch_named(
        &self,
        pid: u32,
        name: &str,
        expected_start_time: Option<u64>,
    ) -> Result<SignalAck> {
        let signal = name.parse::<Signal>().inspect_err(|_| {
            info!("[signal] rejected unsupported signal {name:?} for pid {pid}");
        })?;
        self.dispatch(&SignalRequest {
            pid,
            signal,
            expected_start_time,
        })
    }

    /// `kill` is the configured kill signal through the same path.
    pub fn kill(&self, pid: u32) -> Result<SignalAck> {
        self.dispatch(&SignalRequest::new(pid, self.config.kill_signal))
    }

    pub fn dispatch(&self, req: &SignalRequest) -> Result<SignalAck> {
        let mut trace = Trace::new(req.pid, req.signal);
        match self.run(req, &mut trace) {
            Ok(ack) => {
                trace.advance(DispatchState::Acknowledged);
                if self.audit {
                    warn!(
                        target: AUDIT_TARGET,
                        "SIGNAL {} {} pid={} name={} euid={}",
                        ack.dispatch_id, ack.signal, ack.pid, ack.name, self.credentials.euid
                    );
                }
                Ok(ack)
            }
            Err(err) => {
                let reached = trace.state;
                trace.advance(DispatchState::Failed);
                if self.audit {
                    info!(
                        target: AUDIT_TARGET,
                        "REFUSED {} {} pid={} after={:?} reason={}",
                        trace.id, req.signal, req.pid, reached, err
                    );
                }
                Err(err)
            }
        }
    }

    fn run(&self, req: &SignalRequest, trace: &mut Trace) -> Result<SignalAck> {
        let pid = req.pid;
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(Error::NotFound { pid });
        }

        let record = self.source.lookup(pid)?.ok_or(Error::NotFound { pid })?;
        if let Some(expected) = req.expected_start_time
            && record.start_time != expected
        {
            debug!(
                "[signal] pid {} reused: started at {} not {}",
                pid, record.start_time, expected
            );
            return Err(Error::NotFound { pid });
        }
        trace.advance(DispatchState::Resolved);

        self.check_allowed(&record, req.signal)?;
        trace.advance(DispatchState::Validated);

        match self.sender.send(pid, req.signal) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                return Err(Error::NotFound { pid });
            }
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                return Err(Error::permission(pid, "operation not permitted by the kernel"));
            }
            Err(source) => {
                return Err(Error::SignalFailed {
                    pid,
                    signal: req.signal.name(),
                    source,
                });
            }
        }
        trace.advance(DispatchState::Dispatched);

        Ok(SignalAck {
            dispatch_id: trace.id,
            pid,
            signal: req.signal,
            name: record.name,
            dispatched_at: current_epoch_millis(),
        })
    }

    fn check_allowed(&self, record: &ProcessRecord, signal: Signal) -> Result<()> {
        let pid = record.pid;
        if !signal.is_benign() {
            if pid == 1 {
                return Err(Error::permission(pid, "init is protected"));
            }
            if self.config.protect_self && pid == self.credentials.pid {
                return Err(Error::permission(pid, "refusing to signal this service"));
            }
            if self.config.protected_pids.contains(&pid) {
                return Err(Error::permission(pid, "pid is on the protected list"));
            }
        }

        if self.credentials.privileged() {
            return Ok(());
        }
        // unknown owner: leave the decision to the kernel
        match record.uid {
            Some(owner) if !self.credentials.may_signal(owner, self.source.saved_uid(pid)) => {
                Err(Error::permission(
                    pid,
                    format!(
                        "owned by uid {owner}, caller uid {}/{} lacks CAP_KILL",
                        self.credentials.uid, self.credentials.euid
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::StaticSource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(u32, Signal)>>,
        fail_with: Option<i32>,
    }

    impl SignalSender for RecordingSender {
        fn send(&self, pid: u32, signal: Signal) -> io::Result<()> {
            if let Some(errno) = self.fail_with {
                return Err(io::Error::from_raw_os_error(errno));
            }
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(u32, Signal)> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn rec(pid: u32, uid: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            parent_pid: Some(1),
            name: format!("svc{pid}"),
            uid: Some(uid),
            start_time: 1_700_000_000 + u64::from(pid),
            ..Default::default()
        }
    }

    const USER: Credentials = Credentials {
        uid: 1000,
        euid: 1000,
        cap_kill: false,
        pid: 4242,
    };

    fn setup(
        creds: Credentials,
        config: SignalConfig,
    ) -> (Arc<StaticSource>, Arc<RecordingSender>, SignalDispatcher) {
        let source = Arc::new(StaticSource::new(vec![
            rec(1, 0),
            rec(200, 1000),
            rec(300, 0),
            rec(4242, 1000),
        ]));
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = SignalDispatcher::new(source.clone(), sender.clone(), config, creds);
        (source, sender, dispatcher)
    }

    #[test]
    fn parses_signal_names() {
        assert_eq!("TERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("sigkill".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!(" SIGUSR2 ".parse::<Signal>().unwrap(), Signal::Usr2);
        for signal in Signal::ALL {
            assert_eq!(signal.name().parse::<Signal>().unwrap(), signal);
        }
        for bad in ["9", "SIGWINCH", "", "TERMINATE"] {
            assert!(matches!(
                bad.parse::<Signal>(),
                Err(Error::UnsupportedSignal { .. })
            ));
        }
    }

    #[test]
    fn signal_serializes_by_name() {
        assert_eq!(serde_json::to_string(&Signal::Hup).unwrap(), "\"SIGHUP\"");
        let req: SignalRequest =
            serde_json::from_str(r#"{"pid":12,"signal":"term"}"#).unwrap();
        assert_eq!(req, SignalRequest::new(12, Signal::Term));
        assert!(serde_json::from_str::<SignalRequest>(r#"{"pid":12,"signal":"WINCH"}"#).is_err());
    }

    #[test]
    fn delivers_to_own_process() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        let ack = dispatcher.dispatch_named(200, "SIGHUP", None).unwrap();
        assert_eq!(ack.pid, 200);
        assert_eq!(ack.signal, Signal::Hup);
        assert_eq!(ack.name, "svc200");
        assert_eq!(sender.sent(), vec![(200, Signal::Hup)]);
    }

    #[test]
    fn missing_pid_is_not_found() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        assert!(matches!(
            dispatcher.dispatch_named(9999, "TERM", None),
            Err(Error::NotFound { pid: 9999 })
        ));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn unsupported_signal_fails_before_lookup() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        let err = dispatcher.dispatch_named(9999, "SIGWINCH", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSignal { ref name } if name == "SIGWINCH"));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn never_acts_on_a_pid_that_disappeared() {
        let (source, sender, dispatcher) = setup(USER, SignalConfig::default());
        let stale = source.snapshot().unwrap();
        assert!(stale.contains(200));

        source.remove(200);
        assert!(matches!(
            dispatcher.kill(200),
            Err(Error::NotFound { pid: 200 })
        ));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn reused_pid_is_treated_as_gone() {
        let (source, sender, dispatcher) = setup(USER, SignalConfig::default());
        let original = source.lookup(200).unwrap().unwrap();

        let mut successor = rec(200, 1000);
        successor.start_time = original.start_time + 30;
        source.insert(successor);

        let req = SignalRequest {
            expected_start_time: Some(original.start_time),
            ..SignalRequest::new(200, Signal::Term)
        };
        assert!(matches!(
            dispatcher.dispatch(&req),
            Err(Error::NotFound { pid: 200 })
        ));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn other_users_process_needs_privilege() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        assert!(matches!(
            dispatcher.kill(300),
            Err(Error::Permission { pid: 300, .. })
        ));
        assert!(sender.sent().is_empty());

        let with_cap = Credentials {
            cap_kill: true,
            ..USER
        };
        let (_, sender, dispatcher) = setup(with_cap, SignalConfig::default());
        dispatcher.kill(300).unwrap();
        assert_eq!(sender.sent(), vec![(300, Signal::Kill)]);
    }

    #[test]
    fn protected_pids_only_accept_cont() {
        let root = Credentials {
            uid: 0,
            euid: 0,
            cap_kill: true,
            pid: 4242,
        };
        let config = SignalConfig {
            protected_pids: vec![300],
            ..SignalConfig::default()
        };
        let (_, sender, dispatcher) = setup(root, config);

        for pid in [1, 300, 4242] {
            assert!(
                matches!(dispatcher.kill(pid), Err(Error::Permission { .. })),
                "pid {pid}"
            );
        }
        dispatcher.dispatch(&SignalRequest::new(300, Signal::Cont)).unwrap();
        assert_eq!(sender.sent(), vec![(300, Signal::Cont)]);
    }

    #[test]
    fn self_protection_can_be_disabled() {
        let config = SignalConfig {
            protect_self: false,
            ..SignalConfig::default()
        };
        let (_, sender, dispatcher) = setup(USER, config);
        dispatcher.dispatch(&SignalRequest::new(4242, Signal::Usr1)).unwrap();
        assert_eq!(sender.sent(), vec![(4242, Signal::Usr1)]);
    }

    #[test]
    fn kill_defaults_to_sigkill() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        assert_eq!(dispatcher.kill_signal(), Signal::Kill);
        let ack = dispatcher.kill(200).unwrap();
        assert_eq!(ack.signal, Signal::Kill);
        assert_eq!(sender.sent(), vec![(200, Signal::Kill)]);
    }

    #[test]
    fn kill_uses_configured_signal() {
        let config = SignalConfig {
            kill_signal: Signal::Term,
            ..SignalConfig::default()
        };
        let (_, sender, dispatcher) = setup(USER, config);
        let ack = dispatcher.kill(200).unwrap();
        assert_eq!(ack.signal, Signal::Term);
        assert_eq!(sender.sent(), vec![(200, Signal::Term)]);
    }

    /// StaticSource with a fixed saved set-user-id for every pid.
    struct SavedUidSource {
        inner: StaticSource,
        saved: u32,
    }

    impl ProcessSource for SavedUidSource {
        fn snapshot(&self) -> Result<crate::types::Snapshot> {
            self.inner.snapshot()
        }

        fn lookup(&self, pid: u32) -> Result<Option<ProcessRecord>> {
            self.inner.lookup(pid)
        }

        fn saved_uid(&self, _pid: u32) -> Option<u32> {
            Some(self.saved)
        }
    }

    #[test]
    fn ownership_follows_kernel_uid_rule() {
        let setuid_caller = Credentials {
            uid: 1000,
            euid: 2000,
            cap_kill: false,
            pid: 4242,
        };
        // real uid of the caller matches the target's real uid
        let (_, sender, dispatcher) = setup(setuid_caller, SignalConfig::default());
        dispatcher.dispatch(&SignalRequest::new(200, Signal::Hup)).unwrap();
        assert_eq!(sender.sent(), vec![(200, Signal::Hup)]);
        assert!(matches!(
            dispatcher.dispatch(&SignalRequest::new(300, Signal::Hup)),
            Err(Error::Permission { pid: 300, .. })
        ));

        // target 300 runs as root but kept the caller's uid as its saved id
        let source: Arc<dyn ProcessSource> = Arc::new(SavedUidSource {
            inner: StaticSource::new(vec![rec(300, 0)]),
            saved: 1000,
        });
        let sender = Arc::new(RecordingSender::default());
        let dispatcher =
            SignalDispatcher::new(source, sender.clone(), SignalConfig::default(), USER);
        dispatcher.dispatch(&SignalRequest::new(300, Signal::Usr1)).unwrap();
        assert_eq!(sender.sent(), vec![(300, Signal::Usr1)]);
    }

    #[test]
    fn may_signal_matches_any_id_pair() {
        assert!(USER.may_signal(1000, None));
        assert!(USER.may_signal(0, Some(1000)));
        assert!(!USER.may_signal(0, None));
        assert!(!USER.may_signal(0, Some(33)));
    }

    #[test]
    fn kernel_errors_map_to_taxonomy() {
        let source: Arc<dyn ProcessSource> = Arc::new(StaticSource::new(vec![rec(200, 1000)]));
        let cases = [
            (libc::ESRCH, "not_found"),
            (libc::EPERM, "permission_denied"),
            (libc::EINVAL, "signal_failed"),
        ];
        for (errno, kind) in cases {
            let sender = Arc::new(RecordingSender {
                fail_with: Some(errno),
                ..Default::default()
            });
            let dispatcher =
                SignalDispatcher::new(source.clone(), sender, SignalConfig::default(), USER);
            assert_eq!(dispatcher.kill(200).unwrap_err().kind(), kind);
        }
    }

    #[test]
    fn rejects_pids_outside_the_kill_range() {
        let (_, sender, dispatcher) = setup(USER, SignalConfig::default());
        assert!(matches!(dispatcher.kill(0), Err(Error::NotFound { pid: 0 })));
        assert!(matches!(
            dispatcher.kill(u32::MAX),
            Err(Error::NotFound { .. })
        ));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn libc_sender_refuses_group_pids() {
        let err = LibcSender.send(0, Signal::Cont).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }

    #[test]
    fn libc_sender_delivers_cont_to_self() {
        LibcSender.send(std::process::id(), Signal::Cont).unwrap();
    }
}
