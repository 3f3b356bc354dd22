//! Process snapshot collection.
//!
//! Every call reads the OS process table afresh; nothing is cached between
//! calls because process state goes stale within seconds. Fields that cannot
//! be read (another user's `/proc/<pid>/exe`, a process exiting mid-read) are
//! listed in `unknown_fields` instead of failing the whole collection.

use log::{debug, warn};
use procfs::ProcError;
use procfs::process::{FDTarget, Process as ProcfsProcess};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus as OsStatus, ProcessesToUpdate, System,
    ThreadKind, UpdateKind, Users,
};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::types::{
    Connection, CpuTimes, DetailExtras, IdSet, ProcessRecord, ProcessStatus, RecordField,
    Snapshot,
};

/// Read access to a process table.
pub trait ProcessSource: Send + Sync {
    /// Capture every visible process.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Authoritative check for a single pid at call time.
    fn lookup(&self, pid: u32) -> Result<Option<ProcessRecord>>;

    /// On-demand details that are too costly to read for every process.
    /// Fails with `NotFound` once `record.pid` names a different process
    /// than the one `record` was captured from.
    fn detail_extras(&self, _record: &ProcessRecord) -> Result<DetailExtras> {
        Ok(DetailExtras::default())
    }

    /// Saved set-user-id of `pid`, when the source can read it.
    fn saved_uid(&self, _pid: u32) -> Option<u32> {
        None
    }
}

/// `ProcessSource` backed by the live OS through `sysinfo` and `procfs`.
#[derive(Debug, Clone, Default)]
pub struct SystemSource {
    cpu_sample: Option<Duration>,
}

impl SystemSource {
    pub fn new(cfg: &CollectorConfig) -> Self {
        let cpu_sample = (cfg.cpu_sample_ms > 0).then(|| {
            Duration::from_millis(cfg.cpu_sample_ms).max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)
        });
        Self { cpu_sample }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_disk_usage()
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_exe(UpdateKind::OnlyIfNotSet)
    }

    /// Returns whether the CPU figures are a sampled delta.
    fn refresh(&self, sys: &mut System, target: Option<Pid>, sample: bool) -> bool {
        let pids: Vec<Pid> = target.into_iter().collect();
        sys.refresh_processes_specifics(to_update(&pids), true, Self::refresh_kind());
        match self.cpu_sample {
            Some(window) if sample => {
                // cpu_usage() is a delta between two refreshes
                std::thread::sleep(window);
                sys.refresh_processes_specifics(to_update(&pids), true, Self::refresh_kind());
                true
            }
            _ => false,
        }
    }

    /// `users` is `None` when owner names are not needed; the username is
    /// then left unset without being reported unreadable.
    fn to_record(
        &self,
        pid: Pid,
        process: &Process,
        users: Option<&Users>,
        sampled: bool,
    ) -> ProcessRecord {
        let mut unknown = Vec::new();
        let kernel_thread = matches!(process.thread_kind(), Some(ThreadKind::Kernel));

        let uid = process.user_id().map(|uid| **uid);
        let username = match (process.user_id(), users) {
            (Some(uid), Some(users)) => Some(
                users
                    .get_user_by_id(uid)
                    .map(|user| user.name().to_string())
                    .unwrap_or_else(|| (**uid).to_string()),
            ),
            (None, Some(_)) => {
                unknown.push(RecordField::Username);
                None
            }
            (_, None) => None,
        };

        let command = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if command.is_empty() && !kernel_thread {
            unknown.push(RecordField::Command);
        }

        let exe = process.exe().map(|p| p.display().to_string());
        if exe.is_none() && !kernel_thread {
            unknown.push(RecordField::Exe);
        }

        let cpu_percent = if sampled {
            process.cpu_usage()
        } else {
            lifetime_cpu_percent(process.accumulated_cpu_time(), process.run_time())
        };

        let disk = process.disk_usage();
        let pid = pid.as_u32();

        ProcessRecord {
            pid,
            parent_pid: process.parent().map(|p| p.as_u32()),
            name: process.name().to_string_lossy().into_owned(),
            command,
            exe,
            username,
            uid,
            status: map_status(process.status()),
            cpu_percent,
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            start_time: process.start_time(),
            disk_read_bytes: disk.total_read_bytes,
            disk_written_bytes: disk.total_written_bytes,
            unknown_fields: unknown,
        }
    }
}

fn ensure_supported() -> Result<()> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Ok(())
    } else {
        Err(Error::Collection(
            "process enumeration is not supported on this platform".to_string(),
        ))
    }
}

impl ProcessSource for SystemSource {
    fn snapshot(&self) -> Result<Snapshot> {
        ensure_supported()?;

        let mut sys = System::new();
        let sampled = self.refresh(&mut sys, None, true);
        let users = Users::new_with_refreshed_list();

        let records: Vec<ProcessRecord> = sys
            .processes()
            .iter()
            .filter(|(_, p)| !matches!(p.thread_kind(), Some(ThreadKind::Userland)))
            .map(|(pid, p)| self.to_record(*pid, p, Some(&users), sampled))
            .collect();

        if records.is_empty() {
            return Err(Error::Collection(
                "process table returned no readable entries".to_string(),
            ));
        }

        let partial = records
            .iter()
            .filter(|r| !r.unknown_fields.is_empty())
            .count();
        if partial > 0 {
            debug!(
                "[collector] {} of {} processes have unreadable fields",
                partial,
                records.len()
            );
        }

        Ok(Snapshot::new(records))
    }

    /// Single refresh of one pid: no CPU sampling window and no user table.
    /// The returned record carries lifetime-average CPU and no username.
    fn lookup(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        ensure_supported()?;

        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        self.refresh(&mut sys, Some(target), false);

        let Some(process) = sys.process(target) else {
            return Ok(None);
        };
        if matches!(process.thread_kind(), Some(ThreadKind::Userland)) {
            return Ok(None);
        }
        Ok(Some(self.to_record(target, process, None, false)))
    }

    fn detail_extras(&self, record: &ProcessRecord) -> Result<DetailExtras> {
        let mut sys = System::new();
        sys.refresh_memory();
        read_procfs_extras(record, sys.total_memory())
    }

    fn saved_uid(&self, pid: u32) -> Option<u32> {
        let raw = i32::try_from(pid).ok()?;
        let status = ProcfsProcess::new(raw).and_then(|p| p.status());
        match status {
            Ok(status) => Some(status.suid),
            Err(err) => {
                debug!("[collector] saved uid unreadable for pid {pid}: {err}");
                None
            }
        }
    }
}

fn to_update(pids: &[Pid]) -> ProcessesToUpdate<'_> {
    if pids.is_empty() {
        ProcessesToUpdate::All
    } else {
        ProcessesToUpdate::Some(pids)
    }
}

const PROCFS_FIELDS: [RecordField; 12] = [
    RecordField::Command,
    RecordField::Cwd,
    RecordField::Nice,
    RecordField::NumThreads,
    RecordField::OpenFds,
    RecordField::Terminal,
    RecordField::Environment,
    RecordField::OpenFiles,
    RecordField::Connections,
    RecordField::Uids,
    RecordField::Gids,
    RecordField::CpuTimes,
];

fn vanished(err: &ProcError) -> bool {
    matches!(err, ProcError::NotFound(_))
}

fn read_procfs_extras(record: &ProcessRecord, total_memory: u64) -> Result<DetailExtras> {
    let pid = record.pid;
    let mut extras = DetailExtras {
        memory_percent: memory_percent(record.memory_bytes, total_memory),
        ..Default::default()
    };
    if extras.memory_percent.is_none() {
        extras.unknown_fields.push(RecordField::MemoryPercent);
    }

    let raw_pid = i32::try_from(pid).map_err(|_| Error::NotFound { pid })?;
    let proc = match ProcfsProcess::new(raw_pid) {
        Ok(proc) => proc,
        Err(err) if vanished(&err) => return Err(Error::NotFound { pid }),
        Err(err) => {
            debug!("[collector] procfs unavailable for pid {pid}: {err}");
            extras.unknown_fields.extend(PROCFS_FIELDS);
            return Ok(extras);
        }
    };

    // stat first: its start time tells whether the pid was reused since capture
    match proc.stat() {
        Ok(stat) => {
            if let Some(started) = procfs_start_secs(stat.starttime)
                && !same_start(started, record.start_time)
            {
                debug!(
                    "[collector] pid {pid} reused: procfs start {started}, record start {}",
                    record.start_time
                );
                return Err(Error::NotFound { pid });
            }
            extras.nice = Some(stat.nice);
            extras.num_threads = Some(stat.num_threads);
            extras.terminal = terminal_name(stat.tty_nr());
            let ticks = procfs::ticks_per_second().max(1) as f64;
            extras.cpu_times = Some(CpuTimes {
                user: stat.utime as f64 / ticks,
                system: stat.stime as f64 / ticks,
            });
        }
        Err(err) if vanished(&err) => return Err(Error::NotFound { pid }),
        Err(err) => {
            warn!("[collector] failed to read stat for pid {pid}: {err}");
            extras.unknown_fields.extend([
                RecordField::Nice,
                RecordField::NumThreads,
                RecordField::Terminal,
                RecordField::CpuTimes,
            ]);
        }
    }

    match proc.cmdline() {
        Ok(args) => extras.command_line = args,
        Err(_) => extras.unknown_fields.push(RecordField::Command),
    }
    match proc.cwd() {
        Ok(path) => extras.cwd = Some(path.display().to_string()),
        Err(_) => extras.unknown_fields.push(RecordField::Cwd),
    }
    match proc.fd_count() {
        Ok(count) => extras.open_fds = Some(count),
        Err(_) => extras.unknown_fields.push(RecordField::OpenFds),
    }
    match proc.environ() {
        Ok(vars) => extras.environment = environment_lines(vars),
        Err(_) => extras.unknown_fields.push(RecordField::Environment),
    }
    match proc.status() {
        Ok(status) => {
            extras.uids = Some(IdSet {
                real: status.ruid,
                effective: status.euid,
                saved: status.suid,
                filesystem: status.fuid,
            });
            extras.gids = Some(IdSet {
                real: status.rgid,
                effective: status.egid,
                saved: status.sgid,
                filesystem: status.fgid,
            });
        }
        Err(_) => extras
            .unknown_fields
            .extend([RecordField::Uids, RecordField::Gids]),
    }

    match read_fds(&proc) {
        Ok((files, sockets)) => {
            extras.open_files = files;
            match read_connections(&proc, &sockets) {
                Ok(conns) => extras.connections = conns,
                Err(err) => {
                    debug!("[collector] socket tables unreadable for pid {pid}: {err}");
                    extras.unknown_fields.push(RecordField::Connections);
                }
            }
        }
        Err(_) => extras
            .unknown_fields
            .extend([RecordField::OpenFiles, RecordField::Connections]),
    }

    Ok(extras)
}

/// Open file paths plus the inodes of every socket descriptor.
fn read_fds(proc: &ProcfsProcess) -> procfs::ProcResult<(Vec<String>, BTreeSet<u64>)> {
    let mut files = BTreeSet::new();
    let mut sockets = BTreeSet::new();
    for fd in proc.fd()? {
        // descriptors closed mid-iteration are skipped
        let Ok(fd) = fd else { continue };
        match fd.target {
            FDTarget::Path(path) => {
                files.insert(path.display().to_string());
            }
            FDTarget::Socket(inode) => {
                sockets.insert(inode);
            }
            _ => {}
        }
    }
    Ok((files.into_iter().collect(), sockets))
}

fn read_connections(
    proc: &ProcfsProcess,
    sockets: &BTreeSet<u64>,
) -> procfs::ProcResult<Vec<Connection>> {
    if sockets.is_empty() {
        return Ok(Vec::new());
    }
    let mut conns = Vec::new();
    for (protocol, entries) in [("tcp", proc.tcp()?), ("tcp6", proc.tcp6()?)] {
        conns.extend(
            entries
                .into_iter()
                .filter(|e| sockets.contains(&e.inode))
                .map(|e| Connection {
                    protocol,
                    local_address: e.local_address,
                    remote_address: e.remote_address,
                    state: format!("{:?}", e.state).to_lowercase(),
                }),
        );
    }
    for (protocol, entries) in [("udp", proc.udp()?), ("udp6", proc.udp6()?)] {
        conns.extend(
            entries
                .into_iter()
                .filter(|e| sockets.contains(&e.inode))
                .map(|e| Connection {
                    protocol,
                    local_address: e.local_address,
                    remote_address: e.remote_address,
                    state: format!("{:?}", e.state).to_lowercase(),
                }),
        );
    }
    Ok(conns)
}

fn environment_lines(vars: HashMap<std::ffi::OsString, std::ffi::OsString>) -> Vec<String> {
    let mut lines: Vec<String> = vars
        .into_iter()
        .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
        .collect();
    lines.sort();
    lines
}

/// Start time from `/proc/<pid>/stat`, in seconds since the Unix epoch.
fn procfs_start_secs(starttime_ticks: u64) -> Option<u64> {
    let boot = procfs::boot_time_secs().ok()?;
    Some(boot + starttime_ticks / procfs::ticks_per_second().max(1))
}

/// Start times from sysinfo and procfs round independently.
pub(crate) fn same_start(a: u64, b: u64) -> bool {
    a.abs_diff(b) <= 1
}

fn memory_percent(rss: u64, total: u64) -> Option<f32> {
    (total > 0).then(|| (rss as f64 / total as f64 * 100.0) as f32)
}

/// Device name for a `tty_nr` (major, minor) pair; `None` when the process
/// has no controlling terminal.
fn terminal_name((major, minor): (i32, i32)) -> Option<String> {
    match (major, minor) {
        (0, 0) => None,
        (136..=143, minor) => Some(format!("pts/{}", (major - 136) * 256 + minor)),
        (4, minor) if minor < 64 => Some(format!("tty{minor}")),
        (4, minor) => Some(format!("ttyS{}", minor - 64)),
        (major, minor) => Some(format!("{major}:{minor}")),
    }
}

pub(crate) fn map_status(status: OsStatus) -> ProcessStatus {
    match status {
        OsStatus::Run => ProcessStatus::Running,
        OsStatus::Sleep
        | OsStatus::Idle
        | OsStatus::UninterruptibleDiskSleep
        | OsStatus::Waking
        | OsStatus::Parked
        | OsStatus::LockBlocked => ProcessStatus::Sleeping,
        OsStatus::Stop | OsStatus::Tracing => ProcessStatus::Stopped,
        OsStatus::Zombie | OsStatus::Dead => ProcessStatus::Zombie,
        _ => ProcessStatus::Unknown,
    }
}

/// CPU time over wall time since start, as a percentage of one core.
fn lifetime_cpu_percent(cpu_time_ms: u64, run_time_secs: u64) -> f32 {
    if run_time_secs == 0 {
        return 0.0;
    }
    (cpu_time_ms as f64 / (run_time_secs as f64 * 1000.0) * 100.0) as f32
}

/// In-memory process table. Processes can be added or removed between calls
/// to model a table that changes underneath a caller.
#[derive(Debug, Default)]
pub struct StaticSource {
    records: Mutex<Vec<ProcessRecord>>,
}

impl StaticSource {
    pub fn new(records: Vec<ProcessRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn insert(&self, record: ProcessRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.retain(|r| r.pid != record.pid);
        records.push(record);
    }

    pub fn remove(&self, pid: u32) -> Option<ProcessRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let idx = records.iter().position(|r| r.pid == pid)?;
        Some(records.remove(idx))
    }
}

impl ProcessSource for StaticSource {
    fn snapshot(&self) -> Result<Snapshot> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.is_empty() {
            return Err(Error::Collection("process table is empty".to_string()));
        }
        Ok(Snapshot::new(records.clone()))
    }

    fn lookup(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.iter().find(|r| r.pid == pid).cloned())
    }

    fn detail_extras(&self, record: &ProcessRecord) -> Result<DetailExtras> {
        match self.lookup(record.pid)? {
            Some(current) if same_start(current.start_time, record.start_time) => {
                Ok(DetailExtras::default())
            }
            _ => Err(Error::NotFound { pid: record.pid }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_os_states() {
        assert_eq!(map_status(OsStatus::Run), ProcessStatus::Running);
        assert_eq!(map_status(OsStatus::Idle), ProcessStatus::Sleeping);
        assert_eq!(
            map_status(OsStatus::UninterruptibleDiskSleep),
            ProcessStatus::Sleeping
        );
        assert_eq!(map_status(OsStatus::Tracing), ProcessStatus::Stopped);
        assert_eq!(map_status(OsStatus::Dead), ProcessStatus::Zombie);
        assert_eq!(map_status(OsStatus::Unknown(42)), ProcessStatus::Unknown);
    }

    #[test]
    fn lifetime_cpu_average() {
        assert_eq!(lifetime_cpu_percent(500, 0), 0.0);
        assert!((lifetime_cpu_percent(5_000, 10) - 50.0).abs() < f32::EPSILON);
        assert!((lifetime_cpu_percent(40_000, 10) - 400.0).abs() < 0.01);
    }

    #[test]
    fn live_snapshot_contains_current_process() {
        let source = SystemSource::default();
        let snap = source.snapshot().unwrap();
        let me = snap.get(std::process::id()).expect("own pid listed");
        assert!(me.memory_bytes > 0);
        assert!(me.start_time > 0);
        assert!(me.username.is_some());
    }

    #[test]
    fn live_lookup_distinguishes_missing_pids() {
        let source = SystemSource::default();
        let me = source.lookup(std::process::id()).unwrap();
        assert!(me.is_some());
        assert!(source.lookup(i32::MAX as u32).unwrap().is_none());
    }

    fn own_record(source: &SystemSource) -> ProcessRecord {
        let snap = source.snapshot().unwrap();
        snap.get(std::process::id()).cloned().expect("own pid listed")
    }

    #[test]
    fn live_extras_for_current_process() {
        let source = SystemSource::default();
        let me = own_record(&source);
        let extras = source.detail_extras(&me).unwrap();
        assert!(!extras.command_line.is_empty());
        assert!(extras.num_threads.unwrap_or(0) >= 1);
        assert!(extras.open_fds.is_some());
        assert!(extras.memory_percent.unwrap_or(0.0) > 0.0);
        assert!(!extras.environment.is_empty());
        assert!(extras.environment.windows(2).all(|w| w[0] <= w[1]));
        assert!(extras.cpu_times.is_some());

        // SAFETY: getuid(2) cannot fail and has no preconditions.
        let uid = unsafe { libc::getuid() };
        assert_eq!(extras.uids.map(|ids| ids.real), Some(uid));
        for field in [
            RecordField::Command,
            RecordField::Environment,
            RecordField::OpenFiles,
            RecordField::Uids,
            RecordField::CpuTimes,
        ] {
            assert!(!extras.unknown_fields.contains(&field), "{field:?}");
        }
    }

    #[test]
    fn live_extras_refuse_a_reused_pid() {
        let source = SystemSource::default();
        let mut me = own_record(&source);
        me.start_time -= 3600;
        assert!(matches!(
            source.detail_extras(&me),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn extras_for_missing_pid_are_not_found() {
        let record = ProcessRecord {
            pid: i32::MAX as u32,
            ..Default::default()
        };
        assert!(matches!(
            read_procfs_extras(&record, 1 << 30),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn terminal_names() {
        assert_eq!(terminal_name((0, 0)), None);
        assert_eq!(terminal_name((136, 3)).as_deref(), Some("pts/3"));
        assert_eq!(terminal_name((137, 1)).as_deref(), Some("pts/257"));
        assert_eq!(terminal_name((4, 1)).as_deref(), Some("tty1"));
        assert_eq!(terminal_name((4, 65)).as_deref(), Some("ttyS1"));
    }

    #[test]
    fn memory_share_of_total() {
        assert_eq!(memory_percent(512, 0), None);
        assert_eq!(memory_percent(256, 1024), Some(25.0));
    }

    #[test]
    fn sampled_cpu_without_slowing_lookup() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Instant;

        let stop = Arc::new(AtomicBool::new(false));
        let spin = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };

        let source = SystemSource::new(&CollectorConfig { cpu_sample_ms: 300 });
        let started = Instant::now();
        let me = own_record(&source);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(me.cpu_percent > 10.0, "sampled cpu {}", me.cpu_percent);

        let started = Instant::now();
        let found = source.lookup(std::process::id()).unwrap();
        let elapsed = started.elapsed();
        stop.store(true, Ordering::Relaxed);
        spin.join().unwrap();

        assert!(found.is_some());
        assert!(elapsed < Duration::from_millis(300), "lookup took {elapsed:?}");
    }

    #[test]
    fn static_extras_check_start_time() {
        let original = ProcessRecord {
            pid: 10,
            start_time: 1_700_000_000,
            ..Default::default()
        };
        let source = StaticSource::new(vec![original.clone()]);
        assert!(source.detail_extras(&original).is_ok());

        source.insert(ProcessRecord {
            start_time: original.start_time + 60,
            ..original.clone()
        });
        assert!(matches!(
            source.detail_extras(&original),
            Err(Error::NotFound { pid: 10 })
        ));
    }

    #[test]
    fn static_source_tracks_removals() {
        let source = StaticSource::new(vec![ProcessRecord {
            pid: 10,
            ..Default::default()
        }]);
        assert!(source.lookup(10).unwrap().is_some());
        source.remove(10);
        assert!(source.lookup(10).unwrap().is_none());
        assert!(matches!(source.snapshot(), Err(Error::Collection(_))));
    }
}
