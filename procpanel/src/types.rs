use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Declaration order is the sort order used by `SortField::Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    #[default]
    Unknown,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
            Self::Zombie => "zombie",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "stopped" => Ok(Self::Stopped),
            "zombie" => Ok(Self::Zombie),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::invalid_query(
                "status",
                format!("unknown status `{other}`"),
            )),
        }
    }
}

/// Record fields that may be unreadable for a given process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Username,
    Command,
    Exe,
    Cwd,
    Nice,
    NumThreads,
    OpenFds,
    MemoryPercent,
    Terminal,
    Environment,
    OpenFiles,
    Connections,
    Uids,
    Gids,
    CpuTimes,
}

/// One process as seen at capture time. Records are never updated in place;
/// a new snapshot produces new records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    /// Full command line joined by spaces, empty when unreadable.
    pub command: String,
    pub exe: Option<String>,
    pub username: Option<String>,
    pub uid: Option<u32>,
    pub status: ProcessStatus,
    pub cpu_percent: f32,
    /// Resident set size.
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_fields: Vec<RecordField>,
}

impl ProcessRecord {
    pub fn is_unknown(&self, field: RecordField) -> bool {
        self.unknown_fields.contains(&field)
    }
}

/// Process table captured in one pass. Records are kept in ascending pid
/// order and only handed out by shared reference.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    captured_at: u64,
    records: Vec<ProcessRecord>,
}

impl Snapshot {
    pub fn new(mut records: Vec<ProcessRecord>) -> Self {
        records.sort_by_key(|r| r.pid);
        records.dedup_by_key(|r| r.pid);
        Self {
            captured_at: current_epoch_millis(),
            records,
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessRecord> {
        self.records
            .binary_search_by_key(&pid, |r| r.pid)
            .ok()
            .map(|idx| &self.records[idx])
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.get(pid).is_some()
    }

    /// Direct children of `pid`, in pid order.
    pub fn children_of(&self, pid: u32) -> impl Iterator<Item = &ProcessRecord> {
        self.records
            .iter()
            .filter(move |r| r.parent_pid == Some(pid) && r.pid != pid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub depth: usize,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Number of records in this subtree, including the node itself.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }
}

/// Real, effective, saved and filesystem ids from `/proc/<pid>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdSet {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
    pub filesystem: u32,
}

/// CPU time consumed since start, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
}

/// An inet socket held open by the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    /// `tcp`, `tcp6`, `udp` or `udp6`.
    pub protocol: &'static str,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub state: String,
}

/// Values read for a single process on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailExtras {
    pub command_line: Vec<String>,
    pub cwd: Option<String>,
    pub nice: Option<i64>,
    pub num_threads: Option<i64>,
    pub open_fds: Option<usize>,
    /// Resident memory as a share of total physical memory.
    pub memory_percent: Option<f32>,
    /// Controlling terminal, `None` for daemons.
    pub terminal: Option<String>,
    /// `KEY=value` pairs, sorted.
    pub environment: Vec<String>,
    /// Paths of open file descriptors, sorted and deduplicated.
    pub open_files: Vec<String>,
    pub connections: Vec<Connection>,
    pub uids: Option<IdSet>,
    pub gids: Option<IdSet>,
    pub cpu_times: Option<CpuTimes>,
    /// Merged into the record's `unknown_fields` before it is returned.
    #[serde(skip)]
    pub unknown_fields: Vec<RecordField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessDetail {
    #[serde(flatten)]
    pub record: ProcessRecord,
    #[serde(flatten)]
    pub extras: DetailExtras,
    pub parent: Option<ProcessRecord>,
    pub children: Vec<ProcessRecord>,
}

pub(crate) fn current_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, parent: Option<u32>) -> ProcessRecord {
        ProcessRecord {
            pid,
            parent_pid: parent,
            name: format!("p{pid}"),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_orders_by_pid_and_drops_duplicates() {
        let snap = Snapshot::new(vec![record(30, None), record(2, None), record(30, Some(2))]);
        let pids: Vec<u32> = snap.records().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![2, 30]);
        assert!(snap.contains(30));
        assert!(!snap.contains(31));
    }

    #[test]
    fn children_skip_self_parented_records() {
        let snap = Snapshot::new(vec![record(1, Some(1)), record(2, Some(1)), record(3, Some(1))]);
        let kids: Vec<u32> = snap.children_of(1).map(|r| r.pid).collect();
        assert_eq!(kids, vec![2, 3]);
    }

    #[test]
    fn status_parsing() {
        assert_eq!("Zombie".parse::<ProcessStatus>().unwrap(), ProcessStatus::Zombie);
        assert_eq!(" running ".parse::<ProcessStatus>().unwrap(), ProcessStatus::Running);
        let err = "defunct".parse::<ProcessStatus>().unwrap_err();
        assert_eq!(err.kind(), "invalid_query");
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Sleeping).unwrap(),
            "\"sleeping\""
        );
        let json = serde_json::to_value(record(7, Some(1))).unwrap();
        assert_eq!(json["status"], "unknown");
        assert!(json.get("unknown_fields").is_none());
    }
}
