use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::types::{ProcessRecord, ProcessStatus, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Pid,
    CpuPercent,
    MemoryBytes,
    Username,
    /// Activity order: running, sleeping, stopped, zombie, unknown.
    Status,
    StartTime,
    Name,
}

impl SortField {
    pub const ALL: [SortField; 7] = [
        Self::Pid,
        Self::CpuPercent,
        Self::MemoryBytes,
        Self::Username,
        Self::Status,
        Self::StartTime,
        Self::Name,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::CpuPercent => "cpu_percent",
            Self::MemoryBytes => "memory_bytes",
            Self::Username => "username",
            Self::Status => "status",
            Self::StartTime => "start_time",
            Self::Name => "name",
        }
    }

    fn compare(&self, a: &ProcessRecord, b: &ProcessRecord) -> Ordering {
        match self {
            Self::Pid => a.pid.cmp(&b.pid),
            Self::CpuPercent => a.cpu_percent.total_cmp(&b.cpu_percent),
            Self::MemoryBytes => a.memory_bytes.cmp(&b.memory_bytes),
            Self::Username => a.username.cmp(&b.username),
            Self::Status => a.status.cmp(&b.status),
            Self::StartTime => a.start_time.cmp(&b.start_time),
            Self::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pid" => Ok(Self::Pid),
            "cpu" | "cpu_percent" => Ok(Self::CpuPercent),
            "memory" | "memory_bytes" | "rss" => Ok(Self::MemoryBytes),
            "username" | "user" => Ok(Self::Username),
            "status" => Ok(Self::Status),
            "start_time" => Ok(Self::StartTime),
            "name" => Ok(Self::Name),
            other => Err(Error::invalid_query(
                "sort_by",
                format!("unknown field `{other}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDir {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(Error::invalid_query(
                "sort_dir",
                format!("expected `asc` or `desc`, got `{other}`"),
            )),
        }
    }
}

/// Query parameters exactly as the transport layer receives them. Empty
/// strings count as "not set".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub page: usize,
    pub limit: usize,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
    pub status: Option<ProcessStatus>,
    /// Case-insensitive substring of the name or command line.
    pub search: Option<String>,
    pub username: Option<String>,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            page: 1,
            limit: QueryConfig::default().default_limit,
            sort_by: SortField::Pid,
            sort_dir: SortDir::Asc,
            status: None,
            search: None,
            username: None,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl QuerySpec {
    pub fn from_params(params: &QueryParams, cfg: &QueryConfig) -> Result<Self> {
        let page = match params.page {
            None => 1,
            Some(p) if p >= 1 => p as usize,
            Some(p) => {
                return Err(Error::invalid_query(
                    "page",
                    format!("must be at least 1, got {p}"),
                ));
            }
        };
        let limit = match params.limit {
            None => cfg.default_limit,
            Some(l) if l >= 1 => l as usize,
            Some(l) => {
                return Err(Error::invalid_query(
                    "limit",
                    format!("must be within [1, {}], got {l}", cfg.max_page_size),
                ));
            }
        };

        let spec = Self {
            page,
            limit,
            sort_by: non_empty(&params.sort_by)
                .map(str::parse::<SortField>)
                .transpose()?
                .unwrap_or_default(),
            sort_dir: non_empty(&params.sort_dir)
                .map(str::parse::<SortDir>)
                .transpose()?
                .unwrap_or_default(),
            status: non_empty(&params.status)
                .map(str::parse::<ProcessStatus>)
                .transpose()?,
            search: non_empty(&params.search).map(str::to_string),
            username: non_empty(&params.username).map(str::to_string),
        };
        spec.validate(cfg.max_page_size)?;
        Ok(spec)
    }

    pub fn validate(&self, max_page_size: usize) -> Result<()> {
        if self.page < 1 {
            return Err(Error::invalid_query(
                "page",
                format!("must be at least 1, got {}", self.page),
            ));
        }
        if self.limit < 1 || self.limit > max_page_size {
            return Err(Error::invalid_query(
                "limit",
                format!("must be within [1, {max_page_size}], got {}", self.limit),
            ));
        }
        Ok(())
    }

    fn matches(&self, record: &ProcessRecord, needle: Option<&str>) -> bool {
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(username) = &self.username
            && record.username.as_deref() != Some(username.as_str())
        {
            return false;
        }
        match needle {
            Some(needle) => {
                record.name.to_lowercase().contains(needle)
                    || record.command.to_lowercase().contains(needle)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub items: Vec<ProcessRecord>,
    /// Matches across all pages.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Filter, sort and paginate one snapshot.
pub fn run(snapshot: &Snapshot, spec: &QuerySpec, max_page_size: usize) -> Result<Page> {
    spec.validate(max_page_size)?;

    let needle = spec.search.as_ref().map(|s| s.to_lowercase());
    let mut matched: Vec<&ProcessRecord> = snapshot
        .records()
        .iter()
        .filter(|r| spec.matches(r, needle.as_deref()))
        .collect();

    matched.sort_by(|a, b| {
        let ord = spec.sort_by.compare(a, b);
        let ord = match spec.sort_dir {
            SortDir::Asc => ord,
            SortDir::Desc => ord.reverse(),
        };
        ord.then_with(|| a.pid.cmp(&b.pid))
    });

    let total = matched.len();
    let items = matched
        .into_iter()
        .skip((spec.page - 1).saturating_mul(spec.limit))
        .take(spec.limit)
        .cloned()
        .collect();

    Ok(Page {
        items,
        total,
        page: spec.page,
        limit: spec.limit,
    })
}

/// Single-pid lookup over a snapshot.
pub fn find(snapshot: &Snapshot, pid: u32) -> Result<&ProcessRecord> {
    snapshot.get(pid).ok_or(Error::NotFound { pid })
}
