pub mod collector;
pub mod config;
pub mod error;
pub mod query;
pub mod service;
pub mod signal;
pub mod tree;
pub mod types;

pub use collector::{ProcessSource, StaticSource, SystemSource};
pub use config::{CollectorConfig, Config, LoggingConfig, QueryConfig, SignalConfig};
pub use error::{Error, Result};
pub use query::{Page, QueryParams, QuerySpec, SortDir, SortField};
pub use service::ProcessService;
pub use signal::{Credentials, LibcSender, Signal, SignalAck, SignalDispatcher, SignalRequest, SignalSender};
pub use types::{
    Connection, CpuTimes, DetailExtras, IdSet, ProcessDetail, ProcessRecord, ProcessStatus,
    RecordField, Snapshot, TreeNode,
};
