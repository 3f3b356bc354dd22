//! The five operations a panel calls: list, tree, detail, kill and signal.
//!
//! Each call collects its own snapshot; calls share no mutable state and can
//! run concurrently. OS work runs on tokio's blocking pool. A signal that has
//! been handed to the pool is delivered even if the caller stops waiting.

use log::debug;
use std::sync::Arc;

use crate::collector::{ProcessSource, SystemSource};
use crate::config::{Config, QueryConfig};
use crate::error::{Error, Result};
use crate::query::{self, Page, QueryParams, QuerySpec};
use crate::signal::{Credentials, LibcSender, SignalAck, SignalDispatcher, SignalRequest, SignalSender};
use crate::tree;
use crate::types::{ProcessDetail, TreeNode};

#[derive(Clone)]
pub struct ProcessService {
    source: Arc<dyn ProcessSource>,
    dispatcher: SignalDispatcher,
    query: QueryConfig,
}

impl ProcessService {
    /// Service over the live OS process table.
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            Arc::new(SystemSource::new(&config.collector)),
            Arc::new(LibcSender),
            config,
            Credentials::current(),
        )
    }

    pub fn with_parts(
        source: Arc<dyn ProcessSource>,
        sender: Arc<dyn SignalSender>,
        config: &Config,
        credentials: Credentials,
    ) -> Self {
        let dispatcher =
            SignalDispatcher::new(source.clone(), sender, config.signals.clone(), credentials)
                .with_audit(config.logging.audit);
        Self {
            source,
            dispatcher,
            query: config.query.clone(),
        }
    }

    pub fn query_config(&self) -> &QueryConfig {
        &self.query
    }

    pub async fn list(&self, spec: QuerySpec) -> Result<Page> {
        // reject bad input before paying for a collection
        spec.validate(self.query.max_page_size)?;
        let source = self.source.clone();
        let max = self.query.max_page_size;
        blocking(move || {
            let snapshot = source.snapshot()?;
            let page = query::run(&snapshot, &spec, max)?;
            debug!(
                "[service] list matched {} of {} processes",
                page.total,
                snapshot.len()
            );
            Ok(page)
        })
        .await
    }

    pub async fn list_params(&self, params: &QueryParams) -> Result<Page> {
        let spec = QuerySpec::from_params(params, &self.query)?;
        self.list(spec).await
    }

    pub async fn tree(&self) -> Result<Vec<TreeNode>> {
        let source = self.source.clone();
        blocking(move || {
            let snapshot = source.snapshot()?;
            Ok(tree::build(&snapshot))
        })
        .await
    }

    pub async fn subtree(&self, pid: u32) -> Result<TreeNode> {
        let source = self.source.clone();
        blocking(move || {
            let snapshot = source.snapshot()?;
            tree::subtree(&snapshot, pid).ok_or(Error::NotFound { pid })
        })
        .await
    }

    /// Record, relatives and on-demand extras for one pid. The extras are
    /// read after the snapshot, so they are checked against the record's
    /// start time; a pid reused in between is reported as `NotFound`.
    pub async fn detail(&self, pid: u32) -> Result<ProcessDetail> {
        let source = self.source.clone();
        blocking(move || {
            let snapshot = source.snapshot()?;
            let mut record = query::find(&snapshot, pid)?.clone();
            let parent = record
                .parent_pid
                .filter(|ppid| *ppid != pid)
                .and_then(|ppid| snapshot.get(ppid))
                .cloned();
            let children = snapshot.children_of(pid).cloned().collect();

            let mut extras = source.detail_extras(&record)?;
            for field in std::mem::take(&mut extras.unknown_fields) {
                if !record.unknown_fields.contains(&field) {
                    record.unknown_fields.push(field);
                }
            }

            Ok(ProcessDetail {
                record,
                extras,
                parent,
                children,
            })
        })
        .await
    }

    pub async fn kill(&self, pid: u32) -> Result<SignalAck> {
        let dispatcher = self.dispatcher.clone();
        blocking(move || dispatcher.kill(pid)).await
    }

    pub async fn signal(&self, pid: u32, name: &str) -> Result<SignalAck> {
        let dispatcher = self.dispatcher.clone();
        let name = name.to_string();
        blocking(move || dispatcher.dispatch_named(pid, &name, None)).await
    }

    pub async fn signal_request(&self, req: SignalRequest) -> Result<SignalAck> {
        let dispatcher = self.dispatcher.clone();
        blocking(move || dispatcher.dispatch(&req)).await
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| Error::Internal(format!("blocking task failed: {err}")))?
}
