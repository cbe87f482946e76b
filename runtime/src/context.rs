//! Per-run program state.
//!
//! One `ProgramContext` lives for exactly one `run` invocation: the
//! cancellation signal, the run metadata, the RPC stubs, the schema cache
//! and the node/output tables. The tables are populated during the
//! sequential binding phase and are read-only once evaluation fans out.
//!

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use intendant_proto::engine_client::EngineClient;

use crate::monitor::ResourceMonitor;
use crate::node::{Node, OutputNode};
use crate::schema::SchemaCache;

/// Metadata about a run request, handed over by the driver.
///
#[derive(Clone, Debug, Default)]
pub struct RunInfo {
    pub project: String,
    pub stack: String,
    pub config: BTreeMap<String, String>,
    pub parallel: i32,
    pub dry_run: bool,
    pub monitor_addr: String,
    pub engine_addr: String,
}

pub struct ProgramContext {
    pub cancel: CancellationToken,
    pub info: RunInfo,

    pub monitor: Arc<dyn ResourceMonitor>,
    pub engine: Option<EngineClient<Channel>>,

    pub schemas: SchemaCache,
    pub nodes: BTreeMap<String, Arc<Node>>,
    pub outputs: Vec<OutputNode>,

    /// The root stack resource every other resource is parented to.
    pub stack: Arc<Node>,
}

impl ProgramContext {
    pub fn new(
        cancel: CancellationToken,
        info: RunInfo,
        monitor: Arc<dyn ResourceMonitor>,
        schemas: SchemaCache,
    ) -> Self {
        let stack = Arc::new(Node::stack(format!("{}-{}", info.project, info.stack)));
        ProgramContext {
            cancel,
            info,
            monitor,
            engine: None,
            schemas,
            nodes: BTreeMap::new(),
            outputs: Vec::new(),
            stack,
        }
    }

    /// The configuration value for a declared variable, keyed
    /// `<project>:<name>`.
    ///
    pub fn config_value(&self, name: &str) -> Option<&String> {
        self.info.config.get(&format!("{}:{}", self.info.project, name))
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> ProgramContext {
    use crate::monitor::NullMonitor;

    ProgramContext::new(
        CancellationToken::new(),
        RunInfo {
            project: "proj".to_string(),
            stack: "dev".to_string(),
            monitor_addr: "-".to_string(),
            engine_addr: "-".to_string(),
            ..RunInfo::default()
        },
        Arc::new(NullMonitor),
        SchemaCache::new(),
    )
}
