//! LanguageRuntime service implementation.
//!

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use intendant_proto::language_runtime_server::LanguageRuntime;
use intendant_proto::{
    GetRequiredPluginsRequest, GetRequiredPluginsResponse, PluginInfo, RunRequest, RunResponse,
};
use intendant_runtime::{run, write_diagnostics, RunInfo};

pub struct HostService {
    engine_address: String,
}

impl HostService {
    pub fn new(engine_address: String) -> Self {
        HostService { engine_address }
    }
}

/// Read every `.pp` file in the working directory.
///
fn read_sources() -> std::io::Result<BTreeMap<String, String>> {
    let mut sources = BTreeMap::new();
    for entry in std::fs::read_dir(".")? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == "pp").unwrap_or(false) {
            let contents = std::fs::read_to_string(&path)?;
            sources.insert(path.display().to_string(), contents);
        }
    }
    Ok(sources)
}

#[tonic::async_trait]
impl LanguageRuntime for HostService {
    async fn get_required_plugins(
        &self,
        _req: Request<GetRequiredPluginsRequest>,
    ) -> Result<Response<GetRequiredPluginsResponse>, Status> {
        Ok(Response::new(GetRequiredPluginsResponse { plugins: vec![] }))
    }

    async fn run(&self, req: Request<RunRequest>) -> Result<Response<RunResponse>, Status> {
        let req = req.into_inner();
        info!("run request for {}/{}", req.project, req.stack);

        let sources = read_sources()
            .map_err(|e| Status::internal(format!("reading program sources: {e}")))?;
        debug!("{} source file(s)", sources.len());

        let info = RunInfo {
            project: req.project,
            stack: req.stack,
            config: req.config.into_iter().collect(),
            parallel: req.parallel,
            dry_run: req.dry_run,
            monitor_addr: req.monitor_address,
            engine_addr: self.engine_address.clone(),
        };

        let (files, diags) = run(CancellationToken::new(), sources, info).await;

        let mut error = String::new();
        if !diags.is_empty() {
            let mut stderr = std::io::stderr();
            let _ = write_diagnostics(&mut stderr, &files, &diags);
            if diags.has_errors() {
                error = "program failed".to_string();
            }
        }

        Ok(Response::new(RunResponse { error }))
    }

    async fn get_plugin_info(&self, _req: Request<()>) -> Result<Response<PluginInfo>, Status> {
        Ok(Response::new(PluginInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }
}
