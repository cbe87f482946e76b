//! The `intendantd` language host launcher.
//!
//! The driver spawns this binary with the engine RPC address as the only
//! positional argument; we fire up a LanguageRuntime gRPC server on a
//! kernel-assigned port, print that port on stdout so the spawner can reach
//! us, and block until the server exits.
//!

mod server;

use clap::{crate_description, crate_version, Parser};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, trace};

use intendant_common::init_logging;
use intendant_proto::language_runtime_server::LanguageRuntimeServer;

use crate::server::HostService;

/// Binary name
const NAME: &str = env!("CARGO_BIN_NAME");

#[derive(Debug, Parser)]
#[clap(name = NAME, about = crate_description!())]
#[clap(version = crate_version!())]
struct Opts {
    /// Emit tracing to the given endpoint.
    #[clap(long)]
    tracing: Option<String>,
    /// The engine RPC address.
    engine_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logging(NAME, false, None)?;
    if let Some(endpoint) = &opts.tracing {
        info!("tracing endpoint {endpoint} noted; telemetry export is not built in");
    }

    trace!("starting language host");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .wrap_err("could not start language host RPC server")?;
    let port = listener
        .local_addr()
        .wrap_err("could not start language host RPC server")?
        .port();

    // The spawner reads the port from stdout.
    //
    println!("{port}");

    let host = HostService::new(opts.engine_address);
    Server::builder()
        .add_service(LanguageRuntimeServer::new(host))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .wrap_err("language host RPC stopped serving")?;

    Ok(())
}
