//! Core runtime for the intendant language host.
//!
//! The runtime interprets a block-structured infrastructure DSL: sources
//! parse into a table of dataflow nodes (config variables, locals,
//! resources), every node evaluates concurrently coordinated by one-shot
//! awaitables, resources register with the external resource monitor over
//! RPC, and stack outputs are published at the end.
//!

pub use awaitable::{AwaitState, Awaitable};
pub use context::{ProgramContext, RunInfo};
pub use diag::{write_diagnostics, Diagnostic, Diagnostics, Severity};
pub use eval::{Evaluator, Scope};
pub use monitor::{GrpcMonitor, MonitorError, NullMonitor, ResourceMonitor};
pub use node::{AwaitOutcome, Node, NodeKind, OutputNode, STACK_TYPE};
pub use run::{run, run_with_monitor};
pub use schema::{
    load_schema, PackageSchema, SchemaCache, SchemaError, SchemaType,
};
pub use value::{Archive, Asset, ScriptFunc, Value};

mod awaitable;
mod binder;
mod context;
mod decode;
mod diag;
mod eval;
mod functions;
mod invoke;
mod marshal;
mod monitor;
mod node;
mod resource;
mod run;
mod schema;
mod script;
mod value;

pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
