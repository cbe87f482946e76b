//! Generated gRPC bindings for the driver-facing protocol.
//!
//! The wire contract is externally specified; the `.proto` files under
//! `proto/pulumi/` are a trimmed copy of the subset this host consumes
//! (resource monitor, engine) and exposes (language runtime).
//!

pub mod pulumirpc {
    tonic::include_proto!("pulumirpc");
}

pub use pulumirpc::*;
