//! This library is there to share some common code amongst all intendant modules.
//!

mod logging;

pub use logging::*;

/// Return the crate name and version as a single tag.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
