//! Host commands module
//!
//! Maps `{method, arguments}` calls from the host onto session operations.

pub mod host;

pub use host::{dispatch, HostCall};
