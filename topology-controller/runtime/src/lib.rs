#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use topology_controller_core as core;
pub use topology_controller_k8s_api as k8s;
pub use topology_controller_k8s_index as index;

mod args;
mod sink;

pub use self::args::Args;
pub use self::sink::HttpMetadataSink;
