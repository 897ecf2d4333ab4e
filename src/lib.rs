//! portkeeper — a local HTTP reverse proxy that routes by hostname to a
//! pool of supervised worker subprocesses.
//!
//! The library owns the lifecycle manager and request dispatcher: the
//! middleware pipeline, the per-application state machine, the
//! environment-sourcing protocol, the file-triggered restart policy, and
//! the worker-pool contract. The `portkeeperd` binary (`main.rs`) wires
//! this library to a real TCP listener, a filesystem host resolver, and
//! process configuration.

#[cfg(not(any(
    target_env = "musl",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "windows"
)))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod application;
pub mod config;
pub mod env_sourcer;
pub mod errors;
pub mod host_router;
pub mod line_buffer;
pub mod logging;
pub mod pauser;
pub mod pipeline;
pub mod static_files;
pub mod worker_pool;

pub use application::Application;
pub use config::Config;
pub use errors::PowError;
pub use host_router::{HostResolver, HostRouter, SymlinkHostResolver};
pub use pipeline::Pipeline;
pub use worker_pool::WorkerPool;
