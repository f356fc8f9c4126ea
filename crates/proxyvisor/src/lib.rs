//! Proxyvisor
//!
//! Provisions reverse-proxy executables (`frpc`, `frps`) for the host architecture,
//! launches them through the first working strategy (full userland environment,
//! root emulation, direct exec) and supervises the resulting processes.

pub mod arch;
pub mod assets;
pub mod diagnose;
pub mod error;
pub mod launch;
pub mod models;
pub mod process;
pub mod provision;
pub mod registry;
pub mod sandbox;
pub mod service;
pub mod settings;
pub mod sink;
pub mod store;
pub mod synth;

pub use error::{AttemptFailure, LaunchError, ProvisionError, ServiceError};
pub use models::{Phase, ProxyConfig, Role, RunState};
pub use service::{ProxyService, ServiceConfig};
