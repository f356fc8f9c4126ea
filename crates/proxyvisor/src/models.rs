//! Proxy configuration and run-state records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::launch::LaunchStrategy;

/// Whether a config drives the client or the server executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Name of the executable that serves this role.
    pub fn executable(self) -> &'static str {
        match self {
            Role::Client => "frpc",
            Role::Server => "frps",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

fn default_proxy_type() -> String {
    "tcp".to_string()
}

fn default_enabled() -> bool {
    true
}

/// One client or server proxy definition, as supplied by the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub id: String,
    /// Display name; also used as the proxy block name.
    #[serde(default)]
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub server_addr: String,
    pub server_port: u16,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "localIP")]
    pub local_ip: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    /// Proxy protocol kind (tcp, udp, http, https, stcp, xtcp, ...).
    #[serde(default = "default_proxy_type", alias = "proxyProtocolKind")]
    pub proxy_type: String,
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
}

impl ProxyConfig {
    /// Minimal client config.
    pub fn client(
        id: impl Into<String>,
        server_addr: impl Into<String>,
        server_port: u16,
        local_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            role: Role::Client,
            server_addr: server_addr.into(),
            server_port,
            token: None,
            local_ip: None,
            local_port: Some(local_port),
            remote_port: None,
            proxy_type: default_proxy_type(),
            custom_domain: None,
            subdomain: None,
            enabled: true,
            auto_start: false,
        }
    }

    /// Minimal server config binding `bind_port`.
    pub fn server(id: impl Into<String>, bind_port: u16) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            role: Role::Server,
            server_addr: String::new(),
            server_port: bind_port,
            token: None,
            local_ip: None,
            local_port: None,
            remote_port: None,
            proxy_type: default_proxy_type(),
            custom_domain: None,
            subdomain: None,
            enabled: true,
            auto_start: false,
        }
    }

    /// Name used for the proxy block, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Check the invariants the launch path relies on.
    pub fn validate(&self) -> Result<(), String> {
        validate_id(&self.id)?;
        if self.server_port == 0 {
            return Err(match self.role {
                Role::Client => "serverPort must be set".to_string(),
                Role::Server => "serverPort (bind port) must be set".to_string(),
            });
        }
        if self.role == Role::Client {
            if self.server_addr.trim().is_empty() {
                return Err("client config requires serverAddr".to_string());
            }
            if !matches!(self.local_port, Some(p) if p > 0) {
                return Err("client config requires localPort".to_string());
            }
            if self.proxy_type.trim().is_empty() {
                return Err("client config requires a proxy type".to_string());
            }
        }
        Ok(())
    }
}

/// Config ids name files on disk, so they are restricted to a safe alphabet.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("config id is empty".to_string());
    }
    if id == "." || id == ".." {
        return Err(format!("config id {id:?} is reserved"));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("config id {id:?} contains invalid character {c:?}"));
    }
    Ok(())
}

/// Lifecycle phase of one configuration's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Stopped => "STOPPED",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Externally observable status of one configuration.
///
/// Replaced wholesale on every transition; never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub config_id: String,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub strategy: Option<LaunchStrategy>,
}

impl RunState {
    /// Default record for a config that has never been started.
    pub fn stopped(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            phase: Phase::Stopped,
            pid: None,
            start_time: None,
            exit_code: None,
            error_message: None,
            strategy: None,
        }
    }

    pub fn starting(config_id: impl Into<String>) -> Self {
        Self {
            phase: Phase::Starting,
            ..Self::stopped(config_id)
        }
    }

    pub fn running(
        config_id: impl Into<String>,
        pid: Option<u32>,
        start_time: DateTime<Utc>,
        strategy: LaunchStrategy,
    ) -> Self {
        Self {
            phase: Phase::Running,
            pid,
            start_time: Some(start_time),
            strategy: Some(strategy),
            ..Self::stopped(config_id)
        }
    }

    /// Terminal error record. An empty message is replaced so callers always
    /// have something to show.
    pub fn error(config_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "unknown error".to_string();
        }
        Self {
            phase: Phase::Error,
            error_message: Some(message),
            ..Self::stopped(config_id)
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }
}
