//! Renders a [`ProxyConfig`] into the TOML file the proxy executable reads.
//!
//! Output is deterministic: the same config always yields byte-identical text.
//! Blank optional strings and zero ports are left out rather than written empty.

use std::fmt::Write;

use crate::models::{ProxyConfig, Role};

/// Render the configuration file for `config`.
pub fn synthesize(config: &ProxyConfig) -> String {
    let mut out = String::new();
    match config.role {
        Role::Client => client(&mut out, config),
        Role::Server => server(&mut out, config),
    }
    out
}

fn client(out: &mut String, config: &ProxyConfig) {
    let addr = config.server_addr.trim();
    if !addr.is_empty() {
        line(out, "serverAddr", &quote(addr));
    }
    line(out, "serverPort", &config.server_port.to_string());
    if let Some(token) = non_blank(&config.token) {
        line(out, "auth.token", &quote(token));
    }

    out.push('\n');
    out.push_str("[[proxies]]\n");
    line(out, "name", &quote(config.display_name()));
    line(out, "type", &quote(proxy_type(config)));
    if let Some(ip) = non_blank(&config.local_ip) {
        line(out, "localIP", &quote(ip));
    }
    if let Some(port) = positive(config.local_port) {
        line(out, "localPort", &port.to_string());
    }
    if let Some(port) = positive(config.remote_port) {
        line(out, "remotePort", &port.to_string());
    }
    if is_http(&config.proxy_type) {
        if let Some(domain) = non_blank(&config.custom_domain) {
            line(out, "customDomains", &format!("[{}]", quote(domain)));
        }
        if let Some(sub) = non_blank(&config.subdomain) {
            line(out, "subdomain", &quote(sub));
        }
    }
}

fn server(out: &mut String, config: &ProxyConfig) {
    line(out, "bindPort", &config.server_port.to_string());
    if let Some(token) = non_blank(&config.token) {
        line(out, "auth.token", &quote(token));
    }
}

fn line(out: &mut String, key: &str, value: &str) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "{key} = {value}");
}

/// A TOML string literal, escaped by the toml serializer.
fn quote(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn positive(port: Option<u16>) -> Option<u16> {
    port.filter(|p| *p > 0)
}

/// frp's own default applies when the type is blank.
fn proxy_type(config: &ProxyConfig) -> &str {
    match config.proxy_type.trim() {
        "" => "tcp",
        kind => kind,
    }
}

fn is_http(kind: &str) -> bool {
    kind.eq_ignore_ascii_case("http") || kind.eq_ignore_ascii_case("https")
}
