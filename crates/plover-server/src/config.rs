//! Server configuration.
//!
//! Loaded from a TOML file, then overridden by `PLOVER_*` environment
//! variables, then by command-line flags.
//!
//! # Environment Variables
//!
//! - `PLOVER_DOMAIN`: Served domain
//! - `PLOVER_C2S_ADDR`: Client listener address (e.g. `0.0.0.0:5222`)
//! - `PLOVER_TLS`: `disabled`, `optional` or `required`

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use plover_xmpp::{ParserLimits, SessionPolicy, TlsPolicy, XmppServerConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Listener and per-session limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Served domain
    pub domain: String,
    /// Address for client-to-server connections
    pub c2s_addr: SocketAddr,
    /// Dispatches and deferred tasks executing at once
    pub worker_threads: usize,
    /// Capacity of each session's routed-stanza queue
    pub session_queue_limit: usize,
    /// Deferred tasks in flight per session before reading pauses
    pub max_deferred_per_session: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let core = XmppServerConfig::default();
        Self {
            domain: core.domain,
            c2s_addr: core.c2s_addr,
            worker_threads: core.worker_threads,
            session_queue_limit: core.session_queue_limit,
            max_deferred_per_session: core.max_deferred_per_session,
        }
    }
}

/// STARTTLS material and policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub policy: TlsPolicy,
    /// Certificate chain (PEM)
    pub cert_path: Option<PathBuf>,
    /// Private key (PEM)
    pub key_path: Option<PathBuf>,
}

/// A statically configured account for SASL PLAIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
}

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub tls: TlsSection,
    /// SASL attempts and mechanisms; the TLS policy comes from `[tls]`
    pub session: SessionPolicy,
    pub limits: ParserLimits,
    pub accounts: Vec<Account>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PLOVER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `PLOVER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup("PLOVER_DOMAIN") {
            self.server.domain = domain;
        }
        if let Some(addr) = lookup("PLOVER_C2S_ADDR") {
            self.server.c2s_addr = addr
                .parse()
                .with_context(|| format!("Invalid PLOVER_C2S_ADDR: {}", addr))?;
        }
        if let Some(policy) = lookup("PLOVER_TLS") {
            self.tls.policy = policy
                .parse()
                .with_context(|| format!("Invalid PLOVER_TLS: {}", policy))?;
        }
        Ok(())
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server.domain.trim().is_empty() {
            bail!("server.domain must not be empty");
        }
        if self.tls.policy == TlsPolicy::Required
            && (self.tls.cert_path.is_none() || self.tls.key_path.is_none())
        {
            bail!("tls.policy = \"required\" needs tls.cert_path and tls.key_path");
        }
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.username.is_empty() {
                bail!("accounts must have a username");
            }
            if !seen.insert(account.username.as_str()) {
                bail!("account '{}' is configured twice", account.username);
            }
        }
        Ok(())
    }

    /// Username to password, for the PLAIN authenticator.
    pub fn credentials(&self) -> HashMap<String, String> {
        self.accounts
            .iter()
            .map(|a| (a.username.clone(), a.password.clone()))
            .collect()
    }

    pub fn to_server_config(&self) -> XmppServerConfig {
        XmppServerConfig {
            c2s_addr: self.server.c2s_addr,
            domain: self.server.domain.clone(),
            tls_cert_path: self.tls.cert_path.clone(),
            tls_key_path: self.tls.key_path.clone(),
            session_policy: SessionPolicy {
                tls: self.tls.policy,
                ..self.session.clone()
            },
            parser_limits: self.limits,
            worker_threads: self.server.worker_threads,
            session_queue_limit: self.server.session_queue_limit,
            max_deferred_per_session: self.server.max_deferred_per_session,
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            domain = %self.server.domain,
            c2s_addr = %self.server.c2s_addr,
            tls = ?self.tls.policy,
            workers = self.server.worker_threads,
            accounts = self.accounts.len(),
            "Effective configuration"
        );
        if self.accounts.is_empty() {
            warn!("No accounts configured, every login will fail");
        }
    }
}
