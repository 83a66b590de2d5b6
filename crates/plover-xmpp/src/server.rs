//! XMPP server implementation.
//!
//! The server listens on TCP port 5222 for client-to-server (C2S)
//! connections. Each accepted socket becomes a [`Connection`] task sharing
//! the sealed handler table, the resource registry and the worker pool.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::connection::{Connection, ConnectionContext, ConnectionSettings};
use crate::dispatch::ServerShared;
use crate::entity::Entity;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::negotiation::{register_core_handlers, Authenticator};
use crate::parser::ParserLimits;
use crate::pool::{WorkerPool, DEFAULT_WORKERS};
use crate::registry::{HandlerLookupBuilder, NamespaceDictionary, Phase, ResourceRegistry};
use crate::session::{SessionPolicy, TerminationListener};
use crate::types::TlsPolicy;
use crate::XmppError;

/// How often routes of vanished sessions are swept.
const ROUTE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub c2s_addr: SocketAddr,
    /// Server domain (e.g., "example.com")
    pub domain: String,
    /// TLS certificate path (PEM format)
    pub tls_cert_path: Option<PathBuf>,
    /// TLS private key path (PEM format)
    pub tls_key_path: Option<PathBuf>,
    /// Negotiation policy for every session
    pub session_policy: SessionPolicy,
    /// Parser limits for every stream
    pub parser_limits: ParserLimits,
    /// Dispatches and deferred tasks executing at once, across all sessions
    pub worker_threads: usize,
    /// Capacity of each session's routed-stanza queue
    pub session_queue_limit: usize,
    /// Deferred tasks in flight per session before reading pauses
    pub max_deferred_per_session: usize,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        let connection = ConnectionSettings::default();
        Self {
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            domain: "localhost".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            session_policy: SessionPolicy::default(),
            parser_limits: connection.parser_limits,
            worker_threads: DEFAULT_WORKERS,
            session_queue_limit: connection.session_queue_limit,
            max_deferred_per_session: connection.max_deferred_per_session,
        }
    }
}

impl XmppServerConfig {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            parser_limits: self.parser_limits,
            session_queue_limit: self.session_queue_limit,
            max_deferred_per_session: self.max_deferred_per_session,
        }
    }
}

/// Assembles an [`XmppServer`]: authenticator, extension modules, listeners.
pub struct XmppServerBuilder {
    config: XmppServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    lookup: HandlerLookupBuilder,
    resources: Arc<ResourceRegistry>,
    ids: Arc<dyn IdGenerator>,
    listeners: Vec<Arc<dyn TerminationListener>>,
}

impl XmppServerBuilder {
    pub fn new(config: XmppServerConfig) -> Self {
        Self {
            config,
            authenticator: None,
            lookup: HandlerLookupBuilder::new(),
            resources: Arc::new(ResourceRegistry::new()),
            ids: Arc::new(UuidGenerator),
            listeners: Vec::new(),
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Attach an extension module's dictionary.
    pub fn module(mut self, phase: Phase, dictionary: NamespaceDictionary) -> Result<Self, XmppError> {
        self.lookup.add(phase, dictionary)?;
        Ok(self)
    }

    /// Attach a component's dictionary under `domain`.
    pub fn component(mut self, domain: &str, dictionary: NamespaceDictionary) -> Result<Self, XmppError> {
        self.lookup.add_component(domain, dictionary)?;
        Ok(self)
    }

    pub fn termination_listener(mut self, listener: Arc<dyn TerminationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// The registry modules use to deliver stanzas to bound sessions.
    pub fn resources(&self) -> Arc<ResourceRegistry> {
        Arc::clone(&self.resources)
    }

    /// Load TLS material, register the negotiation handlers and seal everything.
    pub fn build(self) -> Result<XmppServer, XmppError> {
        let mut config = self.config;
        let server = Entity::domain_only(&config.domain)
            .map_err(|e| XmppError::config(format!("invalid domain '{}': {}", config.domain, e)))?;

        let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
            _ if config.session_policy.tls == TlsPolicy::Disabled => None,
            (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
            _ if config.session_policy.tls == TlsPolicy::Required => {
                return Err(XmppError::config(
                    "TLS is required but no certificate and key are configured",
                ));
            }
            _ => {
                warn!("No TLS certificate configured, STARTTLS disabled");
                config.session_policy.tls = TlsPolicy::Disabled;
                None
            }
        };

        let authenticator = self
            .authenticator
            .ok_or_else(|| XmppError::config("no authenticator configured"))?;
        let mut lookup = self.lookup;
        register_core_handlers(
            &mut lookup,
            authenticator,
            Arc::clone(&self.resources),
            Arc::clone(&self.ids),
        )?;

        let shared = Arc::new(ServerShared {
            lookup: lookup.build(),
            server,
            policy: config.session_policy.clone(),
            resources: self.resources,
            ids: self.ids,
        });

        info!(
            domain = %config.domain,
            tls = ?config.session_policy.tls,
            workers = config.worker_threads,
            "XMPP server configured"
        );

        Ok(XmppServer {
            pool: WorkerPool::new(config.worker_threads),
            config,
            shared,
            tls_acceptor,
            listeners: self.listeners.into(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// XMPP server instance.
pub struct XmppServer {
    config: XmppServerConfig,
    shared: Arc<ServerShared>,
    tls_acceptor: Option<TlsAcceptor>,
    pool: WorkerPool,
    listeners: Arc<[Arc<dyn TerminationListener>]>,
    shutdown: CancellationToken,
}

impl XmppServer {
    pub fn builder(config: XmppServerConfig) -> XmppServerBuilder {
        XmppServerBuilder::new(config)
    }

    /// Get the server configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// Get the resource registry.
    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.shared.resources
    }

    /// Cancelling this token stops the server and ends every session with
    /// cause `administrative`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// What a single connection needs, for driving one without a listener.
    pub fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            shared: Arc::clone(&self.shared),
            settings: self.config.connection_settings(),
            tls: self.tls_acceptor.clone(),
            pool: self.pool.clone(),
            listeners: Arc::clone(&self.listeners),
            shutdown: self.shutdown.child_token(),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<(), XmppError> {
        let listener = TcpListener::bind(&self.config.c2s_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until the shutdown token fires,
    /// then wait for every session to close.
    pub async fn serve(self, listener: TcpListener) -> Result<(), XmppError> {
        info!(addr = ?listener.local_addr().ok(), domain = %self.config.domain, "XMPP C2S server listening");

        let mut connections = JoinSet::new();
        let mut sweep = tokio::time::interval(ROUTE_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.shared.resources.cleanup_stale();
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept C2S connection");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let connection = Connection::new(stream, self.connection_context());
                    let transport = connection.transport();
                    connections.spawn(
                        async move {
                            if let Err(e) = connection.run().await {
                                warn!(error = %e, "Connection error");
                            }
                        }
                        .instrument(info_span!(
                            "xmpp.connection.lifecycle",
                            client_ip = %peer_addr,
                            transport = %transport,
                        )),
                    );
                }
            }

            // Reap finished connections.
            while connections.try_join_next().is_some() {}
        }

        info!(active = connections.len(), "Shutting down, closing sessions");
        while connections.join_next().await.is_some() {}
        self.pool.close();
        info!("XMPP server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for XmppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppServer")
            .field("config", &self.config)
            .field("tls", &self.tls_acceptor.is_some())
            .field("resources", &self.shared.resources)
            .finish()
    }
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, private_key};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::ServerConfig;

    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config(format!(
            "No certificate found in {}",
            cert_path.display()
        )));
    }

    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| XmppError::config(format!("Failed to read key file: {}", e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

    info!(cert = %cert_path.display(), "TLS configured");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
