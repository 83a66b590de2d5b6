//! Connection driver: socket I/O around one [`Dispatcher`].
//!
//! Each connection runs as one task. It reads bytes, feeds the parser and
//! hands events to the dispatcher strictly in arrival order, holding a
//! [`WorkerPool`] permit while it does. Writes happen in the order the
//! dispatcher produced them. Deferred handler work runs in a per-connection
//! [`JoinSet`], so it is aborted together with the connection.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{deferred_failure_reply, DeferredWork, DispatchOutcome, Dispatcher, Outbound, ServerShared};
use crate::parser::{ParserEvent, ParserLimits, XmlParser};
use crate::pool::WorkerPool;
use crate::registry::RouteHandle;
use crate::session::{Session, TerminationListener};
use crate::stanza::Stanza;
use crate::types::{SessionState, TerminationCause, Transport};
use crate::XmppError;

const READ_BUFFER_SIZE: usize = 4096;

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Parser limits for every stream on the connection
    pub parser_limits: ParserLimits,
    /// Capacity of the queue of stanzas routed to this session
    pub session_queue_limit: usize,
    /// Deferred tasks in flight before reading pauses
    pub max_deferred_per_session: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            parser_limits: ParserLimits::default(),
            session_queue_limit: 64,
            max_deferred_per_session: 16,
        }
    }
}

/// Everything a connection needs from the server, cloned per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub shared: Arc<ServerShared>,
    pub settings: ConnectionSettings,
    /// `None` when TLS is not configured
    pub tls: Option<TlsAcceptor>,
    pub pool: WorkerPool,
    pub listeners: Arc<[Arc<dyn TerminationListener>]>,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("settings", &self.settings)
            .field("tls", &self.tls.is_some())
            .field("pool", &self.pool)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

enum StreamInner<T> {
    None,
    Plain(T),
    Tls(Box<TlsStream<T>>),
}

impl<T> Default for StreamInner<T> {
    fn default() -> Self {
        Self::None
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> StreamInner<T> {
    fn transport(&self) -> Transport {
        match self {
            Self::Tls(_) => Transport::TcpTls,
            Self::None | Self::Plain(_) => Transport::Tcp,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match self {
            Self::None => Err(XmppError::internal("Stream not initialized")),
            Self::Plain(s) => Ok(s.read(buf).await?),
            Self::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), XmppError> {
        match self {
            Self::None => Err(XmppError::internal("Stream not initialized")),
            Self::Plain(s) => Ok(s.write_all(buf).await?),
            Self::Tls(s) => Ok(s.write_all(buf).await?),
        }
    }

    async fn flush(&mut self) -> Result<(), XmppError> {
        match self {
            Self::None => Err(XmppError::internal("Stream not initialized")),
            Self::Plain(s) => Ok(s.flush().await?),
            Self::Tls(s) => Ok(s.flush().await?),
        }
    }

    async fn shutdown(&mut self) -> Result<(), XmppError> {
        match self {
            Self::None => Ok(()),
            Self::Plain(s) => Ok(s.shutdown().await?),
            Self::Tls(s) => Ok(s.shutdown().await?),
        }
    }
}

/// What woke the connection loop.
enum Wake {
    Shutdown,
    Routed(Stanza),
    Deferred(Result<(Stanza, Result<Vec<Stanza>, XmppError>), JoinError>),
    Read(Result<usize, XmppError>),
}

/// One client connection.
pub struct Connection<T> {
    inner: StreamInner<T>,
    parser: XmlParser,
    dispatcher: Dispatcher,
    routed: mpsc::Receiver<Stanza>,
    pending: VecDeque<ParserEvent>,
    /// Syntax error reported once `pending` has been dispatched
    syntax_failure: Option<XmppError>,
    deferred: JoinSet<(Stanza, Result<Vec<Stanza>, XmppError>)>,
    ctx: ConnectionContext,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(transport: T, ctx: ConnectionContext) -> Self {
        let session_id = ctx.shared.ids.next_id();
        let (tx, rx) = mpsc::channel(ctx.settings.session_queue_limit.max(1));
        let route = RouteHandle::new(&session_id, tx);
        let session = Session::new(session_id, ctx.shared.policy.clone());

        Self {
            inner: StreamInner::Plain(transport),
            parser: XmlParser::new(ctx.settings.parser_limits),
            dispatcher: Dispatcher::new(session, Arc::clone(&ctx.shared), route),
            routed: rx,
            pending: VecDeque::new(),
            syntax_failure: None,
            deferred: JoinSet::new(),
            ctx,
        }
    }

    pub fn session_id(&self) -> &str {
        self.dispatcher.session().id()
    }

    /// Whether the byte stream is currently plain or TLS.
    pub fn transport(&self) -> Transport {
        self.inner.transport()
    }

    /// Drive the connection until the session ends, then clean up.
    #[instrument(name = "xmpp.connection.run", skip(self), fields(session_id = %self.session_id()))]
    pub async fn run(mut self) -> Result<(), XmppError> {
        info!("Connection started");
        let result = self.run_loop().await;

        if let Err(e) = &result {
            warn!(error = %e, "Connection failed");
            self.dispatcher.abort(TerminationCause::Error);
        }
        self.deferred.abort_all();
        if let Err(e) = self.inner.shutdown().await {
            debug!(error = %e, "Transport shutdown failed");
        }

        if let Some((summary, cause)) = self.dispatcher.finish() {
            for listener in self.ctx.listeners.iter() {
                listener.session_terminated(&summary, cause);
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), XmppError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            while let Some(event) = self.pending.pop_front() {
                let outcome = {
                    let _worker = self.ctx.pool.acquire().await?;
                    self.handle_event(event)
                };
                if !self.apply(outcome).await? {
                    return Ok(());
                }
            }

            if let Some(e) = self.syntax_failure.take() {
                let outcome = self.dispatcher.syntax_error(&e);
                self.apply(outcome).await?;
                return Ok(());
            }

            let can_read = self.deferred.len() < self.ctx.settings.max_deferred_per_session;
            let wake = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => Wake::Shutdown,
                Some(stanza) = self.routed.recv() => Wake::Routed(stanza),
                Some(joined) = self.deferred.join_next(), if !self.deferred.is_empty() => Wake::Deferred(joined),
                read = self.inner.read(&mut buf), if can_read => Wake::Read(read),
            };

            match wake {
                Wake::Shutdown => {
                    let outcome = self.dispatcher.shutdown();
                    self.apply(outcome).await?;
                    return Ok(());
                }
                Wake::Routed(stanza) => {
                    if self.dispatcher.session().state() == SessionState::Bound {
                        self.write(&[Outbound::Stanza(stanza)]).await?;
                    } else {
                        debug!("Dropping routed stanza for unbound session");
                    }
                }
                Wake::Deferred(joined) => self.deferred_completed(joined).await?,
                Wake::Read(Ok(0)) => {
                    info!("Peer disconnected");
                    self.dispatcher.abort(TerminationCause::PeerInitiated);
                    return Ok(());
                }
                Wake::Read(Ok(n)) => {
                    let fed = self.parser.push(&buf[..n]);
                    self.pending.extend(fed.events);
                    self.syntax_failure = fed.error;
                }
                Wake::Read(Err(e)) => return Err(e),
            }
        }
    }

    fn handle_event(&mut self, event: ParserEvent) -> DispatchOutcome {
        match event {
            ParserEvent::StreamOpen(header) => self.dispatcher.stream_opened(&header),
            ParserEvent::Stanza(stanza) => self.dispatcher.dispatch(stanza),
            ParserEvent::StreamClose => self.dispatcher.stream_closed(),
        }
    }

    /// Write, spawn and upgrade as `outcome` says. Returns whether to go on.
    async fn apply(&mut self, outcome: DispatchOutcome) -> Result<bool, XmppError> {
        self.write(&outcome.outbound).await?;

        if outcome.is_terminated() {
            // Anything still queued belongs to a dead session.
            self.pending.clear();
            return Ok(false);
        }

        for work in outcome.deferred {
            self.spawn_deferred(work);
        }

        if outcome.upgrade_tls {
            self.upgrade_tls().await?;
            let established = self.dispatcher.tls_established();
            self.write(&established.outbound).await?;
            return Ok(!established.is_terminated());
        }
        Ok(true)
    }

    async fn write(&mut self, items: &[Outbound]) -> Result<(), XmppError> {
        if items.is_empty() {
            return Ok(());
        }
        for item in items {
            let xml = item.to_xml();
            debug!(bytes = xml.len(), "Writing");
            self.inner.write_all(xml.as_bytes()).await?;
        }
        self.inner.flush().await
    }

    fn spawn_deferred(&mut self, work: DeferredWork) {
        let DeferredWork { request, future } = work;
        let run = self.ctx.pool.run(future);
        self.deferred.spawn(async move {
            let result = run.await.and_then(|produced| produced);
            (request, result)
        });
    }

    async fn deferred_completed(
        &mut self,
        joined: Result<(Stanza, Result<Vec<Stanza>, XmppError>), JoinError>,
    ) -> Result<(), XmppError> {
        let (request, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "Deferred task did not complete");
                return Ok(());
            }
        };
        if self.dispatcher.session().state().is_terminal() {
            return Ok(());
        }

        match result {
            Ok(stanzas) => {
                let items: Vec<_> = stanzas.into_iter().map(Outbound::Stanza).collect();
                self.write(&items).await
            }
            Err(e) => {
                warn!(error = %e, id = ?request.id(), "Deferred work failed");
                match deferred_failure_reply(&request, &e) {
                    Some(reply) => self.write(&[Outbound::Stanza(reply)]).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Replace the plain transport with TLS. The parser starts over.
    #[instrument(skip(self), name = "xmpp.connection.starttls")]
    async fn upgrade_tls(&mut self) -> Result<(), XmppError> {
        let acceptor = self
            .ctx
            .tls
            .clone()
            .ok_or_else(|| XmppError::internal("STARTTLS accepted without TLS configuration"))?;

        let plain = match std::mem::take(&mut self.inner) {
            StreamInner::Plain(s) => s,
            StreamInner::Tls(_) => return Err(XmppError::internal("Already using TLS")),
            StreamInner::None => return Err(XmppError::internal("Stream already taken")),
        };

        let tls = acceptor.accept(plain).await?;
        self.inner = StreamInner::Tls(Box::new(tls));
        self.parser.reset();
        // Plaintext sent after <starttls/> is not trusted.
        self.pending.clear();
        self.syntax_failure = None;

        debug!(transport = %self.inner.transport(), "TLS upgrade complete");
        Ok(())
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dispatcher", &self.dispatcher)
            .field("pending", &self.pending.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
