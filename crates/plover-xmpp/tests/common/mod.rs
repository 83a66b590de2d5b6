//! Test utilities for driving whole XMPP connections.
//!
//! Connections run over an in-memory [`tokio::io::duplex`] pipe, so the
//! tests exercise the real parser, dispatcher and connection driver without
//! opening sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use base64::prelude::*;
use plover_xmpp::ids::SequentialIdGenerator;
use plover_xmpp::im::MessageRelayHandler;
use plover_xmpp::xep::{PingHandler, PrivateStorageHandler};
use plover_xmpp::{
    Connection, MemoryStorage, Phase, PlainAuthenticator, SessionPolicy, SessionSummary,
    TerminationCause, TerminationListener, TlsPolicy, XmppError, XmppServer, XmppServerConfig,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Domain served by test servers.
pub const DOMAIN: &str = "example.com";

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const STREAM_HEADER: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    to='example.com' version='1.0'>";

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Records every session termination.
#[derive(Default)]
pub struct RecordingListener {
    pub terminated: Mutex<Vec<(SessionSummary, TerminationCause)>>,
}

impl RecordingListener {
    pub fn causes(&self) -> Vec<TerminationCause> {
        self.terminated
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cause)| *cause)
            .collect()
    }
}

impl TerminationListener for RecordingListener {
    fn session_terminated(&self, summary: &SessionSummary, cause: TerminationCause) {
        self.terminated.lock().unwrap().push((summary.clone(), cause));
    }
}

/// A configured server plus the collaborators tests inspect.
pub struct TestServer {
    pub server: XmppServer,
    pub storage: Arc<MemoryStorage>,
    pub listener: Arc<RecordingListener>,
}

/// Server options used by [`TestServer::with`].
pub struct TestOptions {
    pub tls: TlsPolicy,
    pub cert: Option<(PathBuf, PathBuf)>,
    pub max_deferred_per_session: usize,
    /// Relay messages between bound sessions
    pub relay: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            tls: TlsPolicy::Disabled,
            cert: None,
            max_deferred_per_session: 16,
            relay: false,
        }
    }
}

impl TestServer {
    /// Plaintext server with accounts `alice` and `bob` (password `secret`),
    /// ping and private storage.
    pub fn start() -> Self {
        Self::with(TestOptions::default())
    }

    pub fn with(options: TestOptions) -> Self {
        init_tracing();

        let (tls_cert_path, tls_key_path) = match options.cert {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };
        let config = XmppServerConfig {
            c2s_addr: "127.0.0.1:0".parse().unwrap(),
            domain: DOMAIN.to_string(),
            tls_cert_path,
            tls_key_path,
            session_policy: SessionPolicy {
                tls: options.tls,
                ..Default::default()
            },
            max_deferred_per_session: options.max_deferred_per_session,
            ..Default::default()
        };

        let mut accounts = HashMap::new();
        accounts.insert("alice".to_string(), "secret".to_string());
        accounts.insert("bob".to_string(), "secret".to_string());

        let storage = Arc::new(MemoryStorage::new());
        let listener = Arc::new(RecordingListener::default());
        let mut builder = XmppServer::builder(config)
            .authenticator(Arc::new(PlainAuthenticator::new(DOMAIN, accounts)))
            .id_generator(Arc::new(SequentialIdGenerator::new("test")))
            .termination_listener(listener.clone())
            .module(Phase::Established, PingHandler::dictionary().unwrap())
            .unwrap()
            .module(
                Phase::Established,
                PrivateStorageHandler::dictionary(storage.clone()).unwrap(),
            )
            .unwrap();
        if options.relay {
            let resources = builder.resources();
            builder = builder
                .module(
                    Phase::Established,
                    MessageRelayHandler::dictionary(resources).unwrap(),
                )
                .unwrap();
        }
        let server = builder.build().expect("Failed to build test server");

        Self {
            server,
            storage,
            listener,
        }
    }

    /// Open a connection and run it on its own task.
    pub fn connect(&self) -> (TestClient<DuplexStream>, JoinHandle<Result<(), XmppError>>) {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(server_side, self.server.connection_context());
        let handle = tokio::spawn(connection.run());
        (TestClient::new(client), handle)
    }

    /// Connect, authenticate as `user` and bind `resource`.
    pub async fn login(
        &self,
        user: &str,
        resource: &str,
    ) -> (TestClient<DuplexStream>, JoinHandle<Result<(), XmppError>>) {
        let (mut client, handle) = self.connect();
        client.open_stream().await;
        client.authenticate(user, "secret").await;
        let jid = client.bind(Some(resource)).await;
        assert_eq!(jid, format!("{}@{}/{}", user, DOMAIN, resource));
        (client, handle)
    }
}

/// Raw XML client over any byte stream.
pub struct TestClient<S> {
    stream: S,
    buffer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("Failed to write");
        self.stream.flush().await.expect("Failed to flush");
    }

    /// Send `xml` in chunks of `size` bytes, ignoring character boundaries.
    pub async fn send_chunked(&mut self, xml: &str, size: usize) {
        for chunk in xml.as_bytes().chunks(size) {
            self.stream.write_all(chunk).await.expect("Failed to write");
            self.stream.flush().await.expect("Failed to flush");
        }
    }

    /// Read until `pattern` arrives; returns everything up to and including it.
    pub async fn read_until(&mut self, pattern: &str) -> String {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(pos) = self.buffer.find(pattern) {
                let end = pos + pattern.len();
                let out = self.buffer[..end].to_string();
                self.buffer.drain(..end);
                return out;
            }
            let n = timeout(DEFAULT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("Timed out waiting for {:?}, got {:?}", pattern, self.buffer))
                .expect("Failed to read");
            if n == 0 {
                panic!("Stream closed waiting for {:?}, got {:?}", pattern, self.buffer);
            }
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Read until the server closes the transport; returns everything unread.
    pub async fn read_to_end(&mut self) -> String {
        let mut rest = Vec::new();
        timeout(DEFAULT_TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("Timed out waiting for close")
            .expect("Failed to read");
        let mut out = std::mem::take(&mut self.buffer);
        out.push_str(&String::from_utf8_lossy(&rest));
        out
    }

    /// Open (or restart) the stream; returns the features.
    pub async fn open_stream(&mut self) -> String {
        self.send(STREAM_HEADER).await;
        self.read_until("<stream:stream").await;
        self.read_until("</stream:features>").await
    }

    /// SASL PLAIN, then the stream restart.
    pub async fn authenticate(&mut self, user: &str, password: &str) {
        self.send(&plain_auth(user, password)).await;
        self.read_until("<success").await;
        self.open_stream().await;
    }

    /// Bind a resource; returns the full JID the server assigned.
    pub async fn bind(&mut self, resource: Option<&str>) -> String {
        let request = match resource {
            Some(resource) => format!(
                "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <resource>{}</resource></bind></iq>",
                resource
            ),
            None => "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>"
                .to_string(),
        };
        self.send(&request).await;
        let reply = self.read_until("</iq>").await;
        let start = reply.find("<jid>").expect("No jid in bind result") + "<jid>".len();
        let end = reply.find("</jid>").expect("No jid in bind result");
        reply[start..end].to_string()
    }

    /// Whatever was read but not yet consumed.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn into_inner(self) -> S {
        assert!(self.buffer.is_empty(), "Unconsumed input: {:?}", self.buffer);
        self.stream
    }
}

/// `<auth mechanism='PLAIN'>` for `user`.
pub fn plain_auth(user: &str, password: &str) -> String {
    let payload = BASE64_STANDARD.encode(format!("\0{}\0{}", user, password));
    format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        payload
    )
}

/// Wait for a connection task and return its result.
pub async fn finished(handle: JoinHandle<Result<(), XmppError>>) -> Result<(), XmppError> {
    timeout(DEFAULT_TIMEOUT, handle)
        .await
        .expect("Connection did not finish")
        .expect("Connection task panicked")
}
