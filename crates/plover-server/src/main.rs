use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use plover_xmpp::im::MessageRelayHandler;
use plover_xmpp::xep::{PingHandler, PrivateStorageHandler};
use plover_xmpp::{MemoryStorage, Phase, PlainAuthenticator, TlsPolicy, XmppServer};
use tracing::{info, warn};

mod config;
mod telemetry;

use config::Config;
use telemetry::LogFormat;

/// Plover XMPP server
#[derive(Debug, Parser)]
#[command(name = "plover-server", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "PLOVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Served domain (overrides config and PLOVER_DOMAIN)
    #[arg(short, long)]
    domain: Option<String>,

    /// Client listener address (overrides config and PLOVER_C2S_ADDR)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// STARTTLS policy (overrides config and PLOVER_TLS)
    #[arg(long)]
    tls: Option<TlsPolicy>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(domain) = &self.domain {
            config.server.domain = domain.clone();
        }
        if let Some(addr) = self.listen {
            config.server.c2s_addr = addr;
        }
        if let Some(policy) = self.tls {
            config.tls.policy = policy;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    info!("Plover server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };
    config.apply_env()?;
    cli.apply(&mut config);
    config.validate()?;
    config.log_config();

    let server = build_server(&config)?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.run().await.context("XMPP server failed")?;

    info!("Plover server stopped");
    Ok(())
}

/// Wire the authenticator and extension modules into a server.
fn build_server(config: &Config) -> Result<XmppServer> {
    let domain = config.server.domain.clone();
    let authenticator = PlainAuthenticator::new(domain, config.credentials());
    let storage = Arc::new(MemoryStorage::new());

    let builder = XmppServer::builder(config.to_server_config());
    let resources = builder.resources();
    let server = builder
        .authenticator(Arc::new(authenticator))
        .module(Phase::Established, MessageRelayHandler::dictionary(resources)?)?
        .module(Phase::Established, PingHandler::dictionary()?)?
        .module(Phase::Established, PrivateStorageHandler::dictionary(storage)?)?
        .build()
        .context("Failed to build XMPP server")?;
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "plover-server",
            "--domain",
            "cli.example",
            "--listen",
            "127.0.0.1:5333",
            "--tls",
            "disabled",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.domain, "cli.example");
        assert_eq!(config.server.c2s_addr.port(), 5333);
        assert_eq!(config.tls.policy, TlsPolicy::Disabled);
    }

    #[test]
    fn test_build_server_without_certificate() {
        let config = Config::parse(
            "[server]\ndomain = \"example.com\"\n\n[[accounts]]\nusername = \"alice\"\npassword = \"secret\"\n",
        )
        .unwrap();
        let server = build_server(&config).unwrap();
        assert_eq!(server.config().domain, "example.com");
        // Optional TLS with nothing to offer is turned off.
        assert_eq!(server.config().session_policy.tls, TlsPolicy::Disabled);
    }

    #[tokio::test]
    async fn test_built_server_relays_messages() {
        use plover_xmpp::registry::RouteHandle;
        use plover_xmpp::{Connection, Entity};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = Config::parse(
            "[server]\ndomain = \"example.com\"\n\n[[accounts]]\nusername = \"alice\"\npassword = \"secret\"\n",
        )
        .unwrap();
        let server = build_server(&config).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        assert!(server.resources().try_register(
            Entity::parse("bob@example.com/laptop").unwrap(),
            RouteHandle::new("bob", tx)
        ));

        let (mut client, transport) = tokio::io::duplex(16 * 1024);
        let connection = Connection::new(transport, server.connection_context());
        let handle = tokio::spawn(connection.run());

        let header = "<stream:stream xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";
        // PLAIN for alice/secret
        let script = [
            header.to_string(),
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHNlY3JldA==</auth>".to_string(),
            header.to_string(),
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>phone</resource></bind></iq>".to_string(),
            "<message type='chat' to='bob@example.com/laptop' id='m1'><body>hi</body></message>".to_string(),
        ];
        let waits = ["</stream:features>", "<success", "</stream:features>", "</iq>"];

        let mut seen = String::new();
        let mut buf = [0u8; 4096];
        for (step, send) in script.iter().enumerate() {
            client.write_all(send.as_bytes()).await.unwrap();
            let Some(wait) = waits.get(step) else { break };
            while !seen.contains(wait) {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0, "closed early: {}", seen);
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            seen.clear();
        }

        let relayed = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.attr("from"), Some("alice@example.com/phone"));
        assert_eq!(relayed.attr("id"), Some("m1"));

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_build_server_rejects_bad_domain() {
        let mut config = Config::default();
        config.server.domain = "not a domain@".to_string();
        assert!(build_server(&config).is_err());
    }
}
