//! End-to-end stream negotiation over an in-memory transport.

mod common;

use common::{finished, plain_auth, TestOptions, TestServer, STREAM_HEADER};
use plover_xmpp::{Entity, TerminationCause};

#[tokio::test]
async fn test_features_before_authentication() {
    let server = TestServer::start();
    let (mut client, _handle) = server.connect();

    client.send(STREAM_HEADER).await;
    let header = client.read_until("<stream:stream").await;
    assert!(header.starts_with("<?xml version='1.0'?>"));

    let features = client.read_until("</stream:features>").await;
    assert!(features.contains("from='example.com'"));
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    assert!(!features.contains("starttls"));
}

#[tokio::test]
async fn test_full_negotiation_and_close() {
    let server = TestServer::start();
    let (mut client, handle) = server.login("alice", "phone").await;
    assert!(server
        .server
        .resources()
        .is_bound(&Entity::parse("alice@example.com/phone").unwrap()));

    client
        .send("<iq type='set' id='sess_1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>")
        .await;
    let reply = client.read_until("id='sess_1'").await;
    assert!(reply.contains("<iq type='result'"));

    client.send("</stream:stream>").await;
    assert!(client.read_to_end().await.contains("</stream:stream>"));
    finished(handle).await.unwrap();

    assert_eq!(server.listener.causes(), vec![TerminationCause::PeerInitiated]);
    assert!(server.server.resources().is_empty());
}

#[tokio::test]
async fn test_message_before_auth_is_policy_violation() {
    let server = TestServer::with(TestOptions {
        relay: true,
        ..Default::default()
    });
    let (mut bob, _bob_handle) = server.login("bob", "laptop").await;

    let (mut client, handle) = server.connect();
    client.open_stream().await;
    client
        .send("<message to='bob@example.com/laptop' type='chat'><body>early</body></message>")
        .await;

    let rest = client.read_to_end().await;
    assert!(rest.contains("<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"));
    assert!(rest.ends_with("</stream:stream>"));
    finished(handle).await.unwrap();
    assert_eq!(server.listener.causes(), vec![TerminationCause::PolicyViolation]);

    // The relay never saw the message.
    bob.send("<iq type='get' id='ping_1' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await;
    let next = bob.read_until("id='ping_1'").await;
    assert!(!next.contains("early"));
}

#[tokio::test]
async fn test_byte_at_a_time_negotiation() {
    let server = TestServer::start();
    let (mut client, _handle) = server.connect();

    client.send_chunked(STREAM_HEADER, 1).await;
    client.read_until("</stream:features>").await;

    client.send_chunked(&plain_auth("alice", "secret"), 1).await;
    client.read_until("<success").await;
    client.open_stream().await;

    client
        .send_chunked(
            "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>caf\u{e9}</resource></bind></iq>",
            1,
        )
        .await;
    let reply = client.read_until("</iq>").await;
    assert!(reply.contains("<jid>alice@example.com/caf\u{e9}</jid>"));
}

#[tokio::test]
async fn test_auth_attempts_exhausted() {
    let server = TestServer::start();
    let (mut client, handle) = server.connect();
    client.open_stream().await;

    for _ in 0..2 {
        client.send(&plain_auth("alice", "wrong")).await;
        let failure = client.read_until("</failure>").await;
        assert!(failure.contains("<not-authorized/>"));
    }
    client.send(&plain_auth("alice", "wrong")).await;

    let rest = client.read_to_end().await;
    assert!(rest.contains("<not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
    finished(handle).await.unwrap();
    assert_eq!(server.listener.causes(), vec![TerminationCause::PolicyViolation]);
}

#[tokio::test]
async fn test_resource_conflict_generates_resource() {
    let server = TestServer::start();
    let (_first, _first_handle) = server.login("alice", "phone").await;

    let (mut second, _second_handle) = server.connect();
    second.open_stream().await;
    second.authenticate("alice", "secret").await;
    let jid = second.bind(Some("phone")).await;

    assert!(jid.starts_with("alice@example.com/plover-test-"));
    assert_eq!(server.server.resources().len(), 2);
}

#[tokio::test]
async fn test_bind_without_resource() {
    let server = TestServer::start();
    let (mut client, _handle) = server.connect();
    client.open_stream().await;
    client.authenticate("bob", "secret").await;

    let jid = client.bind(None).await;
    assert!(jid.starts_with("bob@example.com/plover-test-"));
}

#[tokio::test]
async fn test_malformed_xml_closes_stream() {
    let server = TestServer::start();
    let (mut client, handle) = server.connect();
    client.open_stream().await;

    client.send("<message><body>hi</message>").await;
    let rest = client.read_to_end().await;
    assert!(rest.contains("<not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
    finished(handle).await.unwrap();
    assert_eq!(server.listener.causes(), vec![TerminationCause::Error]);
}

#[tokio::test]
async fn test_stanza_ahead_of_malformed_xml_is_answered() {
    let server = TestServer::start();
    let (mut client, handle) = server.login("alice", "phone").await;

    // One write: a complete ping, then a mismatched end tag.
    client
        .send(
            "<iq type='get' id='ping_7' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>\
             <message><body>hi</message>",
        )
        .await;
    let rest = client.read_to_end().await;
    let reply = rest.find("id='ping_7'").expect("ping was not answered");
    let error = rest
        .find("<not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>")
        .expect("no stream error");
    assert!(reply < error);
    finished(handle).await.unwrap();
    assert_eq!(server.listener.causes(), vec![TerminationCause::Error]);
}

#[tokio::test]
async fn test_comment_is_restricted_xml() {
    let server = TestServer::start();
    let (mut client, _handle) = server.connect();
    client.open_stream().await;

    client.send("<!-- hello -->").await;
    let rest = client.read_to_end().await;
    assert!(rest.contains("<restricted-xml xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
}

#[tokio::test]
async fn test_wrong_namespace_rejected() {
    let server = TestServer::start();
    let (mut client, _handle) = server.connect();

    client
        .send(
            "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
             to='example.com' version='1.0'>",
        )
        .await;
    let rest = client.read_to_end().await;
    assert!(rest.contains("<stream:stream"));
    assert!(rest.contains("<invalid-namespace xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
}

#[tokio::test]
async fn test_peer_disconnect_releases_resource() {
    let server = TestServer::start();
    let (client, handle) = server.login("alice", "phone").await;

    drop(client);
    finished(handle).await.unwrap();
    assert_eq!(server.listener.causes(), vec![TerminationCause::PeerInitiated]);
    assert!(server.server.resources().is_empty());
}

#[tokio::test]
async fn test_shutdown_ends_sessions() {
    let server = TestServer::start();
    let (mut client, handle) = server.login("alice", "phone").await;

    server.server.shutdown_token().cancel();
    let rest = client.read_to_end().await;
    assert!(rest.contains("<system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
    assert!(rest.ends_with("</stream:stream>"));
    finished(handle).await.unwrap();

    let terminated = server.listener.terminated.lock().unwrap();
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].1, TerminationCause::Administrative);
    assert_eq!(
        terminated[0].0.entity,
        Some(Entity::parse("alice@example.com/phone").unwrap())
    );
}
