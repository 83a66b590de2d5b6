//! Serialization and parsing agree with each other on the wire.

use plover_xmpp::parser::{ParserEvent, XmlParser};
use plover_xmpp::{ns, ParserLimits, Stanza, StanzaBuilder};

const HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

fn parse(bytes: &[u8], chunk: usize) -> Vec<ParserEvent> {
    let mut parser = XmlParser::new(ParserLimits::default());
    let mut events = Vec::new();
    for piece in bytes.chunks(chunk) {
        events.extend(parser.feed(piece).unwrap());
    }
    events
}

fn disco_item() -> Stanza {
    let mut builder = StanzaBuilder::iq("result", "items_1");
    builder
        .start("query", "http://jabber.org/protocol/disco#items")
        .unwrap()
        .start("item", "http://jabber.org/protocol/disco#items")
        .unwrap()
        .attribute("node", "x")
        .unwrap()
        .attribute("jid", "y")
        .unwrap()
        .start("note", "urn:example:note")
        .unwrap()
        .text("\u{263A} & <more>")
        .unwrap()
        .end()
        .unwrap()
        .end()
        .unwrap()
        .end()
        .unwrap();
    builder.build().unwrap()
}

#[test]
fn test_built_stanza_survives_the_wire() {
    let original = disco_item();
    let wire = format!(
        "{}{}",
        HEADER,
        original
            .element()
            .render_in_stream(ns::JABBER_CLIENT, &[("stream", ns::STREAM)])
    );

    let whole = parse(wire.as_bytes(), wire.len());
    assert_eq!(whole.len(), 2);
    let parsed = match &whole[1] {
        ParserEvent::Stanza(stanza) => stanza,
        other => panic!("expected a stanza, got {:?}", other),
    };
    assert_eq!(parsed, &original);

    let item = parsed.first_child().unwrap().first_child().unwrap();
    let names: Vec<_> = item.attributes().iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["node", "jid"]);
    assert_eq!(item.child_elements().count(), 1);

    // Every split point, including inside the multi-byte character.
    for chunk in [1, 2, 3, 4, 13] {
        assert_eq!(parse(wire.as_bytes(), chunk), whole, "chunk size {}", chunk);
    }
}
