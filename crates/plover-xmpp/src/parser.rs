//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per session: the
//! `<stream:stream>` root is opened once and only closed when the session
//! ends, and every top-level child is a stanza. [`XmlParser`] consumes bytes
//! as they arrive, in chunks of any size, and emits [`ParserEvent`]s.
//!
//! Tokenizing is done by [`rxml::RawParser`], which resumes anywhere inside
//! a token, normalizes line ends and rejects comments, processing
//! instructions and DTDs. This module adds what XMPP needs on top: namespace
//! scoping, the stream root, stream restarts and the resource limits.
//!
//! Any syntax error is permanent: the parser stays failed and every later
//! call returns [`XmppError::XmlSyntax`]. There is no resynchronization.

use std::io;

use rxml::{Options, Parse, RawEvent, RawParser, WithOptions};
use serde::{Deserialize, Serialize};

use crate::stanza::{Stanza, StanzaBuilder};
use crate::{StreamErrorCondition, XmppError};

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error condition namespace
    pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// The namespace bound to the reserved `xml` prefix
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// Resource limits applied to every parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserLimits {
    /// Largest accepted top-level stanza (or stream header), in bytes
    pub max_stanza_bytes: usize,
    /// Deepest accepted element nesting, counting the stream root
    pub max_depth: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_stanza_bytes: 262_144,
            max_depth: 64,
        }
    }
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// The default (content) namespace declared on the stream root
    pub namespace: Option<String>,
}

impl StreamHeader {
    /// Validate the stream header per RFC 6120.
    ///
    /// Returns the stream error to send when the header is unacceptable.
    pub fn validate(&self) -> Result<(), StreamErrorCondition> {
        // Version should be 1.x for RFC 6120
        if let Some(ref version) = self.version {
            let major = version.split('.').next().unwrap_or_default();
            if major != "1" {
                return Err(StreamErrorCondition::UnsupportedVersion);
            }
        }
        match self.namespace.as_deref() {
            Some(ns::JABBER_CLIENT) => Ok(()),
            _ => Err(StreamErrorCondition::InvalidNamespace),
        }
    }

    /// Render the server's response header.
    pub fn response(stream_id: &str, domain: &str, lang: Option<&str>) -> String {
        let mut out = format!(
            "<?xml version='1.0'?>\
            <stream:stream xmlns='{}' \
            xmlns:stream='{}' \
            id='{}' from='{}' version='1.0'",
            ns::JABBER_CLIENT,
            ns::STREAM,
            crate::stanza::escape(stream_id),
            crate::stanza::escape(domain)
        );
        if let Some(lang) = lang {
            out.push_str(&format!(" xml:lang='{}'", crate::stanza::escape(lang)));
        }
        out.push('>');
        out
    }

    fn from_attributes(attributes: &[(String, String)], namespace: Option<String>) -> Self {
        let get = |name: &str| {
            attributes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        Self {
            to: get("to"),
            from: get("from"),
            id: get("id"),
            version: get("version"),
            lang: get("xml:lang"),
            namespace,
        }
    }
}

/// Something the parser recognized in the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A `<stream:stream>` start tag (initial or restart)
    StreamOpen(StreamHeader),
    /// A complete top-level child of the stream root
    Stanza(Stanza),
    /// `</stream:stream>`
    StreamClose,
}

/// Result of [`XmlParser::push`].
#[derive(Debug, Default)]
pub struct Feed {
    /// Events completed before parsing stopped, in input order
    pub events: Vec<ParserEvent>,
    /// The error that stopped parsing, if any
    pub error: Option<XmppError>,
}

/// Coarse parser position, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    /// Nothing consumed yet
    Init,
    /// Consumed prolog input, stream root not yet open
    Prolog,
    /// Inside the stream root
    Stream,
    /// Failed permanently
    Error,
}

/// Upper bound for a single name, attribute value or text chunk held by the
/// tokenizer. Longer text is delivered in pieces.
const MAX_TOKEN_BYTES: usize = 8192;
const MIN_TOKEN_BYTES: usize = 64;
const BOM: &[u8] = b"\xEF\xBB\xBF";
const XML_DECL: &[u8] = b"<?xml";

/// A start tag whose attributes are still arriving.
#[derive(Debug)]
struct StartTag {
    name: String,
    attrs: Vec<(String, String)>,
}

/// An element whose end tag has not been seen yet.
#[derive(Debug)]
struct OpenElement {
    default_ns: Option<String>,
    prefixes: Vec<(String, String)>,
}

/// What the bytes at a stanza boundary turned out to be.
enum Boundary {
    /// Too few bytes to tell
    NeedMore,
    /// A new stream header replacing the current root
    Restart,
    /// Anything else, handed to the tokenizer
    Content,
}

/// Incremental XML parser for XMPP streams.
pub struct XmlParser {
    limits: ParserLimits,
    tokenizer: RawParser,
    /// Bytes received but not yet handed to the tokenizer
    input: Vec<u8>,
    started: bool,
    /// Between top-level elements, with nothing buffered in the tokenizer
    at_boundary: bool,
    /// `<` plus the qualified name of the current stream root
    root_tag: Vec<u8>,
    failure: Option<String>,
    tag: Option<StartTag>,
    open: Vec<OpenElement>,
    builder: Option<StanzaBuilder>,
    stanza_bytes: usize,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            tokenizer: tokenizer(limits),
            input: Vec::new(),
            started: false,
            at_boundary: false,
            root_tag: Vec::new(),
            failure: None,
            tag: None,
            open: Vec::new(),
            builder: None,
            stanza_bytes: 0,
        }
    }

    /// Feed data into the parser and collect what it completed.
    ///
    /// Incomplete input is retained for the next call. When the input turns
    /// out to be malformed, the events completed before the fault are still
    /// returned and the error is reported by the following call.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ParserEvent>, XmppError> {
        let Feed { events, error } = self.push(data);
        match error {
            Some(e) if events.is_empty() => Err(e),
            _ => Ok(events),
        }
    }

    /// Feed data into the parser, returning completed events and the error
    /// that stopped parsing together.
    pub fn push(&mut self, data: &[u8]) -> Feed {
        let mut feed = Feed::default();
        if let Some(reason) = &self.failure {
            feed.error = Some(XmppError::xml_syntax(format!(
                "parser is in error state: {}",
                reason
            )));
            return feed;
        }

        self.input.extend_from_slice(data);
        if let Err(e) = self.drain(&mut feed.events) {
            self.failure = Some(e.to_string());
            self.input.clear();
            self.builder = None;
            self.tag = None;
            feed.error = Some(e);
        }
        feed
    }

    /// Return the parser to its initial state.
    ///
    /// Used when the underlying byte stream is replaced (after STARTTLS).
    pub fn reset(&mut self) {
        *self = Self::new(self.limits);
    }

    /// Whether the parser has failed permanently.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn phase(&self) -> ParserPhase {
        if self.failure.is_some() {
            ParserPhase::Error
        } else if !self.open.is_empty() {
            ParserPhase::Stream
        } else if self.started {
            ParserPhase::Prolog
        } else {
            ParserPhase::Init
        }
    }

    /// Current element depth, counting the stream root.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Run the tokenizer over buffered input until it needs more bytes.
    fn drain(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), XmppError> {
        if !self.started {
            if self.input.len() < BOM.len() && BOM.starts_with(&self.input) {
                return Ok(());
            }
            if self.input.starts_with(BOM) {
                self.input.drain(..BOM.len());
            }
            self.started = true;
        }

        loop {
            if self.at_boundary {
                match self.classify_boundary() {
                    Boundary::NeedMore => return Ok(()),
                    Boundary::Restart => {
                        // The new header is parsed as a fresh document.
                        self.tokenizer = tokenizer(self.limits);
                        self.open.clear();
                        self.stanza_bytes = 0;
                    }
                    Boundary::Content => {}
                }
                self.at_boundary = false;
            }

            let mut rest: &[u8] = &self.input;
            let before = rest.len();
            let result = self.tokenizer.parse(&mut rest, false);
            let consumed = before - rest.len();
            self.input.drain(..consumed);

            self.stanza_bytes += consumed;
            if self.stanza_bytes > self.limits.max_stanza_bytes {
                return Err(syntax(format!(
                    "stanza exceeds {} bytes",
                    self.limits.max_stanza_bytes
                )));
            }

            match result {
                Ok(Some(event)) => self.handle(event, events)?,
                Ok(None) => return Ok(()),
                Err(rxml::Error::IO(e)) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(xml_error(e)),
            }
        }
    }

    /// Skip keepalive whitespace and look for a stream restart.
    fn classify_boundary(&mut self) -> Boundary {
        let blank = self
            .input
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.input.drain(..blank);
        if self.input.is_empty() {
            return Boundary::NeedMore;
        }

        for pattern in [XML_DECL, self.root_tag.as_slice()] {
            if pattern.is_empty() {
                continue;
            }
            if self.input.len() <= pattern.len() && pattern.starts_with(&self.input) {
                return Boundary::NeedMore;
            }
            if self.input.starts_with(pattern) {
                let next = self.input[pattern.len()];
                if next.is_ascii_whitespace() || next == b'>' || next == b'/' {
                    return Boundary::Restart;
                }
            }
        }
        Boundary::Content
    }

    fn handle(&mut self, event: RawEvent, events: &mut Vec<ParserEvent>) -> Result<(), XmppError> {
        match event {
            RawEvent::XmlDeclaration(..) => Ok(()),
            RawEvent::ElementHeadOpen(_, (prefix, local)) => {
                if self.open.len() >= self.limits.max_depth {
                    return Err(syntax(format!(
                        "element nesting exceeds {}",
                        self.limits.max_depth
                    )));
                }
                self.tag = Some(StartTag {
                    name: qualified(prefix.as_ref().map(|p| p.as_str()), local.as_str()),
                    attrs: Vec::new(),
                });
                Ok(())
            }
            RawEvent::Attribute(_, (prefix, local), value) => {
                let name = qualified(prefix.as_ref().map(|p| p.as_str()), local.as_str());
                let tag = self
                    .tag
                    .as_mut()
                    .ok_or_else(|| XmppError::internal("attribute outside of a start tag"))?;
                if tag.attrs.iter().any(|(n, _)| *n == name) {
                    return Err(syntax(format!("duplicate attribute '{}'", name)));
                }
                tag.attrs.push((name, value));
                Ok(())
            }
            RawEvent::ElementHeadClose(_) => self.finish_start_tag(events),
            RawEvent::ElementFoot(_) => self.finish_element(events),
            RawEvent::Text(_, text) => self.character_data(&text),
        }
    }

    fn character_data(&mut self, text: &str) -> Result<(), XmppError> {
        if self.open.len() >= 2 {
            self.builder_mut()?.text(text).map_err(builder_error)?;
            Ok(())
        } else if text.chars().all(char::is_whitespace) {
            Ok(())
        } else {
            Err(syntax("character data outside of a stanza"))
        }
    }

    fn builder_mut(&mut self) -> Result<&mut StanzaBuilder, XmppError> {
        self.builder
            .as_mut()
            .ok_or_else(|| XmppError::internal("no stanza under construction"))
    }

    fn lookup_prefix(&self, prefix: &str, local: &[(String, String)]) -> Option<String> {
        if prefix == "xml" {
            return Some(ns::XML.to_string());
        }
        local
            .iter()
            .chain(self.open.iter().rev().flat_map(|e| e.prefixes.iter()))
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.clone())
    }

    fn inherited_default_ns(&self) -> Option<String> {
        self.open.iter().rev().find_map(|e| e.default_ns.clone())
    }

    fn finish_start_tag(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), XmppError> {
        let StartTag { name, attrs } = self
            .tag
            .take()
            .ok_or_else(|| XmppError::internal("start tag closed twice"))?;

        let mut default_ns = None;
        let mut prefixes = Vec::new();
        let mut attributes = Vec::with_capacity(attrs.len());
        for (attr, value) in attrs {
            if attr == "xmlns" {
                default_ns = Some(value);
            } else if let Some(prefix) = attr.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(syntax(format!("invalid namespace declaration '{}'", attr)));
                }
                prefixes.push((prefix.to_string(), value));
            } else {
                attributes.push((attr, value));
            }
        }

        let (prefix, local) = split_qname(&name);
        let namespace = match prefix {
            Some(prefix) => self
                .lookup_prefix(prefix, &prefixes)
                .ok_or_else(|| syntax(format!("unbound prefix '{}'", prefix)))?,
            None => default_ns
                .clone()
                .or_else(|| self.inherited_default_ns())
                .unwrap_or_default(),
        };
        for (attr, _) in &attributes {
            if let (Some(prefix), _) = split_qname(attr) {
                if self.lookup_prefix(prefix, &prefixes).is_none() {
                    return Err(syntax(format!("unbound prefix '{}'", prefix)));
                }
            }
        }

        let is_stream_root = namespace == ns::STREAM && local == "stream";
        match self.open.len() {
            0 if is_stream_root => {
                let content_ns = default_ns.clone();
                let header = StreamHeader::from_attributes(&attributes, content_ns);
                self.open.push(OpenElement {
                    default_ns,
                    prefixes,
                });
                self.root_tag = format!("<{}", name).into_bytes();
                self.stanza_bytes = 0;
                self.at_boundary = true;
                events.push(ParserEvent::StreamOpen(header));
                return Ok(());
            }
            0 => return Err(syntax(format!("expected <stream:stream>, got <{}>", name))),
            1 if is_stream_root => {
                return Err(syntax(format!("stream header <{}> inside the stream", name)))
            }
            _ => {}
        }

        let builder = self.builder.get_or_insert_with(StanzaBuilder::new);
        builder.start(local, &namespace).map_err(builder_error)?;
        for (prefix, uri) in &prefixes {
            builder.declare_prefix(prefix, uri).map_err(builder_error)?;
        }
        for (attr, value) in &attributes {
            builder.attribute(attr, value).map_err(builder_error)?;
        }
        self.open.push(OpenElement {
            default_ns,
            prefixes,
        });
        Ok(())
    }

    fn finish_element(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), XmppError> {
        let depth = self.open.len();
        if self.open.pop().is_none() {
            return Err(syntax("end tag without a matching start tag"));
        }

        if depth == 1 {
            self.stanza_bytes = 0;
            events.push(ParserEvent::StreamClose);
            return Ok(());
        }

        self.builder_mut()?.end().map_err(builder_error)?;
        if depth == 2 {
            let builder = self
                .builder
                .take()
                .ok_or_else(|| XmppError::internal("no stanza under construction"))?;
            let stanza = builder.build().map_err(builder_error)?;
            self.stanza_bytes = 0;
            self.at_boundary = true;
            events.push(ParserEvent::Stanza(stanza));
        }
        Ok(())
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

impl std::fmt::Debug for XmlParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlParser")
            .field("phase", &self.phase())
            .field("depth", &self.open.len())
            .field("buffered", &self.input.len())
            .field("stanza_bytes", &self.stanza_bytes)
            .finish()
    }
}

fn tokenizer(limits: ParserLimits) -> RawParser {
    RawParser::with_options(Options {
        max_token_length: limits
            .max_stanza_bytes
            .clamp(MIN_TOKEN_BYTES, MAX_TOKEN_BYTES),
        ..Options::default()
    })
}

fn syntax(msg: impl Into<String>) -> XmppError {
    XmppError::xml_syntax(msg)
}

/// Map a tokenizer error onto the stream's syntax error.
///
/// Comments, processing instructions and DTDs come back as restricted XML.
fn xml_error(e: rxml::Error) -> XmppError {
    match e {
        rxml::Error::RestrictedXml(what) => syntax(format!("restricted XML: {}", what)),
        other => syntax(other.to_string()),
    }
}

fn builder_error(e: XmppError) -> XmppError {
    XmppError::xml_syntax(e.to_string())
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}:{}", prefix, local),
        None => local.to_string(),
    }
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}
