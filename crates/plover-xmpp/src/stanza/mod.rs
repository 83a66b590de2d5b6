//! Stanza model.
//!
//! [`StanzaElement`] is an ordered XML element tree: attribute insertion order
//! and child order are preserved exactly as parsed or authored. A [`Stanza`]
//! is a top-level element whose [`StanzaKind`] is fixed when it is built.
//!
//! Trees are built once (by the [`StanzaBuilder`] or the parser) and are not
//! mutated afterwards.

mod builder;
mod render;

pub use builder::StanzaBuilder;
pub use render::escape;

use crate::entity::Entity;
use crate::parser::{ns, ParserEvent, ParserLimits, XmlParser};
use crate::{StanzaErrorCondition, StanzaErrorType, XmppError};

/// A single attribute, stored with its qualified name as written (`xml:lang`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Unescaped attribute value
    pub value: String,
}

/// Attributes in insertion order with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    /// Look up an attribute value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Whether an attribute with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|a| a.name == name)
    }

    /// Iterate attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an attribute. Returns false (and changes nothing) on a duplicate name.
    pub(crate) fn push(&mut self, name: String, value: String) -> bool {
        if self.contains(&name) {
            return false;
        }
        self.0.push(Attribute { name, value });
        true
    }
}

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element
    Element(StanzaElement),
    /// Character data (unescaped)
    Text(String),
}

/// An XML element with its namespace resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaElement {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) attributes: Attributes,
    /// Prefix declarations (`xmlns:p='uri'`) carried by this element.
    pub(crate) prefixes: Vec<(String, String)>,
    pub(crate) children: Vec<Node>,
}

impl StanzaElement {
    pub(crate) fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attributes: Attributes::default(),
            prefixes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace URI (empty when the element is in no namespace).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether this element has the given local name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Shorthand for `attributes().get(name)`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    pub fn prefixes(&self) -> &[(String, String)] {
        &self.prefixes
    }

    /// All children, elements and text, in document order.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order.
    pub fn child_elements(&self) -> impl Iterator<Item = &StanzaElement> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// The first child element, if any.
    pub fn first_child(&self) -> Option<&StanzaElement> {
        self.child_elements().next()
    }

    /// The first child element with the given name and namespace.
    pub fn find_child(&self, name: &str, namespace: &str) -> Option<&StanzaElement> {
        self.child_elements().find(|c| c.is(name, namespace))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }
}

/// Stanza kind, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<iq/>` (info/query)
    Iq,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// Any other top-level element (stream negotiation, extensions)
    StreamCommand,
}

impl StanzaKind {
    fn classify(element: &StanzaElement) -> Self {
        if element.namespace != ns::JABBER_CLIENT && element.namespace != ns::JABBER_SERVER {
            return Self::StreamCommand;
        }
        match element.name.as_str() {
            "iq" => Self::Iq,
            "message" => Self::Message,
            "presence" => Self::Presence,
            _ => Self::StreamCommand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iq => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
            Self::StreamCommand => "stream-command",
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-level stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    element: StanzaElement,
    kind: StanzaKind,
}

impl Stanza {
    /// Wrap a finished element, classifying it.
    pub fn new(element: StanzaElement) -> Self {
        let kind = StanzaKind::classify(&element);
        Self { element, kind }
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn element(&self) -> &StanzaElement {
        &self.element
    }

    pub fn into_element(self) -> StanzaElement {
        self.element
    }

    pub fn name(&self) -> &str {
        &self.element.name
    }

    pub fn namespace(&self) -> &str {
        &self.element.namespace
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// The `from` address, parsed on access.
    pub fn from(&self) -> Result<Option<Entity>, XmppError> {
        self.element.attr("from").map(Entity::parse).transpose()
    }

    /// The `to` address, parsed on access.
    pub fn to(&self) -> Result<Option<Entity>, XmppError> {
        self.element.attr("to").map(Entity::parse).transpose()
    }

    pub fn first_child(&self) -> Option<&StanzaElement> {
        self.element.first_child()
    }

    /// Build the RFC 6120 error reply to this stanza.
    ///
    /// Addresses are swapped, the id is kept, and the original payload is
    /// echoed before the `<error/>` element.
    pub fn error_response(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Stanza {
        let mut reply = StanzaElement::new(self.element.name.clone(), self.element.namespace.clone());
        reply.attributes.push("type".into(), "error".into());
        if let Some(id) = self.id() {
            reply.attributes.push("id".into(), id.into());
        }
        if let Some(from) = self.element.attr("from") {
            reply.attributes.push("to".into(), from.into());
        }
        if let Some(to) = self.element.attr("to") {
            reply.attributes.push("from".into(), to.into());
        }

        for child in self.element.child_elements() {
            if !child.is("error", &self.element.namespace) {
                reply.children.push(Node::Element(child.clone()));
            }
        }

        let mut error = StanzaElement::new("error", self.element.namespace.clone());
        error
            .attributes
            .push("type".into(), error_type.as_str().into());
        error.children.push(Node::Element(StanzaElement::new(
            condition.as_str(),
            ns::STANZAS,
        )));
        if let Some(text) = text {
            let mut text_el = StanzaElement::new("text", ns::STANZAS);
            text_el.children.push(Node::Text(text.to_string()));
            error.children.push(Node::Element(text_el));
        }
        reply.children.push(Node::Element(error));

        Stanza::new(reply)
    }

    /// Shorthand for answering with the condition carried by `err`.
    pub fn error_response_for(&self, err: &XmppError) -> Stanza {
        let (condition, error_type, text) = err.stanza_condition();
        self.error_response(condition, error_type, text)
    }
}

impl From<Stanza> for StanzaElement {
    fn from(stanza: Stanza) -> Self {
        stanza.element
    }
}

impl From<&StanzaElement> for minidom::Element {
    fn from(element: &StanzaElement) -> Self {
        let mut builder = minidom::Element::builder(element.name.as_str(), element.namespace.as_str());
        for attr in element.attributes.iter() {
            builder = builder.attr(attr.name.as_str(), attr.value.as_str());
        }
        for child in &element.children {
            builder = match child {
                Node::Element(child) => builder.append(minidom::Element::from(child)),
                Node::Text(text) => builder.append(text.clone()),
            };
        }
        builder.build()
    }
}

impl From<&minidom::Element> for StanzaElement {
    fn from(element: &minidom::Element) -> Self {
        let mut converted = StanzaElement::new(element.name(), element.ns());
        for (name, value) in element.attrs() {
            converted.attributes.push(name.to_string(), value.to_string());
        }
        for node in element.nodes() {
            match node {
                minidom::Node::Element(child) => converted
                    .children
                    .push(Node::Element(StanzaElement::from(child))),
                minidom::Node::Text(text) => converted.children.push(Node::Text(text.clone())),
            }
        }
        converted
    }
}

/// Stream root a standalone fragment is parsed under.
const FRAGMENT_ROOT: &str =
    "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

impl std::str::FromStr for StanzaElement {
    type Err = XmppError;

    /// Parse exactly one serialized element, keeping attribute order.
    ///
    /// Elements without a namespace declaration are in `jabber:client`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = XmlParser::new(ParserLimits::default());
        let mut events = parser.feed(FRAGMENT_ROOT.as_bytes())?;
        let fed = parser.push(s.as_bytes());
        if let Some(e) = fed.error {
            return Err(e);
        }
        events.extend(fed.events);

        let mut elements = events.into_iter().filter_map(|event| match event {
            ParserEvent::Stanza(stanza) => Some(stanza.into_element()),
            _ => None,
        });
        match (elements.next(), elements.next()) {
            (Some(element), None) => Ok(element),
            (None, _) => Err(XmppError::xml_syntax("no complete element")),
            (Some(_), Some(_)) => Err(XmppError::xml_syntax("more than one element")),
        }
    }
}
