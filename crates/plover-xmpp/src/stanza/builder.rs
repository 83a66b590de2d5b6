//! Fluent stanza construction.

use super::{Node, Stanza, StanzaElement};
use crate::parser::ns;
use crate::XmppError;

/// Builds a [`Stanza`] or [`StanzaElement`] one start/attribute/text/end call
/// at a time.
///
/// Every call that can be misused returns `Result<&mut Self, XmppError>` so
/// calls chain with `?`. Misuse yields [`XmppError::BuilderState`]; it only
/// affects this builder.
///
/// ```
/// use plover_xmpp::stanza::StanzaBuilder;
///
/// # fn main() -> Result<(), plover_xmpp::XmppError> {
/// let mut builder = StanzaBuilder::new();
/// builder
///     .start("message", "jabber:client")?
///     .attribute("to", "bob@example.com")?
///     .start("body", "jabber:client")?
///     .text("hi")?
///     .end()?
///     .end()?;
/// let message = builder.build()?;
/// assert_eq!(message.attr("to"), Some("bob@example.com"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct StanzaBuilder {
    open: Vec<StanzaElement>,
    root: Option<StanzaElement>,
    /// Root opened by a shortcut constructor, closed by `build` if still open
    implicit_root: bool,
}

impl StanzaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an `<iq/>` with `type` and `id` already set.
    pub fn iq(iq_type: &str, id: &str) -> Self {
        Self::with_root("iq", &[("type", iq_type), ("id", id)])
    }

    /// Start a `<message/>`, optionally typed.
    pub fn message(message_type: Option<&str>) -> Self {
        match message_type {
            Some(t) => Self::with_root("message", &[("type", t)]),
            None => Self::with_root("message", &[]),
        }
    }

    /// Start a `<presence/>`, optionally typed.
    pub fn presence(presence_type: Option<&str>) -> Self {
        match presence_type {
            Some(t) => Self::with_root("presence", &[("type", t)]),
            None => Self::with_root("presence", &[]),
        }
    }

    /// Start the `type='result'` reply to an iq request.
    pub fn iq_result(request: &Stanza) -> Result<Self, XmppError> {
        if request.name() != "iq" {
            return Err(XmppError::builder_state(format!(
                "iq_result called for <{}/>",
                request.name()
            )));
        }
        let id = request
            .id()
            .ok_or_else(|| XmppError::builder_state("iq request has no id"))?;

        let mut builder = Self::with_root("iq", &[("type", "result"), ("id", id)]);
        if let Some(from) = request.attr("from") {
            builder.attribute("to", from)?;
        }
        if let Some(to) = request.attr("to") {
            builder.attribute("from", to)?;
        }
        Ok(builder)
    }

    fn with_root(name: &str, attributes: &[(&str, &str)]) -> Self {
        let mut root = StanzaElement::new(name, ns::JABBER_CLIENT);
        for (name, value) in attributes {
            root.attributes.push((*name).to_string(), (*value).to_string());
        }
        Self {
            open: vec![root],
            root: None,
            implicit_root: true,
        }
    }

    /// Open a new element as a child of the current one (or as the root).
    pub fn start(&mut self, name: &str, namespace: &str) -> Result<&mut Self, XmppError> {
        if self.root.is_some() {
            return Err(XmppError::builder_state(format!(
                "cannot start <{}>: root element already closed",
                name
            )));
        }
        if name.is_empty() {
            return Err(XmppError::builder_state("element name is empty"));
        }
        self.open.push(StanzaElement::new(name, namespace));
        Ok(self)
    }

    /// Add an attribute to the currently open element.
    pub fn attribute(&mut self, name: &str, value: &str) -> Result<&mut Self, XmppError> {
        let current = self.current("attribute")?;
        if !current.attributes.push(name.to_string(), value.to_string()) {
            return Err(XmppError::builder_state(format!(
                "duplicate attribute '{}' on <{}>",
                name, current.name
            )));
        }
        Ok(self)
    }

    /// Declare a namespace prefix on the currently open element.
    pub fn declare_prefix(&mut self, prefix: &str, uri: &str) -> Result<&mut Self, XmppError> {
        let current = self.current("declare_prefix")?;
        if current.prefixes.iter().any(|(p, _)| p == prefix) {
            return Err(XmppError::builder_state(format!(
                "prefix '{}' declared twice on <{}>",
                prefix, current.name
            )));
        }
        current.prefixes.push((prefix.to_string(), uri.to_string()));
        Ok(self)
    }

    /// Append character data to the currently open element.
    pub fn text(&mut self, content: &str) -> Result<&mut Self, XmppError> {
        let current = self.current("text")?;
        match current.children.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(content),
            _ => current.children.push(Node::Text(content.to_string())),
        }
        Ok(self)
    }

    /// Append an already finished element as a child of the open element.
    pub fn append(&mut self, element: StanzaElement) -> Result<&mut Self, XmppError> {
        let current = self.current("append")?;
        current.children.push(Node::Element(element));
        Ok(self)
    }

    /// Close the innermost open element.
    pub fn end(&mut self) -> Result<&mut Self, XmppError> {
        let finished = self
            .open
            .pop()
            .ok_or_else(|| XmppError::builder_state("end() without a matching start()"))?;
        match self.open.last_mut() {
            Some(parent) => parent.children.push(Node::Element(finished)),
            None => self.root = Some(finished),
        }
        Ok(self)
    }

    /// Nesting depth of currently open elements.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Finish and return the root element.
    ///
    /// Roots opened by [`StanzaBuilder::iq`] and friends are closed
    /// implicitly when they are the only element still open.
    pub fn build_element(mut self) -> Result<StanzaElement, XmppError> {
        if self.implicit_root && self.root.is_none() && self.open.len() == 1 {
            self.end()?;
        }
        if !self.open.is_empty() {
            return Err(XmppError::builder_state(format!(
                "{} element(s) still open",
                self.open.len()
            )));
        }
        self.root
            .ok_or_else(|| XmppError::builder_state("nothing was built"))
    }

    /// Finish and classify the root element as a [`Stanza`].
    pub fn build(self) -> Result<Stanza, XmppError> {
        self.build_element().map(Stanza::new)
    }

    fn current(&mut self, operation: &str) -> Result<&mut StanzaElement, XmppError> {
        self.open
            .last_mut()
            .ok_or_else(|| XmppError::builder_state(format!("{}() with no open element", operation)))
    }
}
