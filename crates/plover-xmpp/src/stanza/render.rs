//! XML serialization of stanza trees.

use std::fmt::{self, Write};

use super::{Node, Stanza, StanzaElement};

/// Namespace context an element is written into.
#[derive(Debug, Clone, Default)]
struct Scope<'a> {
    default_ns: &'a str,
    prefixes: Vec<(&'a str, &'a str)>,
}

impl<'a> Scope<'a> {
    fn prefix_for(&self, namespace: &str) -> Option<&'a str> {
        self.prefixes
            .iter()
            .rev()
            .find(|(_, uri)| *uri == namespace)
            .map(|(prefix, _)| *prefix)
    }
}

impl StanzaElement {
    /// Render as a top-level child of an open stream.
    ///
    /// Elements in `default_ns` are written without a namespace declaration
    /// and elements in a namespace bound to one of `prefixes` are written
    /// with that prefix (so `stream:features` stays prefixed).
    pub fn render_in_stream(&self, default_ns: &str, prefixes: &[(&str, &str)]) -> String {
        let scope = Scope {
            default_ns,
            prefixes: prefixes.to_vec(),
        };
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = write_element(&mut out, self, &scope);
        out
    }
}

impl fmt::Display for StanzaElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_element(f, self, &Scope::default())
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.element().fmt(f)
    }
}

fn write_element<'a, W: Write>(
    out: &mut W,
    element: &'a StanzaElement,
    parent: &Scope<'a>,
) -> fmt::Result {
    let mut scope = parent.clone();
    for (prefix, uri) in &element.prefixes {
        scope.prefixes.push((prefix.as_str(), uri.as_str()));
    }

    let mut declare_default = false;
    let qname_prefix = if element.namespace == scope.default_ns {
        None
    } else if let Some(prefix) = scope.prefix_for(&element.namespace) {
        Some(prefix)
    } else {
        declare_default = true;
        scope.default_ns = element.namespace.as_str();
        None
    };

    out.write_char('<')?;
    if let Some(prefix) = qname_prefix {
        write!(out, "{}:", prefix)?;
    }
    out.write_str(&element.name)?;

    if declare_default {
        out.write_str(" xmlns='")?;
        escape_attr_into(out, &element.namespace)?;
        out.write_char('\'')?;
    }
    for (prefix, uri) in &element.prefixes {
        write!(out, " xmlns:{}='", prefix)?;
        escape_attr_into(out, uri)?;
        out.write_char('\'')?;
    }
    for attr in element.attributes.iter() {
        write!(out, " {}='", attr.name)?;
        escape_attr_into(out, &attr.value)?;
        out.write_char('\'')?;
    }

    if element.children.is_empty() {
        return out.write_str("/>");
    }
    out.write_char('>')?;

    for child in &element.children {
        match child {
            Node::Element(child) => write_element(out, child, &scope)?,
            Node::Text(text) => escape_into(out, text)?,
        }
    }

    out.write_str("</")?;
    if let Some(prefix) = qname_prefix {
        write!(out, "{}:", prefix)?;
    }
    out.write_str(&element.name)?;
    out.write_char('>')
}

/// Escape character data. A literal CR would be read back as LF.
pub(crate) fn escape_into<W: Write>(out: &mut W, text: &str) -> fmt::Result {
    escape_with(out, text, false)
}

/// Escape an attribute value. Tab, LF and CR become character references
/// so the reader's attribute-value normalization keeps them.
pub(crate) fn escape_attr_into<W: Write>(out: &mut W, value: &str) -> fmt::Result {
    escape_with(out, value, true)
}

fn escape_with<W: Write>(out: &mut W, text: &str, attribute: bool) -> fmt::Result {
    for c in text.chars() {
        match c {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            '\'' => out.write_str("&apos;")?,
            '"' => out.write_str("&quot;")?,
            '\r' => out.write_str("&#13;")?,
            '\t' if attribute => out.write_str("&#9;")?,
            '\n' if attribute => out.write_str("&#10;")?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}

/// Escape a string for use in attribute values or character data.
///
/// Whitespace other than space is written as character references.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let _ = escape_attr_into(&mut out, text);
    out
}
