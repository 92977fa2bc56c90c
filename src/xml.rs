//! Glue between the wire tokenizer and the element tree: parsing a
//! complete XML fragment into a [`minidom::Element`] under the stream's
//! namespace bindings, and serializing elements back out.
//!
//! Children of the stream root inherit `xmlns="jabber:client"` and
//! `xmlns:stream="http://etherx.jabber.org/streams"` from the
//! `<stream:stream>` open tag, which the framing layer never hands to
//! the parser. The parser therefore seeds its prefix environment with
//! those two bindings before reading a fragment.

use std::collections::HashMap;

use log::warn;
use minidom::{Element, Node};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::ProtocolError;
use crate::ns;

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Escape text content for XML output.
pub(crate) fn escape_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

/// Escape an attribute value for XML output, double-quote quoting.
pub(crate) fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

/// One lexical scope of prefix bindings; `None` keys the default
/// namespace.
type Scope = HashMap<Option<String>, String>;

fn stream_scope() -> Scope {
    let mut scope = Scope::new();
    scope.insert(None, ns::CLIENT.to_owned());
    scope.insert(Some("stream".to_owned()), ns::STREAM.to_owned());
    scope.insert(Some("xml".to_owned()), XML_NS.to_owned());
    scope
}

fn resolve(scopes: &[Scope], prefix: Option<&str>) -> Option<String> {
    let key = prefix.map(|p| p.to_owned());
    for scope in scopes.iter().rev() {
        if let Some(ns) = scope.get(&key) {
            return Some(ns.clone());
        }
    }
    None
}

fn split_qname(raw: &str) -> (Option<&str>, &str) {
    match raw.find(':') {
        Some(pos) => (Some(&raw[..pos]), &raw[pos + 1..]),
        None => (None, raw),
    }
}

/// Read the tag's attributes, splitting namespace declarations out into
/// a fresh scope, and build the element.
fn open_element(tag: &BytesStart, scopes: &mut Vec<Scope>) -> Result<Element, ProtocolError> {
    let mut scope = Scope::new();
    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| ProtocolError::Parser(e.into()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(ProtocolError::Parser)?
            .into_owned();
        if key == "xmlns" {
            scope.insert(None, value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(Some(prefix.to_owned()), value);
        } else {
            attrs.push((key, value));
        }
    }
    scopes.push(scope);

    let raw_name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    let (prefix, local) = split_qname(&raw_name);
    let namespace = match resolve(scopes, prefix) {
        Some(ns) => ns,
        None => {
            warn!("unbound namespace prefix in <{}>", raw_name);
            String::new()
        }
    };

    let mut builder = Element::builder(local, namespace);
    for (key, value) in attrs {
        builder = builder.attr(key.as_str(), value);
    }
    Ok(builder.build())
}

/// Parse one complete XML element (as delimited by the framing scan)
/// into an element tree, resolving prefixes against the stream scope.
pub(crate) fn parse_element(input: &[u8]) -> Result<Element, ProtocolError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().check_end_names = false;

    let mut scopes: Vec<Scope> = vec![stream_scope()];
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event().map_err(ProtocolError::Parser)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => (),
            Event::Start(tag) => {
                let el = open_element(&tag, &mut scopes)?;
                stack.push(el);
            }
            Event::Empty(tag) => {
                let el = open_element(&tag, &mut scopes)?;
                scopes.pop();
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(el);
                    }
                    None => return Ok(el),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(ProtocolError::Parser)?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_text_node(text.into_owned());
                    }
                    // Inter-element whitespace, e.g. keepalives.
                    None => (),
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(data.as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.append_text_node(text);
                }
            }
            Event::End(_) => {
                scopes.pop();
                let el = match stack.pop() {
                    Some(el) => el,
                    None => return Err(ProtocolError::InvalidToken),
                };
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(el);
                    }
                    None => return Ok(el),
                }
            }
            Event::Eof => return Err(ProtocolError::InvalidToken),
        }
    }
}

/// Serialize an element into `out`.
///
/// `inherited` is the default namespace in force at this point of the
/// document (for stream children, `jabber:client`). Elements in the
/// stream framing namespace use the `stream:` prefix bound on the
/// stream root; other namespaces differing from the inherited default
/// are declared inline. An element without a namespace is written
/// bare, matching the encoder this library's wire format descends
/// from.
pub(crate) fn write_element(el: &Element, inherited: &str, out: &mut String) {
    let ns = el.ns();
    let (tag, declared) = if ns == ns::STREAM {
        (format!("stream:{}", el.name()), None)
    } else if ns.is_empty() || ns == inherited {
        (el.name().to_owned(), None)
    } else {
        (el.name().to_owned(), Some(ns.clone()))
    };

    out.push('<');
    out.push_str(&tag);
    if let Some(ref ns) = declared {
        out.push_str(" xmlns=\"");
        escape_attr(ns, out);
        out.push('"');
    }
    for (key, value) in el.attrs() {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');

    let child_inherited = declared.as_deref().unwrap_or(inherited);
    for node in el.nodes() {
        match node {
            Node::Element(child) => write_element(child, child_inherited, out),
            Node::Text(text) => escape_text(text, out),
        }
    }

    out.push_str("</");
    out.push_str(&tag);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_stream_child() {
        let el = parse_element(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>").unwrap();
        assert!(el.is("features", ns::STREAM));
        assert!(el.has_child("bind", ns::BIND));
    }

    #[test]
    fn default_namespace_inherited_from_stream() {
        let el = parse_element(b"<iq type='get' id='1'><x/></iq>").unwrap();
        assert!(el.is("iq", ns::CLIENT));
        assert!(el.has_child("x", ns::CLIENT));
    }

    #[test]
    fn explicit_xmlns_overrides_default() {
        let el =
            parse_element(b"<iq type='get'><query xmlns='jabber:iq:roster'><item jid='a@b'/></query></iq>")
                .unwrap();
        let query = el.get_child("query", ns::ROSTER).unwrap();
        assert!(query.has_child("item", ns::ROSTER));
    }

    #[test]
    fn text_is_unescaped_and_reescaped() {
        let el = parse_element(b"<message><body>a &amp; b &lt;c&gt;</body></message>").unwrap();
        let body = el.get_child("body", ns::CLIENT).unwrap();
        assert_eq!(body.text(), "a & b <c>");

        let mut out = String::new();
        write_element(&el, ns::CLIENT, &mut out);
        assert_eq!(
            out,
            "<message><body>a &amp; b &lt;c&gt;</body></message>"
        );
    }

    #[test]
    fn foreign_namespace_declared_once() {
        let el =
            parse_element(b"<iq><query xmlns='jabber:iq:roster'><item jid='a@b'/></query></iq>")
                .unwrap();
        let mut out = String::new();
        write_element(&el, ns::CLIENT, &mut out);
        assert_eq!(
            out,
            "<iq><query xmlns=\"jabber:iq:roster\"><item jid=\"a@b\"></item></query></iq>"
        );
    }

    #[test]
    fn xml_lang_attribute_kept_verbatim() {
        let el = parse_element(b"<message xml:lang='en'><body>hi</body></message>").unwrap();
        assert_eq!(el.attr("xml:lang"), Some("en"));
    }
}
