//! The stanza data model: the three stanza kinds, their shared header,
//! stanza-level errors and the process-wide id generator.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use minidom::Element;

use crate::jid::Jid;
use crate::ns;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Produce a fresh stanza id, unique for the lifetime of the process.
pub fn next_id() -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("id-{}", id)
}

/// A nested payload materialized by an extension's registered
/// constructor. Consumers recover the concrete type with
/// [`downcast_ref`][`std::any::Any::downcast_ref`].
pub type Nested = Arc<dyn Any + Send + Sync>;

/// The parts shared by all three stanza kinds.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Addressee of the stanza.
    pub to: Option<Jid>,
    /// Sender of the stanza.
    pub from: Option<Jid>,
    /// Stanza id; requests originated by this library always carry one.
    pub id: Option<String>,
    /// Stanza type, from the per-kind protocol vocabulary.
    pub type_: Option<String>,
    /// `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// The stanza's child elements in document order, except the
    /// `<error/>` child, which lands in `error`.
    pub payload: Vec<Element>,
    /// Children recognized by a registered extension, decoded into
    /// their registered types. The originals also remain in `payload`.
    pub nested: Vec<Nested>,
    /// The `<error/>` child, if the stanza carries one.
    pub error: Option<StanzaError>,
}

impl PartialEq for Header {
    // `nested` holds type-erased values and is derived from `payload`,
    // so it does not take part in equality.
    fn eq(&self, other: &Header) -> bool {
        self.to == other.to
            && self.from == other.from
            && self.id == other.id
            && self.type_ == other.type_
            && self.lang == other.lang
            && self.payload == other.payload
            && self.error == other.error
    }
}

impl Header {
    /// Find the first payload child matching the given name and
    /// namespace.
    pub fn payload_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payload.iter().find(|el| el.is(name, namespace))
    }

    /// Find the first nested payload of the given type.
    pub fn nested<T: Any>(&self) -> Option<&T> {
        self.nested.iter().find_map(|n| n.downcast_ref::<T>())
    }
}

/// A stanza-level error, RFC 3920 section 9.3.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// Legacy numeric code, if present.
    pub code: Option<u32>,
    /// Error type attribute (cancel, continue, modify, auth, wait).
    pub type_: Option<String>,
    /// Defined condition element name, e.g. `item-not-found`.
    pub condition: Option<String>,
    /// Human-readable text, if present.
    pub text: Option<String>,
}

impl StanzaError {
    pub(crate) fn from_element(el: &Element) -> StanzaError {
        let mut condition = None;
        let mut text = None;
        for child in el.children() {
            if child.is("text", ns::STANZAS) {
                text = Some(child.text());
            } else if condition.is_none() && child.ns() == ns::STANZAS {
                condition = Some(child.name().to_owned());
            }
        }
        StanzaError {
            code: el.attr("code").and_then(|c| c.parse().ok()),
            type_: el.attr("type").map(|t| t.to_owned()),
            condition,
            text,
        }
    }

    pub(crate) fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::CLIENT);
        if let Some(code) = self.code {
            builder = builder.attr("code", code.to_string());
        }
        if let Some(ref type_) = self.type_ {
            builder = builder.attr("type", type_.as_str());
        }
        let mut el = builder.build();
        if let Some(ref condition) = self.condition {
            el.append_child(Element::builder(condition.as_str(), ns::STANZAS).build());
        }
        if let Some(ref text) = self.text {
            let mut text_el = Element::builder("text", ns::STANZAS).build();
            text_el.append_text_node(text.as_str());
            el.append_child(text_el);
        }
        el
    }
}

/// An info/query stanza.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Iq {
    /// The shared stanza header.
    pub header: Header,
}

impl Iq {
    /// Build an iq-get carrying the given payload, with a fresh id.
    pub fn get(payload: Element) -> Iq {
        Iq::request("get", payload)
    }

    /// Build an iq-set carrying the given payload, with a fresh id.
    pub fn set(payload: Element) -> Iq {
        Iq::request("set", payload)
    }

    fn request(type_: &str, payload: Element) -> Iq {
        Iq {
            header: Header {
                id: Some(next_id()),
                type_: Some(type_.to_owned()),
                payload: vec![payload],
                ..Header::default()
            },
        }
    }

    /// Build an iq-result replying to the given request.
    pub fn result_of(request: &Iq, payload: Option<Element>) -> Iq {
        Iq {
            header: Header {
                to: request.header.from.clone(),
                id: request.header.id.clone(),
                type_: Some("result".to_owned()),
                payload: payload.into_iter().collect(),
                ..Header::default()
            },
        }
    }

    /// Is this an error reply?
    pub fn is_error(&self) -> bool {
        self.header.type_.as_deref() == Some("error")
    }
}

/// A message stanza.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// The shared stanza header.
    pub header: Header,
}

impl Message {
    /// Build a chat message with a body.
    pub fn chat(to: Jid, body: &str) -> Message {
        let mut body_el = Element::builder("body", ns::CLIENT).build();
        body_el.append_text_node(body);
        Message {
            header: Header {
                to: Some(to),
                type_: Some("chat".to_owned()),
                payload: vec![body_el],
                ..Header::default()
            },
        }
    }

    /// The `<body/>` text, if present.
    pub fn body(&self) -> Option<String> {
        self.header
            .payload_child("body", ns::CLIENT)
            .map(|el| el.text())
    }
}

/// A presence stanza.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Presence {
    /// The shared stanza header.
    pub header: Header,
}

impl Presence {
    /// Plain available presence, broadcast to all subscribers.
    pub fn available() -> Presence {
        Presence::default()
    }
}

/// A unit of XMPP application traffic: exactly one of iq, message or
/// presence.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),
    /// Message stanza
    Message(Message),
    /// Presence stanza
    Presence(Presence),
}

impl Stanza {
    /// The element name of this stanza kind.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Iq(_) => "iq",
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
        }
    }

    /// The shared header.
    pub fn header(&self) -> &Header {
        match self {
            Stanza::Iq(iq) => &iq.header,
            Stanza::Message(message) => &message.header,
            Stanza::Presence(presence) => &presence.header,
        }
    }

    /// The shared header, mutably.
    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Stanza::Iq(iq) => &mut iq.header,
            Stanza::Message(message) => &mut message.header,
            Stanza::Presence(presence) => &mut presence.header,
        }
    }

    /// Assign a fresh id to the stanza, if no id has been assigned yet.
    pub fn ensure_id(&mut self) -> &str {
        self.header_mut().id.get_or_insert_with(next_id)
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Self::Iq(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Self::Message(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Self::Presence(other)
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Stanza> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Stanza> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Stanza> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, b);
        let na: u64 = a.strip_prefix("id-").unwrap().parse().unwrap();
        let nb: u64 = b.strip_prefix("id-").unwrap().parse().unwrap();
        assert!(nb > na);
    }

    #[test]
    fn ensure_id_assigns_once() {
        let mut st: Stanza = Presence::available().into();
        let id = st.ensure_id().to_owned();
        assert_eq!(st.ensure_id(), id);
    }

    #[test]
    fn iq_requests_carry_ids() {
        let iq = Iq::get(Element::builder("query", ns::ROSTER).build());
        assert!(iq.header.id.is_some());
        assert_eq!(iq.header.type_.as_deref(), Some("get"));
    }

    #[test]
    fn message_body() {
        let msg = Message::chat("bob@foo.com".parse().unwrap(), "hi there");
        assert_eq!(msg.body().as_deref(), Some("hi there"));
    }
}
