//! The XMPP codec: translates between the byte stream and typed
//! stream/stanza values, respecting the single-root streaming
//! discipline of RFC 3920.
//!
//! Decoding happens in two passes. A cheap depth-tracking scan locates
//! one complete top-level element (or a `<stream:stream>` open tag,
//! which never closes) in the accumulated buffer; truncated input is
//! simply not a frame yet. The complete slice is then parsed into an
//! element tree under the stream's namespace bindings and dispatched
//! by qualified name. Because the scan never keeps parser state, any
//! number of `<stream:stream>` open tags may appear on one byte
//! sequence, which is exactly what happens after each TLS or SASL
//! stream restart.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use minidom::Element;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};
use crate::extension::Registry;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Header, Iq, Message, Presence, Stanza, StanzaError};
use crate::xml;

/// Upper bound on a single frame; a buffer that grows past this
/// without yielding a frame is treated as unparseable.
const MAX_FRAME: usize = 2 * 1024 * 1024;

/// Attributes of a `<stream:stream>` open tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStart {
    /// The `to` attribute.
    pub to: Option<String>,
    /// The `from` attribute.
    pub from: Option<String>,
    /// The stream id assigned by the server.
    pub id: Option<String>,
    /// The `xml:lang` attribute.
    pub lang: Option<String>,
    /// The advertised XMPP version.
    pub version: Option<String>,
}

impl StreamStart {
    /// The open tag a client sends to start (or restart) a stream.
    pub fn client_hello(domain: &str) -> StreamStart {
        StreamStart {
            to: Some(domain.to_owned()),
            version: Some(ns::VERSION.to_owned()),
            ..StreamStart::default()
        }
    }

    fn write(&self, out: &mut String) {
        out.push_str("<stream:stream xmlns=\"");
        out.push_str(ns::CLIENT);
        out.push_str("\" xmlns:stream=\"");
        out.push_str(ns::STREAM);
        out.push('"');
        for (name, value) in [
            ("to", &self.to),
            ("from", &self.from),
            ("id", &self.id),
            ("xml:lang", &self.lang),
            ("version", &self.version),
        ] {
            if let Some(value) = value {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                xml::escape_attr(value, out);
                out.push('"');
            }
        }
        out.push('>');
    }
}

/// A `<stream:error>` received from or sent to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// Local name of the defined-condition element.
    pub condition: String,
    /// Namespace of the defined-condition element; empty when the
    /// condition carried no namespace of its own.
    pub condition_ns: String,
    /// Optional descriptive text.
    pub text: Option<String>,
    /// Language of the descriptive text.
    pub lang: Option<String>,
}

impl StreamError {
    fn from_element(el: &Element) -> StreamError {
        let mut condition = String::new();
        let mut condition_ns = String::new();
        let mut text = None;
        let mut lang = None;
        for child in el.children() {
            if child.is("text", ns::STREAMS) {
                text = Some(child.text());
                lang = child.attr("xml:lang").map(|l| l.to_owned());
            } else if condition.is_empty() {
                condition = child.name().to_owned();
                // A condition without an explicit xmlns resolves to
                // the stream default; report it as unqualified.
                let child_ns = child.ns();
                if child_ns != ns::CLIENT {
                    condition_ns = child_ns;
                }
            }
        }
        StreamError {
            condition,
            condition_ns,
            text,
            lang,
        }
    }

    fn to_element(&self) -> Element {
        let mut el = Element::builder("error", ns::STREAM).build();
        el.append_child(Element::builder(self.condition.as_str(), self.condition_ns.as_str()).build());
        if let Some(ref text) = self.text {
            let mut builder = Element::builder("text", ns::STREAMS);
            if let Some(ref lang) = self.lang {
                builder = builder.attr("xml:lang", lang.as_str());
            }
            let mut text_el = builder.build();
            text_el.append_text_node(text.as_str());
            el.append_child(text_el);
        }
        el
    }
}

/// The `<starttls/>` feature advertisement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartTlsFeature {
    /// Whether the server marked TLS as required.
    pub required: bool,
}

/// The capabilities the server advertised in `<stream:features>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    /// STARTTLS offer, if any.
    pub starttls: Option<StartTlsFeature>,
    /// SASL mechanism names, in server order.
    pub mechanisms: Vec<String>,
    /// Whether resource binding is offered.
    pub bind: bool,
    /// Whether session establishment is offered.
    pub session: bool,
}

impl Features {
    fn from_element(el: &Element) -> Features {
        let starttls = el.get_child("starttls", ns::TLS).map(|tls| StartTlsFeature {
            required: tls.has_child("required", ns::TLS),
        });
        let mechanisms = match el.get_child("mechanisms", ns::SASL) {
            Some(mechs) => mechs
                .children()
                .filter(|m| m.is("mechanism", ns::SASL))
                .map(|m| m.text())
                .collect(),
            None => Vec::new(),
        };
        Features {
            starttls,
            mechanisms,
            bind: el.has_child("bind", ns::BIND),
            session: el.has_child("session", ns::SESSION),
        }
    }
}

/// Server reply to `<starttls/>`.
#[derive(Debug, Clone, PartialEq)]
pub enum TlsResponse {
    /// The server is ready for the TLS handshake.
    Proceed,
    /// The server refused the upgrade.
    Failure,
}

/// Server-side SASL exchange step.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslResponse {
    /// A challenge to respond to, base64-decoded.
    Challenge(Vec<u8>),
    /// Authentication succeeded; carries the optional additional data.
    Success(Vec<u8>),
    /// Authentication failed, with the defined condition name.
    Failure(String),
}

/// A decoded or encodable unit of stream traffic.
#[derive(Debug)]
pub enum Packet {
    /// A `<stream:stream>` open tag (the element is never closed
    /// mid-stream).
    StreamStart(StreamStart),
    /// A `<stream:error>`.
    StreamError(StreamError),
    /// The server's `<stream:features>`.
    Features(Features),
    /// STARTTLS proceed/failure.
    Tls(TlsResponse),
    /// SASL challenge/success/failure.
    Sasl(SaslResponse),
    /// An application stanza.
    Stanza(Stanza),
    /// Any other element: unrecognized traffic on receive, protocol
    /// nonzas (starttls, auth, response, ...) on send.
    Generic(Element),
    /// The `</stream:stream>` close tag.
    StreamEnd,
}

/// One complete frame located by the scanning pass.
enum Frame {
    /// Ignorable prefix (XML declaration, inter-stanza whitespace).
    Skip(usize),
    /// A `<stream:stream>` open tag spanning `[0..end)` after `start`.
    StreamOpen(usize, usize),
    /// A complete top-level element spanning `[start..end)`.
    Element(usize, usize),
    /// The stream close tag.
    StreamClose(usize),
}

fn is_stream_open(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

/// Locate one complete frame in `buf`, or report that more bytes are
/// needed (`Ok(None)`).
fn scan_frame(buf: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let mut reader = Reader::from_reader(buf);
    reader.config_mut().check_end_names = false;

    let mut depth = 0usize;
    let mut start = None;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => {
                if start.is_none() {
                    return Ok(Some(Frame::Skip(reader.buffer_position() as usize)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                if start.is_none() {
                    return Ok(Some(Frame::Skip(reader.buffer_position() as usize)));
                }
            }
            Ok(Event::Start(tag)) => {
                let end = reader.buffer_position() as usize;
                if depth == 0 && is_stream_open(tag.name().as_ref()) {
                    return Ok(Some(Frame::StreamOpen(pos, end)));
                }
                if start.is_none() {
                    start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(tag)) => {
                let end = reader.buffer_position() as usize;
                if depth == 0 {
                    if is_stream_open(tag.name().as_ref()) {
                        return Ok(Some(Frame::StreamOpen(pos, end)));
                    }
                    return Ok(Some(Frame::Element(pos, end)));
                }
            }
            Ok(Event::End(_)) => {
                let end = reader.buffer_position() as usize;
                if depth == 0 {
                    return Ok(Some(Frame::StreamClose(end)));
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(Frame::Element(start.unwrap_or(0), end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // A tag truncated by the read boundary; wait for the rest.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(ProtocolError::Parser(e)),
        }
    }
}

fn parse_stream_open(input: &[u8]) -> Result<StreamStart, ProtocolError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().check_end_names = false;
    loop {
        match reader.read_event().map_err(ProtocolError::Parser)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::Text(_) => (),
            Event::Start(tag) | Event::Empty(tag) => {
                let mut open = StreamStart::default();
                for attr in tag.attributes() {
                    let attr = attr.map_err(|e| ProtocolError::Parser(e.into()))?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr
                        .unescape_value()
                        .map_err(ProtocolError::Parser)?
                        .into_owned();
                    match key.as_str() {
                        "to" => open.to = Some(value),
                        "from" => open.from = Some(value),
                        "id" => open.id = Some(value),
                        "xml:lang" => open.lang = Some(value),
                        "version" => open.version = Some(value),
                        _ => (),
                    }
                }
                return Ok(open);
            }
            _ => return Err(ProtocolError::InvalidToken),
        }
    }
}

fn parse_jid_attr(el: &Element, name: &str) -> Option<Jid> {
    let value = el.attr(name)?;
    match value.parse() {
        Ok(jid) => Some(jid),
        Err(e) => {
            warn!("bad {} attribute {:?}: {}", name, value, e);
            None
        }
    }
}

fn stanza_from_element(el: &Element, registry: &Registry) -> Result<Stanza, ProtocolError> {
    let mut header = Header {
        to: parse_jid_attr(el, "to"),
        from: parse_jid_attr(el, "from"),
        id: el.attr("id").map(|v| v.to_owned()),
        type_: el.attr("type").map(|v| v.to_owned()),
        lang: el.attr("xml:lang").map(|v| v.to_owned()),
        ..Header::default()
    };
    for child in el.children() {
        if child.is("error", ns::CLIENT) {
            header.error = Some(StanzaError::from_element(child));
            continue;
        }
        header.payload.push(child.clone());
        if let Some(parser) = registry.get(&(child.ns(), child.name().to_owned())) {
            let nested = parser(child)
                .map_err(|_| ProtocolError::InvalidExtensionPayload(child.name().to_owned()))?;
            header.nested.push(nested);
        }
    }
    Ok(match el.name() {
        "iq" => Stanza::Iq(Iq { header }),
        "message" => Stanza::Message(Message { header }),
        _ => Stanza::Presence(Presence { header }),
    })
}

fn stanza_to_element(stanza: &Stanza) -> Element {
    let header = stanza.header();
    let mut builder = Element::builder(stanza.name(), ns::CLIENT);
    if let Some(ref to) = header.to {
        builder = builder.attr("to", to.to_string());
    }
    if let Some(ref from) = header.from {
        builder = builder.attr("from", from.to_string());
    }
    if let Some(ref id) = header.id {
        builder = builder.attr("id", id.as_str());
    }
    if let Some(ref type_) = header.type_ {
        builder = builder.attr("type", type_.as_str());
    }
    if let Some(ref lang) = header.lang {
        builder = builder.attr("xml:lang", lang.as_str());
    }
    let mut el = builder.build();
    for child in &header.payload {
        el.append_child(child.clone());
    }
    if let Some(ref error) = header.error {
        el.append_child(error.to_element());
    }
    el
}

fn element_to_packet(el: Element, registry: &Registry) -> Result<Packet, ProtocolError> {
    let namespace = el.ns();
    let name = el.name().to_owned();
    Ok(match (namespace.as_str(), name.as_str()) {
        (ns::STREAM, "error") | (ns::CLIENT, "error") => {
            Packet::StreamError(StreamError::from_element(&el))
        }
        (ns::STREAM, "features") => Packet::Features(Features::from_element(&el)),
        (ns::TLS, "proceed") => Packet::Tls(TlsResponse::Proceed),
        (ns::TLS, "failure") => Packet::Tls(TlsResponse::Failure),
        (ns::SASL, "challenge") => {
            let data = BASE64.decode(el.text().trim())?;
            Packet::Sasl(SaslResponse::Challenge(data))
        }
        (ns::SASL, "success") => {
            let data = BASE64.decode(el.text().trim())?;
            Packet::Sasl(SaslResponse::Success(data))
        }
        (ns::SASL, "failure") => {
            let condition = el
                .children()
                .next()
                .map(|c| c.name().to_owned())
                .unwrap_or_default();
            Packet::Sasl(SaslResponse::Failure(condition))
        }
        (ns::CLIENT, "iq") | (ns::CLIENT, "message") | (ns::CLIENT, "presence") => {
            Packet::Stanza(stanza_from_element(&el, registry)?)
        }
        (space, local) => {
            info!("ignoring unrecognized: {} {}", space, local);
            Packet::Generic(el)
        }
    })
}

/// The stream codec; one instance decodes, another encodes.
pub struct XmppCodec {
    registry: Arc<Registry>,
}

impl XmppCodec {
    /// Create a codec resolving nested payloads against `registry`.
    pub(crate) fn new(registry: Arc<Registry>) -> XmppCodec {
        XmppCodec { registry }
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            let frame = match scan_frame(&src[..])? {
                Some(frame) => frame,
                None => {
                    if src.len() > MAX_FRAME {
                        return Err(ProtocolError::InvalidToken.into());
                    }
                    return Ok(None);
                }
            };
            match frame {
                Frame::Skip(end) => {
                    src.advance(end);
                }
                Frame::StreamOpen(start, end) => {
                    debug!("S: {}", String::from_utf8_lossy(&src[start..end]));
                    let open = parse_stream_open(&src[start..end])?;
                    src.advance(end);
                    return Ok(Some(Packet::StreamStart(open)));
                }
                Frame::StreamClose(end) => {
                    debug!("S: </stream:stream>");
                    src.advance(end);
                    return Ok(Some(Packet::StreamEnd));
                }
                Frame::Element(start, end) => {
                    debug!("S: {}", String::from_utf8_lossy(&src[start..end]));
                    let el = xml::parse_element(&src[start..end])?;
                    src.advance(end);
                    return Ok(Some(element_to_packet(el, &self.registry)?));
                }
            }
        }
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        let mut out = String::new();
        match item {
            Packet::StreamStart(open) => open.write(&mut out),
            Packet::StreamEnd => out.push_str("</stream:stream>"),
            Packet::StreamError(error) => {
                xml::write_element(&error.to_element(), ns::CLIENT, &mut out)
            }
            Packet::Stanza(stanza) => {
                xml::write_element(&stanza_to_element(&stanza), ns::CLIENT, &mut out)
            }
            Packet::Generic(el) => xml::write_element(&el, ns::CLIENT, &mut out),
            // These only ever travel from the server to us.
            Packet::Features(_) | Packet::Tls(_) | Packet::Sasl(_) => {
                return Err(Error::InvalidState)
            }
        }
        debug!("C: {}", out);
        dst.extend_from_slice(out.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::bind_ext;

    fn codec() -> XmppCodec {
        XmppCodec::new(Arc::new(Registry::new()))
    }

    fn decode_all(codec: &mut XmppCodec, input: &str) -> Vec<Packet> {
        let mut src = BytesMut::from(input.as_bytes());
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(&mut src).unwrap() {
            out.push(packet);
        }
        out
    }

    fn encode_one(packet: Packet) -> String {
        let mut dst = BytesMut::new();
        codec().encode(packet, &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn stream_open_parse() {
        let packets = decode_all(
            &mut codec(),
            "<stream:stream to=\"foo.com\" from=\"bar.org\" id=\"42\" \
             xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">",
        );
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::StreamStart(open) => {
                assert_eq!(open.to.as_deref(), Some("foo.com"));
                assert_eq!(open.from.as_deref(), Some("bar.org"));
                assert_eq!(open.id.as_deref(), Some("42"));
                assert_eq!(open.version.as_deref(), Some("1.0"));
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn stream_error_parse_without_text() {
        let packets = decode_all(&mut codec(), "<stream:error><bad-foo/></stream:error>");
        match &packets[0] {
            Packet::StreamError(error) => {
                assert_eq!(error.condition, "bad-foo");
                assert_eq!(error.condition_ns, "");
                assert_eq!(error.text, None);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn stream_error_parse_with_text() {
        let input = format!(
            "<stream:error><bad-foo/><text xml:lang=\"en\" xmlns=\"{}\">Error text</text></stream:error>",
            ns::STREAMS
        );
        let packets = decode_all(&mut codec(), &input);
        match &packets[0] {
            Packet::StreamError(error) => {
                assert_eq!(error.condition, "bad-foo");
                assert_eq!(error.condition_ns, "");
                assert_eq!(error.text.as_deref(), Some("Error text"));
                assert_eq!(error.lang.as_deref(), Some("en"));
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn stream_error_encode() {
        let out = encode_one(Packet::StreamError(StreamError {
            condition: "blah".to_owned(),
            condition_ns: String::new(),
            text: None,
            lang: None,
        }));
        assert_eq!(out, "<stream:error><blah></blah></stream:error>");
    }

    #[test]
    fn stream_error_encode_with_text() {
        let out = encode_one(Packet::StreamError(StreamError {
            condition: "foo".to_owned(),
            condition_ns: ns::STREAMS.to_owned(),
            text: Some("Пошёл ты".to_owned()),
            lang: Some("ru".to_owned()),
        }));
        assert_eq!(
            out,
            format!(
                "<stream:error><foo xmlns=\"{0}\"></foo><text xmlns=\"{0}\" xml:lang=\"ru\">Пошёл ты</text></stream:error>",
                ns::STREAMS
            )
        );
    }

    #[test]
    fn stream_open_encode() {
        let out = encode_one(Packet::StreamStart(StreamStart {
            to: Some("foo.org".to_owned()),
            from: Some("bar.com".to_owned()),
            id: Some("42".to_owned()),
            lang: Some("en".to_owned()),
            version: Some("1.0".to_owned()),
        }));
        assert_eq!(
            out,
            "<stream:stream xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" to=\"foo.org\" \
             from=\"bar.com\" id=\"42\" xml:lang=\"en\" version=\"1.0\">"
        );
    }

    #[test]
    fn stream_open_round_trip() {
        let open = StreamStart {
            to: Some("foo.org".to_owned()),
            from: Some("bar.com".to_owned()),
            id: Some("42".to_owned()),
            lang: Some("en".to_owned()),
            version: Some("1.0".to_owned()),
        };
        let out = encode_one(Packet::StreamStart(open.clone()));
        match &decode_all(&mut codec(), &out)[0] {
            Packet::StreamStart(parsed) => assert_eq!(parsed, &open),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn stream_error_round_trip() {
        let error = StreamError {
            condition: "host-gone".to_owned(),
            condition_ns: ns::STREAMS.to_owned(),
            text: Some("gone".to_owned()),
            lang: Some("en".to_owned()),
        };
        let out = encode_one(Packet::StreamError(error.clone()));
        match &decode_all(&mut codec(), &out)[0] {
            Packet::StreamError(parsed) => assert_eq!(parsed, &error),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn stanza_round_trip() {
        let mut iq = Iq::get(Element::builder("query", ns::ROSTER).build());
        iq.header.to = Some("foo.com".parse().unwrap());
        iq.header.lang = Some("en".to_owned());
        let stanza = Stanza::Iq(iq);
        let out = encode_one(Packet::Stanza(stanza.clone()));
        match &decode_all(&mut codec(), &out)[0] {
            Packet::Stanza(parsed) => assert_eq!(parsed, &stanza),
            other => panic!("unexpected packet: {:?}", other),
        }

        let msg = Message::chat("bob@foo.com".parse().unwrap(), "hello & <world>");
        let stanza = Stanza::Message(msg);
        let out = encode_one(Packet::Stanza(stanza.clone()));
        match &decode_all(&mut codec(), &out)[0] {
            Packet::Stanza(parsed) => assert_eq!(parsed, &stanza),
            other => panic!("unexpected packet: {:?}", other),
        }

        let stanza = Stanza::Presence(Presence::available());
        let out = encode_one(Packet::Stanza(stanza.clone()));
        match &decode_all(&mut codec(), &out)[0] {
            Packet::Stanza(parsed) => assert_eq!(parsed, &stanza),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn features_parse() {
        let input = format!(
            "<stream:features><starttls xmlns=\"{}\"><required/></starttls>\
             <mechanisms xmlns=\"{}\"><mechanism>PLAIN</mechanism>\
             <mechanism>SCRAM-SHA-1</mechanism></mechanisms>\
             <bind xmlns=\"{}\"/><session xmlns=\"{}\"/></stream:features>",
            ns::TLS,
            ns::SASL,
            ns::BIND,
            ns::SESSION
        );
        match &decode_all(&mut codec(), &input)[0] {
            Packet::Features(features) => {
                assert_eq!(features.starttls, Some(StartTlsFeature { required: true }));
                assert_eq!(features.mechanisms, vec!["PLAIN", "SCRAM-SHA-1"]);
                assert!(features.bind);
                assert!(features.session);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn sasl_packets_parse() {
        let input = format!(
            "<challenge xmlns=\"{0}\">{1}</challenge>\
             <success xmlns=\"{0}\"/>\
             <failure xmlns=\"{0}\"><not-authorized/></failure>",
            ns::SASL,
            BASE64.encode(b"nonce=abc")
        );
        let packets = decode_all(&mut codec(), &input);
        assert!(
            matches!(&packets[0], Packet::Sasl(SaslResponse::Challenge(data)) if data == b"nonce=abc")
        );
        assert!(matches!(&packets[1], Packet::Sasl(SaslResponse::Success(data)) if data.is_empty()));
        assert!(
            matches!(&packets[2], Packet::Sasl(SaslResponse::Failure(cond)) if cond == "not-authorized")
        );
    }

    #[test]
    fn tls_packets_parse() {
        let input = format!(
            "<proceed xmlns=\"{0}\"/><failure xmlns=\"{0}\"/>",
            ns::TLS
        );
        let packets = decode_all(&mut codec(), &input);
        assert!(matches!(&packets[0], Packet::Tls(TlsResponse::Proceed)));
        assert!(matches!(&packets[1], Packet::Tls(TlsResponse::Failure)));
    }

    #[test]
    fn truncated_input_yields_no_frame() {
        let mut codec = codec();
        let mut src = BytesMut::from(&b"<iq type='get'><query xmlns='jabber:iq:roster'>"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"</query></iq>");
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Packet::Stanza(Stanza::Iq(_)))
        ));
    }

    #[test]
    fn truncated_tag_yields_no_frame() {
        let mut codec = codec();
        let mut src = BytesMut::from(&b"<presence from='a@b"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"c'/>");
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Packet::Stanza(Stanza::Presence(_)))
        ));
    }

    #[test]
    fn stream_restarts_are_tolerated() {
        let input = "<stream:stream id=\"1\" xmlns=\"jabber:client\" \
                     xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">\
                     <stream:features></stream:features>\
                     <stream:stream id=\"2\" xmlns=\"jabber:client\" \
                     xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">";
        let packets = decode_all(&mut codec(), input);
        assert_eq!(packets.len(), 3);
        assert!(matches!(&packets[0], Packet::StreamStart(open) if open.id.as_deref() == Some("1")));
        assert!(matches!(&packets[1], Packet::Features(_)));
        assert!(matches!(&packets[2], Packet::StreamStart(open) if open.id.as_deref() == Some("2")));
    }

    #[test]
    fn whitespace_keepalives_are_skipped() {
        let packets = decode_all(&mut codec(), "\n \t<presence/>\n");
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0], Packet::Stanza(Stanza::Presence(_))));
    }

    #[test]
    fn stream_end_decodes() {
        let packets = decode_all(&mut codec(), "</stream:stream>");
        assert!(matches!(&packets[0], Packet::StreamEnd));
    }

    #[test]
    fn registered_children_are_materialized() {
        let registry = Arc::new(crate::extension::merge_registries(&[bind_ext()]).unwrap());
        let mut codec = XmppCodec::new(registry);
        let input = format!(
            "<iq type=\"result\" id=\"7\"><bind xmlns=\"{}\"><jid>alice@foo.com/res1</jid></bind></iq>",
            ns::BIND
        );
        let mut src = BytesMut::from(input.as_bytes());
        match codec.decode(&mut src).unwrap() {
            Some(Packet::Stanza(Stanza::Iq(iq))) => {
                // The raw child stays in the payload...
                assert!(iq.header.payload_child("bind", ns::BIND).is_some());
                // ...and the registered constructor materialized it.
                let bind = iq
                    .header
                    .nested::<crate::extension::BindPayload>()
                    .expect("nested bind payload");
                assert_eq!(bind.jid.as_ref().unwrap().to_string(), "alice@foo.com/res1");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn unrecognized_element_is_generic() {
        let packets = decode_all(&mut codec(), "<mystery xmlns=\"urn:example:x\"/>");
        assert!(matches!(&packets[0], Packet::Generic(el) if el.is("mystery", "urn:example:x")));
    }

    #[test]
    fn stanza_error_child_is_extracted() {
        let input = format!(
            "<iq type=\"error\" id=\"9\"><error type=\"cancel\">\
             <item-not-found xmlns=\"{0}\"/>\
             <text xmlns=\"{0}\">no such item</text></error></iq>",
            ns::STANZAS
        );
        match &decode_all(&mut codec(), &input)[0] {
            Packet::Stanza(Stanza::Iq(iq)) => {
                let error = iq.header.error.as_ref().expect("stanza error");
                assert_eq!(error.type_.as_deref(), Some("cancel"));
                assert_eq!(error.condition.as_deref(), Some("item-not-found"));
                assert_eq!(error.text.as_deref(), Some("no such item"));
                assert!(iq.header.payload.is_empty());
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }
}
