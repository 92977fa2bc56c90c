//! XML namespaces used during stream negotiation and stanza exchange.

/// `jabber:client`, the default namespace of a client-to-server stream.
pub const CLIENT: &str = "jabber:client";

/// `http://etherx.jabber.org/streams`, the stream framing namespace,
/// conventionally bound to the `stream` prefix.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// `urn:ietf:params:xml:ns:xmpp-streams`, stream error conditions.
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// `urn:ietf:params:xml:ns:xmpp-stanzas`, stanza error conditions.
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// `urn:ietf:params:xml:ns:xmpp-tls`, STARTTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// `urn:ietf:params:xml:ns:xmpp-sasl`, SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// `urn:ietf:params:xml:ns:xmpp-bind`, resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// `urn:ietf:params:xml:ns:xmpp-session`, session establishment.
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// `jabber:iq:roster`, contact list management.
pub const ROSTER: &str = "jabber:iq:roster";

/// The XMPP version we implement.
pub const VERSION: &str = "1.0";
