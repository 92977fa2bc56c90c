//! Detailed error types

use hickory_resolver::error::ResolveError as DnsResolveError;
use sasl::client::MechanismError as SaslMechanismError;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::net::AddrParseError;
use tokio_rustls::rustls::pki_types::InvalidDnsNameError;
use tokio_rustls::rustls::Error as TlsError;

use crate::jid::JidParseError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(JidParseError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
    /// Two extensions registered the same qualified element name
    DuplicateExtension(String),
    /// TLS error
    Tls(TlsError),
    /// The domain is not usable as a TLS server name
    DnsNameError(InvalidDnsNameError),
    /// DNS resolution error
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`
    Idna,
    /// Invalid IP/Port address
    Addr(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::DuplicateExtension(name) => {
                write!(fmt, "duplicate extension element: {}", name)
            }
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::DnsNameError(e) => write!(fmt, "DNS name error: {}", e),
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "Wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<JidParseError> for Error {
    fn from(e: JidParseError) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<InvalidDnsNameError> for Error {
    fn from(e: InvalidDnsNameError) -> Self {
        Error::DnsNameError(e)
    }
}

impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(quick_xml::Error),
    /// Base64 payload decoding error
    Base64(base64::DecodeError),
    /// Non-whitespace text between top-level elements
    InvalidToken,
    /// No TLS available
    NoTls,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// Session establishment refused by the server
    SessionFailed,
    /// An extension failed to decode a nested payload
    InvalidExtensionPayload(String),
    /// Stream-level error received from the peer
    StreamError(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Base64(e) => write!(fmt, "base64 error: {}", e),
            ProtocolError::InvalidToken => write!(fmt, "encountered an unexpected XML token"),
            ProtocolError::NoTls => write!(fmt, "no TLS available"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::SessionFailed => write!(fmt, "session establishment failed"),
            ProtocolError::InvalidExtensionPayload(name) => {
                write!(fmt, "invalid extension payload in <{}>", name)
            }
            ProtocolError::StreamError(cond) => write!(fmt, "stream error: {}", cond),
        }
    }
}

impl StdError for ProtocolError {}

impl From<quick_xml::Error> for ProtocolError {
    fn from(e: quick_xml::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        ProtocolError::Base64(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// Failure from server, with the defined condition element name
    Fail(String),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
        }
    }
}
