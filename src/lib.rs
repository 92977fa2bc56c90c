//! XMPP client library implementing RFC 3920 (XML streams) and
//! RFC 3921 (instant messaging and roster) with asynchronous I/O using
//! [tokio](https://tokio.rs/).
//!
//! The implementation is structured as a stack of concurrently running
//! layers connected by closable queues, with TCP at the bottom and the
//! application at the top: a byte transport that can be hot-swapped to
//! TLS mid-stream, an XML codec, a stream negotiation state machine
//! (STARTTLS, SASL, resource binding, session), and a stanza dispatch
//! layer with pluggable filter stacks and per-id response callbacks.
//!
//! # Getting started
//!
//! Construct a [`Client`] from a JID and password; it resolves the
//! server via DNS SRV, connects, and negotiates in the background
//! while you build an event loop over [`Client::recv`]. Sends block
//! until resource binding has completed, so you cannot accidentally
//! interleave your traffic with the handshake.
//!
//! ```no_run
//! use tokio_jabber::{Client, ClientOptions, Message, Stanza};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tokio_jabber::Error> {
//!     let jid = "alice@example.com/home".parse().unwrap();
//!     let mut client = Client::connect(jid, "hunter2", ClientOptions::default()).await?;
//!     client.await_status(tokio_jabber::Status::Running).await?;
//!     client.roster().update().await?;
//!     while let Some(stanza) = client.recv().await {
//!         if let Stanza::Message(msg) = stanza {
//!             println!("{:?}: {:?}", msg.header.from, msg.body());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

mod client;
mod codec;
pub mod connect;
/// Detailed error types
pub mod error;
mod extension;
mod filter;
mod jid;
pub mod ns;
mod roster;
mod stanza;
mod status;
mod stream;
mod transport;
mod xml;

pub use client::{default_tls_config, Client, ClientOptions};
pub use codec::{
    Features, Packet, SaslResponse, StartTlsFeature, StreamError, StreamStart, TlsResponse,
};
pub use connect::DnsConfig;
#[doc(inline)]
pub use error::{AuthError, Error, ProtocolError};
pub use extension::{BindPayload, Extension, NestedParser};
pub use filter::Filter;
pub use jid::{Jid, JidParseError};
pub use roster::{Roster, RosterItem, RosterQuery};
pub use stanza::{next_id, Header, Iq, Message, Nested, Presence, Stanza, StanzaError};
pub use status::Status;
pub use transport::AsyncReadAndWrite;
