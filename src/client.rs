//! The public client: construction wires the whole pipeline together,
//! after which the application talks to the stream through stanza
//! queues, filters and callbacks.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::warn;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Packet, StreamStart, XmppCodec};
use crate::connect::DnsConfig;
use crate::error::Error;
use crate::extension::{bind_ext, merge_registries, Extension};
use crate::filter::{recv_filter_mgr, send_filter_mgr, Filter, QUEUE_DEPTH};
use crate::jid::Jid;
use crate::roster::{roster_ext, Roster};
use crate::stanza::{Presence, Stanza};
use crate::status::{Status, StatusMgr};
use crate::stream::{write_stream, HandlerReg, ReadDriver};
use crate::transport::{AsyncReadAndWrite, Transport};

const PIPE_CAPACITY: usize = 8192;

/// Build the default TLS client configuration, trusting the bundled
/// web PKI roots.
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Everything configurable about a client besides its JID and
/// password.
pub struct ClientOptions {
    /// How to find the server; defaults to SRV resolution on the
    /// JID's domain.
    pub dns: Option<DnsConfig>,
    /// TLS configuration used for the STARTTLS upgrade.
    pub tls: Arc<rustls::ClientConfig>,
    /// Extensions installed in addition to the mandatory bind and
    /// roster extensions.
    pub extensions: Vec<Extension>,
    /// Presence emitted once the session is running; `None` suppresses
    /// it.
    pub initial_presence: Option<Presence>,
    /// Receives every status transition, ending with `Shutdown`.
    pub status_listener: Option<mpsc::UnboundedSender<Status>>,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            dns: None,
            tls: default_tls_config(),
            extensions: Vec::new(),
            initial_presence: Some(Presence::available()),
            status_listener: None,
        }
    }
}

/// The client side of a client-server XMPP connection.
///
/// Stream negotiation runs asynchronously after construction; sends
/// block until resource binding is complete.
pub struct Client {
    recv: mpsc::Receiver<Stanza>,
    send: Option<mpsc::Sender<Stanza>>,
    recv_filters: mpsc::Sender<Filter>,
    send_filters: mpsc::Sender<Filter>,
    regs: mpsc::Sender<HandlerReg>,
    status: StatusMgr,
    jid_rx: watch::Receiver<Jid>,
    roster: Roster,
}

impl Client {
    /// Resolve the JID's domain, connect, and start stream
    /// negotiation.
    pub async fn connect(jid: Jid, password: &str, options: ClientOptions) -> Result<Client, Error> {
        let socket = match options.dns {
            Some(ref dns) => dns.resolve().await?,
            None => DnsConfig::client(jid.domain()).resolve().await?,
        };
        Client::with_stream(socket, jid, password, options).await
    }

    /// Start a client over an already-connected byte stream.
    pub async fn with_stream<S>(
        socket: S,
        jid: Jid,
        password: &str,
        mut options: ClientOptions,
    ) -> Result<Client, Error>
    where
        S: AsyncReadAndWrite + 'static,
    {
        // Include the mandatory extensions.
        let (roster, roster_extension) = roster_ext();
        options.extensions.push(roster_extension);
        options.extensions.push(bind_ext());
        let registry = Arc::new(merge_registries(&options.extensions)?);

        let server_name = ServerName::try_from(jid.domain().to_owned())?;

        // The transport, initially unencrypted, glued to the codec by
        // a byte pipe per direction.
        let (codec_read, transport_write) = tokio::io::simplex(PIPE_CAPACITY);
        let (transport_read, codec_write) = tokio::io::simplex(PIPE_CAPACITY);
        let transport = Transport::start(socket, transport_write, transport_read);

        // The reader and writer that convert between bytes and packets.
        let (packet_tx, packet_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(read_xml(
            FramedRead::new(codec_read, XmppCodec::new(registry.clone())),
            packet_tx,
        ));
        let (xml_tx, xml_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(write_xml(
            FramedWrite::new(codec_write, XmppCodec::new(registry)),
            xml_rx,
        ));

        let status = StatusMgr::new();
        if let Some(listener) = options.status_listener.take() {
            tokio::spawn(forward_status(status.listener(), listener));
        }

        // The stream drivers: negotiation plus dispatch inbound, the
        // bind gate outbound.
        let (reg_tx, reg_rx) = mpsc::channel(100);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (recv_raw_tx, recv_raw_rx) = mpsc::channel(QUEUE_DEPTH);
        let (send_raw_tx, send_raw_rx) = mpsc::channel(QUEUE_DEPTH);
        let (jid_tx, jid_rx) = watch::channel(jid.clone());
        let driver = ReadDriver {
            jid: jid.clone(),
            password: password.to_owned(),
            tls: options.tls.clone(),
            server_name,
            initial_presence: options.initial_presence.take(),
            transport,
            status: status.clone(),
            jid_tx,
            xml_out: xml_tx.clone(),
            control: control_tx,
            packets: packet_rx,
            regs: reg_rx,
            cli_out: recv_raw_tx,
        };
        tokio::spawn(driver.run());
        tokio::spawn(write_stream(xml_tx.clone(), send_raw_rx, control_rx));

        // The managers for the filters that can modify what the app
        // sees.
        let (recv_add_tx, recv_add_rx) = mpsc::channel(8);
        let (send_add_tx, send_add_rx) = mpsc::channel(8);
        let (recv_out_tx, recv_out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (app_send_tx, app_send_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(recv_filter_mgr(recv_add_rx, recv_raw_rx, recv_out_tx));
        tokio::spawn(send_filter_mgr(send_add_rx, app_send_rx, send_raw_tx));

        for ext in &mut options.extensions {
            if let Some(filter) = ext.recv_filter.take() {
                recv_add_tx
                    .send(filter)
                    .await
                    .map_err(|_| Error::InvalidState)?;
            }
            if let Some(filter) = ext.send_filter.take() {
                send_add_tx
                    .send(filter)
                    .await
                    .map_err(|_| Error::InvalidState)?;
            }
        }

        status.set(Status::Connected);

        // Initial handshake.
        xml_tx
            .send(Packet::StreamStart(StreamStart::client_hello(jid.domain())))
            .await
            .map_err(|_| Error::Disconnected)?;

        Ok(Client {
            recv: recv_out_rx,
            send: Some(app_send_tx),
            recv_filters: recv_add_tx,
            send_filters: send_add_tx,
            regs: reg_tx,
            status,
            jid_rx,
            roster,
        })
    }

    /// The client's JID; once bound, the full JID reported by the
    /// server.
    pub fn jid(&self) -> Jid {
        self.jid_rx.borrow().clone()
    }

    /// Receive the next inbound stanza. `None` means the stream is
    /// gone.
    pub async fn recv(&mut self) -> Option<Stanza> {
        self.recv.recv().await
    }

    /// Send a stanza. Blocks until negotiation has finished and the
    /// pipeline has room. A missing id is filled in.
    pub async fn send(&self, mut stanza: Stanza) -> Result<(), Error> {
        stanza.ensure_id();
        match self.send {
            Some(ref tx) => tx.send(stanza).await.map_err(|_| Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }

    /// Add a filter to the top of the receive stack.
    pub async fn add_recv_filter(&self, filter: Filter) -> Result<(), Error> {
        self.recv_filters
            .send(filter)
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Add a filter to the top of the send stack.
    pub async fn add_send_filter(&self, filter: Filter) -> Result<(), Error> {
        self.send_filters
            .send(filter)
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Register a one-shot callback for the next stanza carrying `id`.
    /// The callback's return decides whether that stanza is also
    /// delivered on [`recv`][`Client::recv`]. Register before sending
    /// the request and the reply cannot be missed.
    pub async fn set_callback<F>(&self, id: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce(&Stanza) -> bool + Send + 'static,
    {
        self.regs
            .send(HandlerReg {
                id: id.to_owned(),
                f: Box::new(f),
            })
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// The roster handle.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// A new status listener, primed with the current status.
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.listener()
    }

    /// Wait until the connection reaches (or passes) `target`.
    pub async fn await_status(&self, target: Status) -> Result<(), Error> {
        self.status.await_status(target).await
    }

    /// Initiate shutdown: publishes `Shutdown` and closes the
    /// application send queue. The pipeline tears itself down and
    /// [`recv`][`Client::recv`] ends.
    pub fn close(&mut self) {
        self.status.set(Status::Shutdown);
        self.send = None;
    }
}

async fn read_xml<R>(mut framed: FramedRead<R, XmppCodec>, tx: mpsc::Sender<Packet>)
where
    R: AsyncRead + Unpin,
{
    while let Some(result) = framed.next().await {
        match result {
            Ok(packet) => {
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("read: {}", e);
                break;
            }
        }
    }
}

async fn write_xml<W>(mut framed: FramedWrite<W, XmppCodec>, mut rx: mpsc::Receiver<Packet>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = rx.recv().await {
        if let Err(e) = framed.send(packet).await {
            warn!("write: {}", e);
            break;
        }
    }
    let _ = framed.close().await;
}

async fn forward_status(mut rx: watch::Receiver<Status>, tx: mpsc::UnboundedSender<Status>) {
    let mut current = *rx.borrow_and_update();
    loop {
        if tx.send(current).is_err() {
            return;
        }
        if current == Status::Shutdown {
            return;
        }
        if rx.changed().await.is_err() {
            // The publisher is gone without a final transition.
            let _ = tx.send(Status::Shutdown);
            return;
        }
        current = *rx.borrow_and_update();
    }
}
