//! This layer of the pipeline reads decoded stream values and responds
//! to them. It negotiates TLS, authentication, resource binding and
//! session establishment, then routes stanzas between the peer and the
//! application. Its outbound half is a gated forwarder that keeps
//! application traffic off the wire until binding completes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;

use crate::codec::{Features, Packet, SaslResponse, StreamError, StreamStart, TlsResponse};
use crate::error::{AuthError, Error, ProtocolError};
use crate::extension::BindPayload;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{next_id, Iq, Presence, Stanza};
use crate::status::{Status, StatusMgr};
use crate::transport::Transport;

/// Commands for the gated outbound forwarder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SendCmd {
    /// Ignore the application queue.
    Deny,
    /// Copy application stanzas through to the codec.
    Allow,
    /// Close the outbound path and terminate.
    Abort,
}

/// A one-shot stanza callback registration. The handler fires on the
/// first inbound stanza carrying `id`; its return decides whether the
/// stanza is also forwarded to the application.
pub(crate) struct HandlerReg {
    pub(crate) id: String,
    pub(crate) f: Box<dyn FnOnce(&Stanza) -> bool + Send>,
}

enum Handler {
    App(Box<dyn FnOnce(&Stanza) -> bool + Send>),
    Bind,
    Session,
}

fn encode_sasl(data: &[u8]) -> String {
    // A zero-length SASL payload is transmitted as "=".
    if data.is_empty() {
        "=".to_owned()
    } else {
        BASE64.encode(data)
    }
}

/// The outbound driver. Until `Allow` arrives (after binding) the
/// application queue is ignored entirely, so nothing the application
/// sends can interleave with stream negotiation.
pub(crate) async fn write_stream(
    xml_out: mpsc::Sender<Packet>,
    mut cli_in: mpsc::Receiver<Stanza>,
    mut control: mpsc::Receiver<SendCmd>,
) {
    let mut allowed = false;
    loop {
        if allowed {
            tokio::select! {
                cmd = control.recv() => match cmd {
                    Some(SendCmd::Allow) => (),
                    Some(SendCmd::Deny) => allowed = false,
                    Some(SendCmd::Abort) | None => break,
                },
                stanza = cli_in.recv() => match stanza {
                    Some(stanza) => {
                        if xml_out.send(Packet::Stanza(stanza)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        } else {
            match control.recv().await {
                Some(SendCmd::Allow) => allowed = true,
                Some(SendCmd::Deny) => (),
                Some(SendCmd::Abort) | None => break,
            }
        }
    }
}

/// Everything the inbound driver needs to run the stream.
pub(crate) struct ReadDriver {
    pub(crate) jid: Jid,
    pub(crate) password: String,
    pub(crate) tls: Arc<ClientConfig>,
    pub(crate) server_name: ServerName<'static>,
    pub(crate) initial_presence: Option<Presence>,
    pub(crate) transport: Transport,
    pub(crate) status: StatusMgr,
    pub(crate) jid_tx: watch::Sender<Jid>,
    pub(crate) xml_out: mpsc::Sender<Packet>,
    pub(crate) control: mpsc::Sender<SendCmd>,
    pub(crate) packets: mpsc::Receiver<Packet>,
    pub(crate) regs: mpsc::Receiver<HandlerReg>,
    pub(crate) cli_out: mpsc::Sender<Stanza>,
}

struct DriverState {
    handlers: HashMap<String, Handler>,
    features: Option<Features>,
    mechanism: Option<Box<dyn Mechanism + Send>>,
    tls_done: bool,
    authenticated: bool,
}

impl ReadDriver {
    /// Run the inbound driver to completion. On exit the application
    /// receive path is closed, the outbound gate aborted and the
    /// status set to `Shutdown`.
    pub(crate) async fn run(mut self) {
        let mut state = DriverState {
            handlers: HashMap::new(),
            features: None,
            mechanism: None,
            tls_done: false,
            authenticated: false,
        };
        enum Incoming {
            Reg(Option<HandlerReg>),
            StatusChanged(bool),
            Packet(Option<Packet>),
        }

        let mut shutdown = self.status.listener();
        let mut regs_open = true;
        loop {
            let incoming = tokio::select! {
                reg = self.regs.recv(), if regs_open => Incoming::Reg(reg),
                changed = shutdown.changed() => Incoming::StatusChanged(changed.is_ok()),
                packet = self.packets.recv() => Incoming::Packet(packet),
            };
            match incoming {
                Incoming::Reg(Some(reg)) => {
                    state.handlers.insert(reg.id, Handler::App(reg.f));
                }
                Incoming::Reg(None) => regs_open = false,
                Incoming::StatusChanged(true) => {
                    if *shutdown.borrow_and_update() == Status::Shutdown {
                        break;
                    }
                }
                Incoming::StatusChanged(false) => break,
                Incoming::Packet(Some(packet)) => {
                    if let Err(e) = self.handle(&mut state, packet).await {
                        info!("stream closing: {}", e);
                        break;
                    }
                }
                Incoming::Packet(None) => break,
            }
        }
        let _ = self.control.try_send(SendCmd::Abort);
        self.status.set(Status::Shutdown);
        // Dropping `cli_out` closes the receive filter chain and, with
        // it, the application's receive queue.
    }

    async fn handle(&mut self, state: &mut DriverState, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::StreamStart(open) => {
                debug!("stream open, id {:?}", open.id);
                Ok(())
            }
            Packet::StreamEnd => Err(Error::Disconnected),
            Packet::StreamError(error) => self.handle_stream_error(error),
            Packet::Features(features) => self.handle_features(state, features).await,
            Packet::Tls(response) => self.handle_tls(state, response).await,
            Packet::Sasl(response) => self.handle_sasl(state, response).await,
            Packet::Stanza(stanza) => self.handle_stanza(state, stanza).await,
            Packet::Generic(el) => {
                warn!("unhandled non-stanza: {{{}}}{}", el.ns(), el.name());
                Ok(())
            }
        }
    }

    fn handle_stream_error(&mut self, error: StreamError) -> Result<(), Error> {
        info!("received stream error: {}", error.condition);
        Err(ProtocolError::StreamError(error.condition).into())
    }

    async fn handle_features(
        &mut self,
        state: &mut DriverState,
        features: Features,
    ) -> Result<(), Error> {
        let starttls = features.starttls.is_some();
        let mechanisms = features.mechanisms.clone();
        let bind = features.bind;
        state.features = Some(features);

        if starttls && !state.tls_done {
            let nonza = Element::builder("starttls", ns::TLS).build();
            return self.send(Packet::Generic(nonza)).await;
        }
        if !mechanisms.is_empty() && !state.authenticated {
            return self.start_sasl(state, &mechanisms).await;
        }
        if bind {
            return self.send_bind(state).await;
        }
        Ok(())
    }

    async fn handle_tls(
        &mut self,
        state: &mut DriverState,
        response: TlsResponse,
    ) -> Result<(), Error> {
        match response {
            TlsResponse::Proceed => {
                self.transport
                    .start_tls(self.tls.clone(), self.server_name.clone())
                    .await?;
                state.tls_done = true;
                state.features = None;
                self.status.set(Status::ConnectedTls);
                // The new TLS session restarts the XML document.
                self.send_stream_header().await
            }
            TlsResponse::Failure => {
                warn!("server refused the TLS upgrade");
                Err(ProtocolError::NoTls.into())
            }
        }
    }

    fn select_mechanism(&self, offered: &[String]) -> Result<Box<dyn Mechanism + Send>, Error> {
        let creds = Credentials::default()
            .with_username(self.jid.node().unwrap_or_default())
            .with_password(self.password.as_str())
            .with_channel_binding(ChannelBinding::None);

        if offered.iter().any(|m| m == "SCRAM-SHA-256") {
            let mech =
                Scram::<Sha256>::from_credentials(creds.clone()).map_err(AuthError::Sasl)?;
            return Ok(Box::new(mech));
        }
        if offered.iter().any(|m| m == "SCRAM-SHA-1") {
            let mech = Scram::<Sha1>::from_credentials(creds.clone()).map_err(AuthError::Sasl)?;
            return Ok(Box::new(mech));
        }
        if offered.iter().any(|m| m == "PLAIN") {
            let mech = Plain::from_credentials(creds).map_err(AuthError::Sasl)?;
            return Ok(Box::new(mech));
        }
        Err(AuthError::NoMechanism.into())
    }

    async fn start_sasl(&mut self, state: &mut DriverState, offered: &[String]) -> Result<(), Error> {
        let mut mechanism = self.select_mechanism(offered)?;
        info!("authenticating with {}", mechanism.name());
        let initial = mechanism.initial();
        let mut auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", mechanism.name())
            .build();
        auth.append_text_node(encode_sasl(&initial));
        state.mechanism = Some(mechanism);
        self.send(Packet::Generic(auth)).await
    }

    async fn handle_sasl(
        &mut self,
        state: &mut DriverState,
        response: SaslResponse,
    ) -> Result<(), Error> {
        match response {
            SaslResponse::Challenge(data) => {
                let mechanism = state.mechanism.as_mut().ok_or(Error::InvalidState)?;
                let response = mechanism
                    .response(&data)
                    .map_err(|e| Error::Auth(AuthError::Sasl(e)))?;
                let mut el = Element::builder("response", ns::SASL).build();
                el.append_text_node(encode_sasl(&response));
                self.send(Packet::Generic(el)).await
            }
            SaslResponse::Success(data) => {
                if let Some(mechanism) = state.mechanism.as_mut() {
                    // Verify the server's final data before trusting
                    // the stream.
                    mechanism
                        .success(&data)
                        .map_err(|e| Error::Auth(AuthError::Sasl(e)))?;
                }
                state.mechanism = None;
                state.authenticated = true;
                state.features = None;
                self.status.set(Status::Authenticated);
                // Authenticated streams start over.
                self.send_stream_header().await
            }
            SaslResponse::Failure(condition) => {
                warn!("authentication failed: {}", condition);
                Err(AuthError::Fail(condition).into())
            }
        }
    }

    async fn send_bind(&mut self, state: &mut DriverState) -> Result<(), Error> {
        let mut bind = Element::builder("bind", ns::BIND).build();
        if let Some(resource) = self.jid.resource() {
            let mut res = Element::builder("resource", ns::BIND).build();
            res.append_text_node(resource);
            bind.append_child(res);
        }
        let id = next_id();
        let mut iq = Iq::set(bind);
        iq.header.id = Some(id.clone());
        // The handler is in place before the request leaves, so the
        // reply cannot race the registration.
        state.handlers.insert(id, Handler::Bind);
        self.send(Packet::Stanza(iq.into())).await
    }

    async fn on_bind_result(
        &mut self,
        state: &mut DriverState,
        stanza: Stanza,
    ) -> Result<(), Error> {
        let iq = match stanza {
            Stanza::Iq(iq) => iq,
            _ => {
                warn!("non-iq bind reply");
                return Err(ProtocolError::InvalidBindResponse.into());
            }
        };
        if iq.is_error() {
            warn!("resource binding failed: {:?}", iq.header.error);
            return Err(ProtocolError::InvalidBindResponse.into());
        }
        let jid = iq
            .header
            .nested::<BindPayload>()
            .and_then(|bind| bind.jid.clone())
            .ok_or(ProtocolError::InvalidBindResponse)?;
        info!("bound resource: {}", jid);
        self.jid = jid.clone();
        self.jid_tx.send_replace(jid);
        self.status.set(Status::Bound);
        self.control
            .send(SendCmd::Allow)
            .await
            .map_err(|_| Error::Disconnected)?;

        let session = state.features.as_ref().map(|f| f.session).unwrap_or(false);
        if session {
            self.send_session(state).await
        } else {
            self.finish_negotiation().await
        }
    }

    async fn send_session(&mut self, state: &mut DriverState) -> Result<(), Error> {
        let id = next_id();
        let mut iq = Iq::set(Element::builder("session", ns::SESSION).build());
        iq.header.id = Some(id.clone());
        iq.header.to = Some(Jid::new(None, self.jid.domain(), None));
        state.handlers.insert(id, Handler::Session);
        self.send(Packet::Stanza(iq.into())).await
    }

    async fn on_session_result(&mut self, stanza: Stanza) -> Result<(), Error> {
        match stanza {
            Stanza::Iq(iq) if !iq.is_error() => self.finish_negotiation().await,
            _ => {
                warn!("cannot start session");
                Err(ProtocolError::SessionFailed.into())
            }
        }
    }

    async fn finish_negotiation(&mut self) -> Result<(), Error> {
        self.status.set(Status::Running);
        if let Some(presence) = self.initial_presence.take() {
            self.send(Packet::Stanza(presence.into())).await?;
        }
        Ok(())
    }

    async fn handle_stanza(
        &mut self,
        state: &mut DriverState,
        stanza: Stanza,
    ) -> Result<(), Error> {
        // Registrations sent before the originating stanza are merged
        // before its reply is dispatched.
        while let Ok(reg) = self.regs.try_recv() {
            state.handlers.insert(reg.id, Handler::App(reg.f));
        }
        if let Some(id) = stanza.header().id.clone() {
            if let Some(handler) = state.handlers.remove(&id) {
                match handler {
                    Handler::App(f) => {
                        let forward = match catch_unwind(AssertUnwindSafe(|| f(&stanza))) {
                            Ok(forward) => forward,
                            Err(_) => {
                                warn!("stanza callback for id {} panicked", id);
                                true
                            }
                        };
                        if !forward {
                            return Ok(());
                        }
                    }
                    Handler::Bind => return self.on_bind_result(state, stanza).await,
                    Handler::Session => return self.on_session_result(stanza).await,
                }
            }
        }
        self.cli_out
            .send(stanza)
            .await
            .map_err(|_| Error::Disconnected)
    }

    async fn send_stream_header(&mut self) -> Result<(), Error> {
        self.send(Packet::StreamStart(StreamStart::client_hello(
            self.jid.domain(),
        )))
        .await
    }

    async fn send(&mut self, packet: Packet) -> Result<(), Error> {
        self.xml_out
            .send(packet)
            .await
            .map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Message;
    use std::sync::Arc as StdArc;

    fn message_with_id(id: &str) -> Stanza {
        let mut msg = Message::default();
        msg.header.id = Some(id.to_owned());
        msg.into()
    }

    #[tokio::test]
    async fn gate_holds_stanzas_until_allow() {
        let (xml_tx, mut xml_rx) = mpsc::channel(8);
        let (cli_tx, cli_rx) = mpsc::channel(8);
        let (ctl_tx, ctl_rx) = mpsc::channel(4);
        tokio::spawn(write_stream(xml_tx, cli_rx, ctl_rx));

        cli_tx.send(message_with_id("a")).await.unwrap();
        cli_tx.send(message_with_id("b")).await.unwrap();
        tokio::task::yield_now().await;
        // Nothing may reach the codec before Allow.
        assert!(xml_rx.try_recv().is_err());

        ctl_tx.send(SendCmd::Allow).await.unwrap();
        for expected in ["a", "b"] {
            match xml_rx.recv().await {
                Some(Packet::Stanza(st)) => {
                    assert_eq!(st.header().id.as_deref(), Some(expected));
                }
                other => panic!("unexpected: {:?}", other),
            }
        }

        ctl_tx.send(SendCmd::Abort).await.unwrap();
        cli_tx.send(message_with_id("c")).await.unwrap();
        assert!(xml_rx.recv().await.is_none());
    }

    struct TestDriver {
        packets: mpsc::Sender<Packet>,
        regs: mpsc::Sender<HandlerReg>,
        cli_out: mpsc::Receiver<Stanza>,
        xml_out: mpsc::Receiver<Packet>,
        control: mpsc::Receiver<SendCmd>,
        status: StatusMgr,
        jid_rx: watch::Receiver<Jid>,
    }

    fn spawn_driver(jid: &str) -> TestDriver {
        let jid: Jid = jid.parse().unwrap();
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (_recv_rd, recv_wr) = tokio::io::simplex(4096);
        let (send_rd, _send_wr) = tokio::io::simplex(4096);
        let transport = Transport::start(client_side, recv_wr, send_rd);

        let (packet_tx, packet_rx) = mpsc::channel(8);
        let (reg_tx, reg_rx) = mpsc::channel(8);
        let (cli_tx, cli_rx) = mpsc::channel(8);
        let (xml_tx, xml_rx) = mpsc::channel(8);
        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        let status = StatusMgr::new();
        let (jid_tx, jid_rx) = watch::channel(jid.clone());

        let driver = ReadDriver {
            jid,
            password: "secret".to_owned(),
            tls: crate::client::default_tls_config(),
            server_name: ServerName::try_from("foo.com".to_owned()).unwrap(),
            initial_presence: Some(Presence::available()),
            transport,
            status: status.clone(),
            jid_tx,
            xml_out: xml_tx,
            control: ctl_tx,
            packets: packet_rx,
            regs: reg_rx,
            cli_out: cli_tx,
        };
        tokio::spawn(driver.run());
        TestDriver {
            packets: packet_tx,
            regs: reg_tx,
            cli_out: cli_rx,
            xml_out: xml_rx,
            control: ctl_rx,
            status,
            jid_rx,
        }
    }

    #[tokio::test]
    async fn callbacks_fire_exactly_once() {
        let mut driver = spawn_driver("alice@foo.com");
        let fired = StdArc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = fired.clone();
        driver
            .regs
            .send(HandlerReg {
                id: "x1".to_owned(),
                f: Box::new(move |_st| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    false
                }),
            })
            .await
            .unwrap();

        // First stanza with the id is consumed by the handler.
        driver
            .packets
            .send(Packet::Stanza(message_with_id("x1")))
            .await
            .unwrap();
        // The second one is forwarded as usual.
        driver
            .packets
            .send(Packet::Stanza(message_with_id("x1")))
            .await
            .unwrap();

        let forwarded = driver.cli_out.recv().await.unwrap();
        assert_eq!(forwarded.header().id.as_deref(), Some("x1"));
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_panic_is_isolated() {
        let mut driver = spawn_driver("alice@foo.com");
        driver
            .regs
            .send(HandlerReg {
                id: "boom".to_owned(),
                f: Box::new(|_st| panic!("handler panic")),
            })
            .await
            .unwrap();
        driver
            .packets
            .send(Packet::Stanza(message_with_id("boom")))
            .await
            .unwrap();
        // The stanza survives and is forwarded; the pipeline lives on.
        let forwarded = driver.cli_out.recv().await.unwrap();
        assert_eq!(forwarded.header().id.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn bind_opens_the_gate_and_emits_presence() {
        let mut driver = spawn_driver("alice@foo.com/wanted");

        // Features advertising bind only.
        driver
            .packets
            .send(Packet::Features(Features {
                bind: true,
                ..Features::default()
            }))
            .await
            .unwrap();

        // The driver must send an iq-set with a <bind> child carrying
        // the requested resource.
        let bind_id = match driver.xml_out.recv().await {
            Some(Packet::Stanza(Stanza::Iq(iq))) => {
                let bind = iq.header.payload_child("bind", ns::BIND).unwrap();
                assert_eq!(
                    bind.get_child("resource", ns::BIND).unwrap().text(),
                    "wanted"
                );
                iq.header.id.unwrap()
            }
            other => panic!("unexpected: {:?}", other),
        };

        // Reply with the server-assigned JID.
        let mut reply = Iq::default();
        reply.header.id = Some(bind_id);
        reply.header.type_ = Some("result".to_owned());
        reply.header.nested.push(StdArc::new(BindPayload {
            jid: Some("alice@foo.com/res1".parse().unwrap()),
            resource: None,
        }));
        driver
            .packets
            .send(Packet::Stanza(reply.into()))
            .await
            .unwrap();

        // The gate opens...
        assert_eq!(driver.control.recv().await, Some(SendCmd::Allow));
        // ...the bound JID replaces the client's...
        driver
            .jid_rx
            .wait_for(|jid| jid.to_string() == "alice@foo.com/res1")
            .await
            .unwrap();
        // ...no session was advertised, so we go straight to Running
        // and the initial presence goes out.
        driver.status.await_status(Status::Running).await.unwrap();
        assert!(matches!(
            driver.xml_out.recv().await,
            Some(Packet::Stanza(Stanza::Presence(_)))
        ));
    }

    #[tokio::test]
    async fn sasl_failure_shuts_down() {
        let mut driver = spawn_driver("alice@foo.com");
        driver
            .packets
            .send(Packet::Sasl(SaslResponse::Failure(
                "not-authorized".to_owned(),
            )))
            .await
            .unwrap();
        driver.status.await_status(Status::Shutdown).await.unwrap();
        assert!(driver.cli_out.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_error_closes_receive_path() {
        let mut driver = spawn_driver("alice@foo.com");
        driver
            .packets
            .send(Packet::StreamError(StreamError {
                condition: "host-gone".to_owned(),
                condition_ns: String::new(),
                text: None,
                lang: None,
            }))
            .await
            .unwrap();
        assert!(driver.cli_out.recv().await.is_none());
        assert_eq!(driver.status.current(), Status::Shutdown);
    }
}
