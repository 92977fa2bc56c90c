//! Roster (contact list) support, RFC 3921 section 7.
//!
//! The roster extension is always installed. Its receive filter
//! observes roster iqs on their way to the application, keeping a
//! private snapshot keyed by bare JID, and passes everything through
//! unmodified. Its send filter merges roster-originated requests into
//! the outbound flow.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ProtocolError};
use crate::extension::Extension;
use crate::filter::{Filter, QUEUE_DEPTH};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, Nested, Stanza};

/// One roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterItem {
    /// The contact's JID.
    pub jid: Jid,
    /// Display name, if set.
    pub name: Option<String>,
    /// Subscription state (none, to, from, both, remove).
    pub subscription: Option<String>,
    /// Groups the contact belongs to.
    pub groups: Vec<String>,
}

/// A `jabber:iq:roster` query payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterQuery {
    /// The items carried by the query.
    pub items: Vec<RosterItem>,
}

impl RosterQuery {
    fn from_element(el: &Element) -> Result<Nested, ProtocolError> {
        let mut items = Vec::new();
        for child in el.children() {
            if !child.is("item", ns::ROSTER) {
                continue;
            }
            let jid = match child.attr("jid") {
                Some(jid) => match jid.parse() {
                    Ok(jid) => jid,
                    Err(e) => {
                        warn!("roster item with bad jid {:?}: {}", jid, e);
                        continue;
                    }
                },
                None => continue,
            };
            items.push(RosterItem {
                jid,
                name: child.attr("name").map(|n| n.to_owned()),
                subscription: child.attr("subscription").map(|s| s.to_owned()),
                groups: child
                    .children()
                    .filter(|g| g.is("group", ns::ROSTER))
                    .map(|g| g.text())
                    .collect(),
            });
        }
        Ok(Arc::new(RosterQuery { items }))
    }
}

enum RosterCmd {
    Get(oneshot::Sender<Vec<RosterItem>>),
    WaitFor(String, oneshot::Sender<()>),
}

/// Handle to the roster state owned by the client.
#[derive(Clone)]
pub struct Roster {
    cmds: mpsc::Sender<RosterCmd>,
    to_server: mpsc::Sender<Stanza>,
}

impl Roster {
    /// The most recent snapshot of the roster, keyed by bare JID
    /// internally. Updated automatically as roster pushes and query
    /// results are observed.
    pub async fn get(&self) -> Vec<RosterItem> {
        let (reply, result) = oneshot::channel();
        if self.cmds.send(RosterCmd::Get(reply)).await.is_err() {
            return Vec::new();
        }
        result.await.unwrap_or_default()
    }

    /// Fetch the roster from the server and wait until the reply has
    /// been folded into the snapshot.
    pub async fn update(&self) -> Result<(), Error> {
        let iq = Iq::get(Element::builder("query", ns::ROSTER).build());
        let id = iq.header.id.clone().ok_or(Error::InvalidState)?;
        let (reply, done) = oneshot::channel();
        self.cmds
            .send(RosterCmd::WaitFor(id, reply))
            .await
            .map_err(|_| Error::Disconnected)?;
        self.to_server
            .send(iq.into())
            .await
            .map_err(|_| Error::Disconnected)?;
        done.await.map_err(|_| Error::Disconnected)
    }
}

async fn roster_mgr(mut cmds: mpsc::Receiver<RosterCmd>, mut updates: mpsc::Receiver<Stanza>) {
    let mut roster: HashMap<Jid, RosterItem> = HashMap::new();
    let mut waits: HashMap<String, oneshot::Sender<()>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(RosterCmd::Get(reply)) => {
                    let _ = reply.send(roster.values().cloned().collect());
                }
                Some(RosterCmd::WaitFor(id, reply)) => {
                    waits.insert(id, reply);
                }
                None => break,
            },
            stanza = updates.recv() => match stanza {
                Some(stanza) => {
                    if let Stanza::Iq(ref iq) = stanza {
                        let carries_items = matches!(
                            iq.header.type_.as_deref(),
                            Some("set") | Some("result")
                        );
                        if carries_items {
                            if let Some(query) = iq.header.nested::<RosterQuery>() {
                                for item in &query.items {
                                    roster.insert(item.jid.bare(), item.clone());
                                }
                            }
                        }
                    }
                    // Wake any fetch waiting on this reply, after the
                    // items are in the snapshot.
                    if let Some(id) = stanza.header().id.as_ref() {
                        if let Some(reply) = waits.remove(id) {
                            let _ = reply.send(());
                        }
                    }
                }
                None => break,
            },
        }
    }
}

/// Build the roster handle and its extension registration.
pub(crate) fn roster_ext() -> (Roster, Extension) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (upd_tx, upd_rx) = mpsc::channel(QUEUE_DEPTH);
    let (srv_tx, srv_rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(roster_mgr(cmd_rx, upd_rx));

    let recv: Filter = Box::new(move |mut input, output| {
        Box::pin(async move {
            while let Some(stanza) = input.recv().await {
                // Tee a copy to the roster task; stanzas pass through
                // unmodified.
                let _ = upd_tx.send(stanza.clone()).await;
                if output.send(stanza).await.is_err() {
                    break;
                }
            }
        })
    });

    let send: Filter = Box::new(move |mut input, output| {
        Box::pin(async move {
            let mut srv_rx = srv_rx;
            let mut local_open = true;
            loop {
                tokio::select! {
                    stanza = input.recv() => match stanza {
                        Some(stanza) => {
                            if output.send(stanza).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    stanza = srv_rx.recv(), if local_open => match stanza {
                        Some(stanza) => {
                            if output.send(stanza).await.is_err() {
                                break;
                            }
                        }
                        None => local_open = false,
                    },
                }
            }
        })
    });

    let extension = Extension {
        stanza_handlers: HashMap::new(),
        recv_filter: Some(recv),
        send_filter: Some(send),
    }
    .handle(ns::ROSTER, "query", Arc::new(RosterQuery::from_element));

    let roster = Roster {
        cmds: cmd_tx,
        to_server: srv_tx,
    };
    (roster, extension)
}
