//! Extensions add nested-payload decoders and stanza filters to a
//! client. The element decoders form a registry keyed by qualified
//! name; when a stanza child matches an entry, the constructor runs
//! and its value is appended to the stanza header's nested payloads.

use std::collections::HashMap;
use std::sync::Arc;

use minidom::Element;

use crate::error::{Error, ProtocolError};
use crate::filter::Filter;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Nested;

/// Constructor invoked for a recognized stanza child; returns the typed
/// nested payload.
pub type NestedParser = Arc<dyn Fn(&Element) -> Result<Nested, ProtocolError> + Send + Sync>;

/// Qualified-name keyed registry of nested-payload constructors, merged
/// from all installed extensions.
pub(crate) type Registry = HashMap<(String, String), NestedParser>;

/// An extension bundles nested-payload decoders with optional filters
/// for each direction.
pub struct Extension {
    /// Maps (namespace, element name) to the constructor used to
    /// decode matching stanza children.
    pub stanza_handlers: HashMap<(String, String), NestedParser>,
    /// Filter inserted into the receive stack, if any.
    pub recv_filter: Option<Filter>,
    /// Filter inserted into the send stack, if any.
    pub send_filter: Option<Filter>,
}

impl Extension {
    /// An extension with no handlers and no filters.
    pub fn new() -> Extension {
        Extension {
            stanza_handlers: HashMap::new(),
            recv_filter: None,
            send_filter: None,
        }
    }

    /// Register a nested-payload constructor for a qualified name.
    pub fn handle(mut self, namespace: &str, name: &str, parser: NestedParser) -> Extension {
        self.stanza_handlers
            .insert((namespace.to_owned(), name.to_owned()), parser);
        self
    }
}

impl Default for Extension {
    fn default() -> Extension {
        Extension::new()
    }
}

/// Merge the handler maps of all extensions into one registry. A
/// qualified name claimed twice is a setup error.
pub(crate) fn merge_registries(extensions: &[Extension]) -> Result<Registry, Error> {
    let mut registry = Registry::new();
    for ext in extensions {
        for (key, parser) in &ext.stanza_handlers {
            if registry.insert(key.clone(), parser.clone()).is_some() {
                return Err(Error::DuplicateExtension(format!(
                    "{{{}}}{}",
                    key.0, key.1
                )));
            }
        }
    }
    Ok(registry)
}

/// The payload of a `<bind/>` element: the resource requested by the
/// client, or the full JID assigned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct BindPayload {
    /// The assigned full JID, present in the server's reply.
    pub jid: Option<Jid>,
    /// The requested resource, present in the client's request.
    pub resource: Option<String>,
}

impl BindPayload {
    fn from_element(el: &Element) -> Result<Nested, ProtocolError> {
        let jid = match el.get_child("jid", ns::BIND) {
            Some(jid_el) => Some(jid_el.text().parse().map_err(|_| {
                ProtocolError::InvalidExtensionPayload("bind".to_owned())
            })?),
            None => None,
        };
        let resource = el
            .get_child("resource", ns::BIND)
            .map(|res| res.text());
        Ok(Arc::new(BindPayload { jid, resource }))
    }
}

/// The mandatory bind extension: decodes `<bind/>` payloads so the
/// stream layer can pick the assigned JID out of the server's reply.
pub(crate) fn bind_ext() -> Extension {
    Extension::new().handle(ns::BIND, "bind", Arc::new(BindPayload::from_element))
}
