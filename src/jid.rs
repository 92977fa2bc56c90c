//! Jabber-Id handling: parsing, comparison and the bare/full distinction.

use std::fmt;
use std::str::FromStr;

/// Error produced when parsing an ill-formed JID string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JidParseError {
    /// The domain part is empty.
    NoDomain,
    /// An `@` was present but the node part was empty.
    EmptyNode,
    /// A `/` was present but the resource part was empty.
    EmptyResource,
}

impl fmt::Display for JidParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JidParseError::NoDomain => write!(fmt, "no domain found in this JID"),
            JidParseError::EmptyNode => write!(fmt, "nodepart empty despite the presence of a @"),
            JidParseError::EmptyResource => {
                write!(fmt, "resource empty despite the presence of a /")
            }
        }
    }
}

impl std::error::Error for JidParseError {}

/// A Jabber-Id, identifying an XMPP entity.
///
/// String form is `[node@]domain[/resource]`. The domain is case-folded
/// to lowercase on construction, so the derived equality and hash give
/// octet equality over the folded form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    /// Optional node part, before the `@`.
    pub node: Option<String>,
    /// Mandatory domain part.
    pub domain: String,
    /// Optional resource part, after the `/`.
    pub resource: Option<String>,
}

impl Jid {
    /// Build a JID from its three parts. The domain is folded to
    /// lowercase.
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Jid {
        Jid {
            node: node.map(|s| s.to_owned()),
            domain: domain.to_lowercase(),
            resource: resource.map(|s| s.to_owned()),
        }
    }

    /// Strip the resource part, producing the bare JID.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Does this JID carry a resource part?
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Jid, JidParseError> {
        let (bare, resource) = match s.find('/') {
            Some(pos) => {
                let resource = &s[pos + 1..];
                if resource.is_empty() {
                    return Err(JidParseError::EmptyResource);
                }
                (&s[..pos], Some(resource))
            }
            None => (s, None),
        };
        let (node, domain) = match bare.find('@') {
            Some(pos) => {
                let node = &bare[..pos];
                if node.is_empty() {
                    return Err(JidParseError::EmptyNode);
                }
                (Some(node), &bare[pos + 1..])
            }
            None => (None, bare),
        };
        if domain.is_empty() {
            return Err(JidParseError::NoDomain);
        }
        Ok(Jid::new(node, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref node) = self.node {
            write!(fmt, "{}@", node)?;
        }
        write!(fmt, "{}", self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(fmt, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let jid: Jid = "alice@foo.com/res1".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "foo.com");
        assert_eq!(jid.resource(), Some("res1"));
        assert_eq!(jid.to_string(), "alice@foo.com/res1");
    }

    #[test]
    fn parse_bare() {
        let jid: Jid = "alice@foo.com".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.resource(), None);
        assert!(!jid.is_full());
    }

    #[test]
    fn parse_domain_only() {
        let jid: Jid = "foo.com".parse().unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "foo.com");
    }

    #[test]
    fn resource_may_contain_at_and_slash() {
        let jid: Jid = "alice@foo.com/res@ource/x".parse().unwrap();
        assert_eq!(jid.resource(), Some("res@ource/x"));
    }

    #[test]
    fn domain_case_folded() {
        let a: Jid = "alice@Foo.COM/r".parse().unwrap();
        let b: Jid = "alice@foo.com/r".parse().unwrap();
        assert_eq!(a, b);
        // node and resource stay case-sensitive
        let c: Jid = "Alice@foo.com/r".parse().unwrap();
        assert_ne!(b, c);
    }

    #[test]
    fn bad_jids() {
        assert_eq!("@foo.com".parse::<Jid>(), Err(JidParseError::EmptyNode));
        assert_eq!(
            "alice@foo.com/".parse::<Jid>(),
            Err(JidParseError::EmptyResource)
        );
        assert_eq!("alice@".parse::<Jid>(), Err(JidParseError::NoDomain));
        assert_eq!("".parse::<Jid>(), Err(JidParseError::NoDomain));
    }

    #[test]
    fn bare_strips_resource() {
        let jid: Jid = "alice@foo.com/res1".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "alice@foo.com");
    }
}
