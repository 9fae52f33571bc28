//! Peer address type.
//!
//! A [`Jid`] is a `node@domain/resource` triple. The [`Jid::canonical`] form
//! is the single pinned rendering used on both ends of a negotiation to
//! derive the relay session digest; it must never change independently of
//! the digest computation.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A parsed peer address.
///
/// `node` and `resource` may be empty (bare domain addresses identify
/// services such as relay hosts); `domain` is always non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Parses an address of the form `node@domain/resource` where the node
    /// and resource parts are optional.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (node, rest) = match s.split_once('@') {
            Some((node, rest)) => (node, rest),
            None => ("", s),
        };
        let (domain, resource) = match rest.split_once('/') {
            Some((domain, resource)) => (domain, resource),
            None => (rest, ""),
        };
        if domain.is_empty() || domain.contains('@') {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            node: node.to_string(),
            domain: domain.to_string(),
            resource: resource.to_string(),
        })
    }

    /// Creates a bare domain address, as used for services.
    pub fn domain_only(domain: impl Into<String>) -> Self {
        Self {
            node: String::new(),
            domain: domain.into(),
            resource: String::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the address without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    /// The pinned canonical rendering used for digest computation.
    ///
    /// Always `node@domain/resource` with empty node or resource rendered
    /// as empty strings around the fixed separators, so that both roles of
    /// a negotiation derive bit-for-bit identical input without exchanging
    /// it.
    pub fn canonical(&self) -> String {
        format!("{}@{}/{}", self.node, self.domain, self.resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.node.is_empty() {
            write!(f, "{}@", self.node)?;
        }
        f.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_address() {
        let jid = Jid::parse("alice@example.org/desk").unwrap();
        assert_eq!(jid.node(), "alice");
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), "desk");
    }

    #[test]
    fn parse_bare_address() {
        let jid = Jid::parse("alice@example.org").unwrap();
        assert_eq!(jid.resource(), "");
        assert_eq!(jid.to_string(), "alice@example.org");
    }

    #[test]
    fn parse_domain_address() {
        let jid = Jid::parse("relay.example.org").unwrap();
        assert_eq!(jid.node(), "");
        assert_eq!(jid.domain(), "relay.example.org");
        assert_eq!(jid.to_string(), "relay.example.org");
    }

    #[test]
    fn parse_rejects_empty_domain() {
        assert!(Jid::parse("alice@").is_err());
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("a@b@c").is_err());
    }

    #[test]
    fn canonical_is_stable_for_all_shapes() {
        assert_eq!(
            Jid::parse("alice@example.org/desk").unwrap().canonical(),
            "alice@example.org/desk"
        );
        assert_eq!(
            Jid::parse("alice@example.org").unwrap().canonical(),
            "alice@example.org/"
        );
        assert_eq!(
            Jid::parse("relay.example.org").unwrap().canonical(),
            "@relay.example.org/"
        );
    }

    #[test]
    fn bare_strips_resource_only() {
        let jid = Jid::parse("alice@example.org/desk").unwrap();
        assert_eq!(jid.bare().to_string(), "alice@example.org");
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for s in ["alice@example.org/desk", "alice@example.org", "example.org"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }
}
