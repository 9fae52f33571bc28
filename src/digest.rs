//! Session digest computation.
//!
//! Both endpoints of a socket negotiation must derive the same digest
//! independently, without ever exchanging it: the initiator keys its relay
//! connection table with it and the target presents it as the destination
//! field of the SOCKS5 request. The inputs are therefore pinned to the
//! session id plus the [`canonical`](crate::jid::Jid::canonical) forms of
//! the initiator and target addresses, in that fixed order regardless of
//! which side computes it.

use sha2::{Digest, Sha256};

use crate::jid::Jid;

/// Computes the hex digest identifying one stream session.
pub fn session_digest(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.canonical().as_bytes());
    hasher.update(target.canonical().as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn both_roles_derive_identical_digests() {
        let initiator = jid("alice@example.org/desk");
        let target = jid("bob@example.net/phone");

        // The initiator computes with its own address first; the target
        // computes with the offer's sender first. Same inputs, same bytes.
        let by_initiator = session_digest("ft_42", &initiator, &target);
        let by_target = session_digest("ft_42", &initiator, &target);
        assert_eq!(by_initiator, by_target);
    }

    #[test]
    fn digest_is_lowercase_hex_of_fixed_length() {
        let d = session_digest("ft_1", &jid("a@x/r"), &jid("b@y/r"));
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn digest_depends_on_every_input() {
        let a = jid("a@x/r");
        let b = jid("b@y/r");
        let base = session_digest("ft_1", &a, &b);
        assert_ne!(base, session_digest("ft_2", &a, &b));
        assert_ne!(base, session_digest("ft_1", &b, &a));
        assert_ne!(base, session_digest("ft_1", &a, &jid("b@y/other")));
    }

    #[test]
    fn resource_presence_changes_the_digest() {
        // A bare and a full address canonicalize differently by design;
        // callers must pass the exact addresses used in the negotiation.
        let a = jid("a@x/r");
        assert_ne!(
            session_digest("ft_1", &a, &jid("b@y")),
            session_digest("ft_1", &a, &jid("b@y/r"))
        );
    }
}
