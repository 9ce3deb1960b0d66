//! Participant identity and remote endpoint types (§3 Data Model).

use std::net::Ipv4Addr;

/// Identity of a participant. `private_key` is present only for the
/// local user; `public_key` is present for any user one has observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub given_names: Vec<String>,
    pub surnames: Vec<String>,
    pub private_key: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub authenticated_by_me: bool,
}

impl User {
    pub fn local(given_names: Vec<String>, surnames: Vec<String>, private_key: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            given_names,
            surnames,
            private_key: Some(private_key),
            public_key: Some(public_key),
            authenticated_by_me: false,
        }
    }

    /// A user known only by having exchanged a handshake or presence
    /// announcement with them; no local private key.
    pub fn remote(given_names: Vec<String>, surnames: Vec<String>, public_key: Option<Vec<u8>>) -> Self {
        Self {
            given_names,
            surnames,
            private_key: None,
            public_key,
            authenticated_by_me: false,
        }
    }

    /// A placeholder remote user created before any presence
    /// cross-reference is available (e.g. connecting purely by code).
    pub fn unknown() -> Self {
        Self::remote(Vec::new(), Vec::new(), None)
    }

    pub fn is_local(&self) -> bool {
        self.private_key.is_some()
    }
}

/// A remote endpoint: `(ip, port)` is unique per live session.
#[derive(Debug, Clone)]
pub struct Device {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub user: User,
}

impl Device {
    pub fn new(ip: Ipv4Addr, port: u16, user: User) -> Self {
        Self { ip, port, user }
    }
}
