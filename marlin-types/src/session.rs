//! The session address keying reliable-messaging sessions and throttling.

use std::net::SocketAddr;

/// Identifies one client session: user, desktop, socket, and path.
///
/// Equality and hashing cover all four members; one reliable-messaging
/// session exists per address. The absolute path is lowercased on
/// construction so lookups are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionAddress {
    /// SID string of the authenticated user; empty when anonymous.
    pub user_sid: String,
    /// Remote desktop id; zero for a local session.
    pub desktop: u32,
    /// Socket address of the peer.
    pub address: SocketAddr,
    /// Lowercased absolute path of the request.
    pub abs_path: String,
}

impl SessionAddress {
    /// Builds an address, lowercasing the path.
    pub fn new(
        user_sid: impl Into<String>,
        desktop: u32,
        address: SocketAddr,
        abs_path: &str,
    ) -> Self {
        SessionAddress {
            user_sid: user_sid.into(),
            desktop,
            address,
            abs_path: abs_path.to_ascii_lowercase(),
        }
    }

    /// The same address with the path member cleared.
    ///
    /// Throttling keys on the client alone, not on the path it requests.
    pub fn without_path(&self) -> SessionAddress {
        SessionAddress {
            user_sid: self.user_sid.clone(),
            desktop: self.desktop,
            address: self.address,
            abs_path: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn path_is_lowercased() {
        let address = SessionAddress::new("S-1-5-21", 0, addr(1234), "/Some/Path");
        assert_eq!(address.abs_path, "/some/path");
    }

    #[test]
    fn all_four_members_participate_in_equality() {
        let base = SessionAddress::new("S-1", 1, addr(1), "/a");
        assert_ne!(base, SessionAddress::new("S-2", 1, addr(1), "/a"));
        assert_ne!(base, SessionAddress::new("S-1", 2, addr(1), "/a"));
        assert_ne!(base, SessionAddress::new("S-1", 1, addr(2), "/a"));
        assert_ne!(base, SessionAddress::new("S-1", 1, addr(1), "/b"));
        assert_eq!(base, SessionAddress::new("S-1", 1, addr(1), "/A"));
    }

    #[test]
    fn usable_as_a_map_key() {
        let mut sessions = HashMap::new();
        sessions.insert(SessionAddress::new("S-1", 0, addr(9), "/svc"), 1u64);
        assert_eq!(
            sessions.get(&SessionAddress::new("S-1", 0, addr(9), "/SVC")),
            Some(&1)
        );
    }
}
