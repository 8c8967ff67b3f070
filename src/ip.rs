//! IP literal classification
//!
//! Host resolution needs to distinguish literal addresses (used directly)
//! from hostnames (delegated to a `Lookup` capability or passed straight to
//! the native open). Mirrors the `net.isIP` family.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Returns `true` if `input` is a literal IPv4 address.
pub fn is_ipv4(input: &str) -> bool {
    input.parse::<Ipv4Addr>().is_ok()
}

/// Returns `true` if `input` is a literal IPv6 address.
pub fn is_ipv6(input: &str) -> bool {
    input.parse::<Ipv6Addr>().is_ok()
}

/// Returns the address family of a literal IP: 4, 6, or 0 for non-literals.
pub fn is_ip(input: &str) -> u8 {
    if is_ipv4(input) {
        4
    } else if is_ipv6(input) {
        6
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_literals() {
        assert!(is_ipv4("127.0.0.1"));
        assert!(is_ipv4("0.0.0.0"));
        assert!(!is_ipv4("256.0.0.1"));
        assert!(!is_ipv4("localhost"));
        assert!(!is_ipv4("::1"));
    }

    #[test]
    fn test_ipv6_literals() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("fe80::1"));
        assert!(is_ipv6("2001:db8::8a2e:370:7334"));
        assert!(!is_ipv6("127.0.0.1"));
        assert!(!is_ipv6("example.com"));
    }

    #[test]
    fn test_is_ip_family() {
        assert_eq!(is_ip("127.0.0.1"), 4);
        assert_eq!(is_ip("::1"), 6);
        assert_eq!(is_ip("not-an-ip"), 0);
        assert_eq!(is_ip(""), 0);
    }
}
