//! `host:port` endpoint descriptor

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing or validating an [`Address`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address '{0}'. Required <host>:<port>")]
    Malformed(String),

    #[error("invalid port in '{address}': {reason}")]
    InvalidPort { address: String, reason: String },

    #[error("port out of range in '{0}': must be between 1 and 65535")]
    PortOutOfRange(String),

    #[error("cannot resolve '{0}' to an IPv4 address")]
    Unresolvable(String),
}

/// A `host:port` pair.
///
/// Parsing only checks the shape and the port range. [`Address::validate`]
/// additionally requires the host to resolve to at least one IPv4 address,
/// which is a deliberate restriction of this daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback entrance on the given port
    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check that the port is usable and that the host resolves to IPv4.
    pub fn validate(&self) -> Result<(), AddressError> {
        if self.port == 0 {
            return Err(AddressError::PortOutOfRange(self.to_string()));
        }
        self.resolve_ipv4().map(|_| ())
    }

    /// First IPv4 socket address the host resolves to
    pub fn resolve_ipv4(&self) -> Result<SocketAddr, AddressError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| AddressError::Unresolvable(self.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| AddressError::Unresolvable(self.to_string()))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(':').collect();
        let [host, port] = parts.as_slice() else {
            return Err(AddressError::Malformed(s.to_string()));
        };
        if host.trim().is_empty() {
            return Err(AddressError::Malformed(s.to_string()));
        }

        let port: u32 = port.trim().parse().map_err(|e: std::num::ParseIntError| {
            AddressError::InvalidPort {
                address: s.to_string(),
                reason: e.to_string(),
            }
        })?;
        if !(1..=u16::MAX as u32).contains(&port) {
            return Err(AddressError::PortOutOfRange(s.to_string()));
        }

        Ok(Self::new(host.trim(), port as u16))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: Address = "10.0.0.5:22".parse().unwrap();
        assert_eq!(addr.host(), "10.0.0.5");
        assert_eq!(addr.port(), 22);
        assert_eq!(addr.to_string(), "10.0.0.5:22");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(
            "10.0.0.5".parse::<Address>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            "a:b:c".parse::<Address>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            ":22".parse::<Address>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            "host:ssh".parse::<Address>(),
            Err(AddressError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_port_range() {
        assert!(matches!(
            "127.0.0.1:0".parse::<Address>(),
            Err(AddressError::PortOutOfRange(_))
        ));
        assert!(matches!(
            "127.0.0.1:65536".parse::<Address>(),
            Err(AddressError::PortOutOfRange(_))
        ));
        assert!("127.0.0.1:65535".parse::<Address>().is_ok());
    }

    #[test]
    fn test_validate_ipv4_literal() {
        let addr = Address::new("127.0.0.1", 8080);
        assert!(addr.validate().is_ok());
        assert_eq!(
            addr.resolve_ipv4().unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_ipv6_only_literal() {
        // `::1` cannot be written as host:port here, so build it directly
        let addr = Address::new("::1", 22);
        assert!(matches!(
            addr.validate(),
            Err(AddressError::Unresolvable(_))
        ));
    }
}
