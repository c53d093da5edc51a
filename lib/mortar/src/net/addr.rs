use crate::net::support::{ErrorType, NetworkError};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Local,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Family/kind pair describing how a socket is to be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SocketParams {
    pub family: AddressFamily,
    pub kind: SocketKind,
}

/// A bindable endpoint: an internet `host:port` (v4 or bracketed v6, with an
/// optional `%scope` inside the brackets) or a local filesystem path.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BindAddress {
    Inet(SocketAddr),
    Local(PathBuf),
}

impl BindAddress {
    #[inline]
    pub fn family(&self) -> AddressFamily {
        match self {
            BindAddress::Inet(addr) if addr.is_ipv4() => AddressFamily::Inet,
            BindAddress::Inet(_) => AddressFamily::Inet6,
            BindAddress::Local(_) => AddressFamily::Local,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, BindAddress::Local(_))
    }

    pub fn params(&self, kind: SocketKind) -> SocketParams {
        SocketParams {
            family: self.family(),
            kind,
        }
    }
}

impl FromStr for BindAddress {
    type Err = NetworkError;

    fn from_str(value: &str) -> Result<BindAddress, NetworkError> {
        if let Some(path) = value.strip_prefix("unix:") {
            return Ok(BindAddress::Local(PathBuf::from(path)));
        }

        if value.contains('/') {
            return Ok(BindAddress::Local(PathBuf::from(value)));
        }

        // Plain v4 and scopeless bracketed v6 parse directly.
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(BindAddress::Inet(addr));
        }

        parse_scoped_v6(value)
            .map(BindAddress::Inet)
            .ok_or(NetworkError::Fatal(ErrorType::AddrParse))
    }
}

/// `[fe80::1%3]:8080` — a bracketed v6 address carrying a numeric scope id.
fn parse_scoped_v6(value: &str) -> Option<SocketAddr> {
    let rest = value.strip_prefix('[')?;
    let close = rest.find(']')?;
    let inner = &rest[..close];
    let port = rest[close + 1..].strip_prefix(':')?.parse::<u16>().ok()?;

    let (ip_text, scope_text) = match inner.find('%') {
        Some(pos) => (&inner[..pos], &inner[pos + 1..]),
        None => (inner, ""),
    };

    let ip = ip_text.parse::<Ipv6Addr>().ok()?;
    let scope = match scope_text {
        "" => 0,
        text => text.parse::<u32>().ok()?,
    };

    Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)))
}

impl fmt::Display for BindAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BindAddress::Inet(SocketAddr::V4(addr)) => write!(formatter, "{}", addr),
            BindAddress::Inet(SocketAddr::V6(addr)) => match addr.scope_id() {
                0 => write!(formatter, "[{}]:{}", addr.ip(), addr.port()),
                scope => write!(formatter, "[{}%{}]:{}", addr.ip(), scope, addr.port()),
            },
            BindAddress::Local(path) => write!(formatter, "{}", path.display()),
        }
    }
}

/// Identity of a connected peer. Local-family peers are anonymous.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PeerAddress {
    Inet(SocketAddr),
    Local,
}

impl PeerAddress {
    #[inline]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddress::Inet(addr) => Some(addr.ip()),
            PeerAddress::Local => None,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerAddress::Inet(addr) => write!(formatter, "{}", addr),
            PeerAddress::Local => write!(formatter, "local"),
        }
    }
}
