//! Minimal binary multiaddr decoding: only the leading host component matters here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

const IP4: u64 = 0x04;
const IP6: u64 = 0x29;
const DNS: u64 = 0x35;
const DNS4: u64 = 0x36;
const DNS6: u64 = 0x37;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFamily {
    Any,
    V4,
    V6,
}

impl DnsFamily {
    pub fn admits(self, ip: &IpAddr) -> bool {
        match self {
            DnsFamily::Any => true,
            DnsFamily::V4 => ip.is_ipv4(),
            DnsFamily::V6 => ip.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Dns { name: String, family: DnsFamily },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultiaddrError {
    #[error("empty multiaddr")]
    Empty,
    #[error("multiaddr truncated")]
    Truncated,
    #[error("unsupported multiaddr protocol 0x{0:x}")]
    UnsupportedProtocol(u64),
    #[error("dns name is not valid utf-8")]
    InvalidUtf8,
}

fn read_varint(bytes: &[u8]) -> Result<(u64, &[u8]), MultiaddrError> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[i + 1..]));
        }
    }
    Err(MultiaddrError::Truncated)
}

fn take(bytes: &[u8], len: usize) -> Result<&[u8], MultiaddrError> {
    bytes.get(..len).ok_or(MultiaddrError::Truncated)
}

/// Decode the host part of a binary multiaddr. Trailing components
/// (`/tcp/…`, `/p2p/…`) are ignored.
pub fn decode_host(bytes: &[u8]) -> Result<Host, MultiaddrError> {
    if bytes.is_empty() {
        return Err(MultiaddrError::Empty);
    }
    let (code, rest) = read_varint(bytes)?;
    match code {
        IP4 => {
            let raw = take(rest, 4)?;
            Ok(Host::Ip(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))))
        }
        IP6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(take(rest, 16)?);
            Ok(Host::Ip(IpAddr::V6(Ipv6Addr::from(octets))))
        }
        DNS | DNS4 | DNS6 => {
            let (len, rest) = read_varint(rest)?;
            let raw = take(rest, usize::try_from(len).map_err(|_| MultiaddrError::Truncated)?)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| MultiaddrError::InvalidUtf8)?
                .to_string();
            let family = match code {
                DNS4 => DnsFamily::V4,
                DNS6 => DnsFamily::V6,
                _ => DnsFamily::Any,
            };
            Ok(Host::Dns { name, family })
        }
        other => Err(MultiaddrError::UnsupportedProtocol(other)),
    }
}

/// Private, loopback, link-local, shared and otherwise non-routable addresses
/// that a geolocation service cannot place.
pub fn is_bogon(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || a == 0
                || (a == 100 && (64..128).contains(&b))
                || a >= 240
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_bogon(&IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || first == 0x2001 && v6.segments()[1] == 0x0db8
        }
    }
}
