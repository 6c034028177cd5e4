//! IP range whitelisting
//!
//! Ranges are given as a single address (`127.0.0.1`), CIDR notation
//! (`192.168.10.0/24`) or an explicit inclusive span
//! (`192.168.1.100 - 192.168.1.120`). Comparison happens on the 16-byte
//! representation, so IPv4 and IPv6 entries can be mixed freely.

use std::net::IpAddr;

use crate::error::{ProxyError, Result};

/// An inclusive range of IP addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    pub from: IpAddr,
    pub to: IpAddr,
}

impl IpRange {
    /// Whether `ip` falls inside this range, bounds included.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let test = to_sixteen(ip);
        test >= to_sixteen(self.from) && test <= to_sixteen(self.to)
    }

    /// Parse a range string in single-address, CIDR or `from-to` form.
    pub fn parse(s: &str) -> Result<IpRange> {
        if s.is_empty() {
            return Err(invalid_range(s));
        }

        let parts: Vec<&str> = s.split('-').collect();
        match parts.len() {
            1 => {
                let spec = parts[0].trim();
                match spec.split_once('/') {
                    None => {
                        let ip: IpAddr = spec.parse().map_err(|_| invalid_range(s))?;
                        Ok(IpRange { from: ip, to: ip })
                    }
                    Some((addr, prefix)) => cidr_to_range(addr, prefix).ok_or_else(|| invalid_range(s)),
                }
            }
            2 => {
                let from: IpAddr = parts[0].trim().parse().map_err(|_| invalid_range(s))?;
                let to: IpAddr = parts[1].trim().parse().map_err(|_| invalid_range(s))?;
                if to_sixteen(from) > to_sixteen(to) {
                    return Err(invalid_range(s));
                }
                Ok(IpRange { from, to })
            }
            _ => Err(invalid_range(s)),
        }
    }

    /// Parse a comma-separated list of range strings.
    pub fn parse_list(s: &str) -> Result<Vec<IpRange>> {
        s.split(',').map(IpRange::parse).collect()
    }
}

fn invalid_range(s: &str) -> ProxyError {
    ProxyError::Config(format!("invalid IP range string format: {s}"))
}

/// Map an address to its 16-byte form so IPv4 and IPv6 compare uniformly.
fn to_sixteen(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Expand CIDR notation into its first and last addresses, e.g.
/// `62.76.47.12/28` becomes 62.76.47.0 - 62.76.47.15.
fn cidr_to_range(addr: &str, prefix: &str) -> Option<IpRange> {
    let ip: IpAddr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;

    match ip {
        IpAddr::V4(v4) => {
            if prefix > 32 {
                return None;
            }
            let base = u32::from(v4);
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let from = base & mask;
            let to = from | !mask;
            Some(IpRange {
                from: IpAddr::V4(from.into()),
                to: IpAddr::V4(to.into()),
            })
        }
        IpAddr::V6(v6) => {
            if prefix > 128 {
                return None;
            }
            let base = u128::from(v6);
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            let from = base & mask;
            let to = from | !mask;
            Some(IpRange {
                from: IpAddr::V6(from.into()),
                to: IpAddr::V6(to.into()),
            })
        }
    }
}
