// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Parsers for output of commands issued on the provisioning server.
//!
//! Every parser returns `Ok(None)` when the output carries nothing it
//! recognizes and an error only when it recognizes the output but cannot make
//! sense of it.

use core::net;

use bytesize::ByteSize;
use thiserror;

/// Wraps parser errors.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("invalid value {value:?} for {label}")]
    InvalidValue { label: &'static str, value: String },
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("cannot parse guest agent response: {0}")]
    GuestAgent(String),
}

const CPUS_LABEL: &str = "CPUs";
const MEMORY_LABEL: &str = "Memory";
const MAC_LABEL: &str = "MAC";

/// Guest properties reported by the image clone tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuestMetadata {
    pub cpus: Option<u32>,
    pub memory: Option<ByteSize>,
    pub mac: Option<String>,
}

fn parse_memory(value: &str) -> Option<ByteSize> {
    let mut parts = value.split_whitespace();
    let amount = parts.next()?.parse::<u64>().ok()?;
    let size = match parts.next() {
        None | Some("MB") | Some("MiB") => ByteSize::mib(amount),
        Some("GB") | Some("GiB") => ByteSize::gib(amount),
        Some(_) => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(size)
}

fn is_mac(value: &str) -> bool {
    let octets: Vec<&str> = value.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Parses the metadata block printed after a guest is cloned.
///
/// The block is line oriented, each line being `<label>:<whitespace><value>`:
///
/// ```text
/// CPUs:     1
/// Memory:   512 MB
/// MAC:      52:54:00:f7:bb:a8
/// ```
///
/// Lines with other labels are ignored. Returns `None` when none of the known
/// labels is present.
pub fn parse_metadata<S>(lines: &[S]) -> Result<Option<GuestMetadata>, ParseError>
where
    S: AsRef<str>,
{
    let mut meta = GuestMetadata::default();
    let mut found = false;

    for line in lines {
        let Some((label, value)) = line.as_ref().split_once(':') else {
            continue;
        };
        let value = value.trim();
        let invalid = |label: &'static str| ParseError::InvalidValue {
            label,
            value: value.to_string(),
        };

        match label.trim() {
            CPUS_LABEL => {
                meta.cpus = Some(value.parse::<u32>().map_err(|_| invalid(CPUS_LABEL))?);
            }
            MEMORY_LABEL => {
                meta.memory = Some(parse_memory(value).ok_or_else(|| invalid(MEMORY_LABEL))?);
            }
            MAC_LABEL => {
                if !is_mac(value) {
                    return Err(invalid(MAC_LABEL));
                }
                meta.mac = Some(value.to_lowercase());
            }
            _ => continue,
        }
        found = true;
    }

    Ok(found.then_some(meta))
}

/// Parses an IPv4 address enclosed in parentheses, as in
/// `PING host.example.com (192.168.0.1) 56(84) bytes of data.`
///
/// Parenthesized text that does not look like a dotted address is skipped,
/// as are loopback addresses.
/// Text made of digits and dots which is not a valid address is an error.
pub fn parse_legacy_address<S>(lines: &[S]) -> Result<Option<net::Ipv4Addr>, ParseError>
where
    S: AsRef<str>,
{
    for line in lines {
        let mut rest = line.as_ref();
        while let Some(start) = rest.find('(') {
            let after = &rest[start + 1..];
            let Some(end) = after.find(')') else {
                break;
            };
            let candidate = after[..end].trim();
            rest = &after[end + 1..];

            let dotted = candidate.contains('.')
                && candidate.chars().all(|c| c.is_ascii_digit() || c == '.');
            if !dotted {
                continue;
            }
            let addr = candidate
                .parse::<net::Ipv4Addr>()
                .map_err(|_| ParseError::InvalidAddress(candidate.to_string()))?;
            if addr.is_loopback() {
                log::debug!("skipping loopback address {}", addr);
                continue;
            }
            return Ok(Some(addr));
        }
    }
    Ok(None)
}

pub mod qga {
    pub mod types {
        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct IpAddress {
            #[serde(rename = "ip-address-type")]
            pub address_type: String,
            #[serde(rename = "ip-address")]
            pub address: String,
            #[serde(default)]
            pub prefix: Option<u8>,
        }

        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct Interface {
            pub name: String,
            #[serde(rename = "ip-addresses", default)]
            pub ip_addresses: Vec<IpAddress>,
            #[serde(rename = "hardware-address", default)]
            pub hardware_address: Option<String>,
        }

        /// Response to `guest-network-get-interfaces`.
        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct NetworkInterfaces {
            #[serde(rename = "return")]
            pub interfaces: Vec<Interface>,
        }
    }
}

/// Parses the guest agent response listing network interfaces and picks the
/// first IPv4 address that is not a loopback one. Interface `lo` is skipped
/// entirely.
pub fn parse_guest_agent_address(text: &str) -> Result<Option<net::Ipv4Addr>, ParseError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let resp = serde_json::from_str::<qga::types::NetworkInterfaces>(text)
        .map_err(|e| ParseError::GuestAgent(e.to_string()))?;

    for iface in resp.interfaces.iter() {
        if iface.name == "lo" {
            continue;
        }

        for ifaceaddr in iface.ip_addresses.iter() {
            if ifaceaddr.address_type != "ipv4" {
                continue;
            }

            match ifaceaddr.address.parse::<net::Ipv4Addr>() {
                Ok(addr) if addr.is_loopback() => continue,
                Ok(addr) => {
                    log::debug!("found address {} on {}", addr, iface.name);
                    return Ok(Some(addr));
                }
                Err(_) => log::debug!("cannot parse address {:?}", ifaceaddr.address),
            }
        }
    }

    Ok(None)
}
