//! Server discovery: find and dial the TCP endpoint behind a domain.
//!
//! Clients query `_xmpp-client._tcp.<domain>` for SRV records, walk
//! the targets in priority order until a connection succeeds, and
//! treat a domain without usable records as its own target on the
//! fallback port.

use std::cmp::Reverse;
use std::net::{IpAddr, SocketAddr};

use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};
use tokio::net::TcpStream;

use crate::error::Error;

/// How to locate the server for a connection.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Discover the server through DNS SRV records.
    Srv {
        /// Domain whose records are consulted.
        domain: String,
        /// SRV service label, e.g. `_xmpp-client._tcp`.
        service: String,
        /// Port to dial on the domain itself when it has no usable
        /// records.
        fallback_port: u16,
    },
    /// Skip discovery and dial a known host.
    Host {
        /// Server host name or IP literal.
        host: String,
        /// Server port.
        port: u16,
    },
    /// Dial a literal socket address.
    Addr(SocketAddr),
}

impl DnsConfig {
    /// Standard client discovery for `domain`: `_xmpp-client._tcp`
    /// records, port 5222 as the fallback.
    pub fn client(domain: &str) -> DnsConfig {
        DnsConfig::srv(domain, "_xmpp-client._tcp", 5222)
    }

    /// SRV discovery with a custom service label and fallback port.
    pub fn srv(domain: &str, service: &str, fallback_port: u16) -> DnsConfig {
        DnsConfig::Srv {
            domain: domain.to_owned(),
            service: service.to_owned(),
            fallback_port,
        }
    }

    /// A fixed host and port.
    pub fn host(host: &str, port: u16) -> DnsConfig {
        DnsConfig::Host {
            host: host.to_owned(),
            port,
        }
    }

    /// A literal `ip:port` address. A malformed address fails here
    /// rather than at connect time.
    pub fn addr(addr: &str) -> Result<DnsConfig, Error> {
        Ok(DnsConfig::Addr(addr.parse()?))
    }

    /// Resolve the configuration to a connected `TcpStream`.
    pub async fn resolve(&self) -> Result<TcpStream, Error> {
        match self {
            DnsConfig::Srv {
                domain,
                service,
                fallback_port,
            } => {
                let domain = idna::domain_to_ascii(domain)?;
                let mut last = None;
                for (host, port) in srv_targets(&domain, service, *fallback_port).await? {
                    match dial(&host, port).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            info!("{}:{} unreachable: {}", host, port, e);
                            last = Some(e);
                        }
                    }
                }
                Err(last.unwrap_or(Error::Disconnected))
            }
            DnsConfig::Host { host, port } => dial(host, *port).await,
            DnsConfig::Addr(addr) => Ok(TcpStream::connect(addr).await?),
        }
    }
}

/// The ordered candidate list for an SRV service: records sorted by
/// priority, heavier weights first within a priority, or the domain
/// itself on the fallback port when the lookup yields nothing usable.
async fn srv_targets(
    domain: &str,
    service: &str,
    fallback_port: u16,
) -> Result<Vec<(String, u16)>, Error> {
    let fallback = vec![(domain.to_owned(), fallback_port)];

    // An IP literal cannot carry records of its own.
    if domain.parse::<IpAddr>().is_ok() {
        return Ok(fallback);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let lookup = match resolver.srv_lookup(format!("{}.{}.", service, domain)).await {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!("no SRV records for {}: {}", domain, e);
            return Ok(fallback);
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    records.sort_by_key(|record| (record.priority(), Reverse(record.weight())));
    let targets: Vec<_> = records
        .into_iter()
        .map(|record| (record.target().to_ascii(), record.port()))
        // A lone root target declares the service decidedly absent.
        .filter(|(host, _)| host != ".")
        .collect();

    if targets.is_empty() {
        Ok(fallback)
    } else {
        Ok(targets)
    }
}

/// Dial one candidate host, trying each of its addresses in turn.
async fn dial(host: &str, port: u16) -> Result<TcpStream, Error> {
    let host = idna::domain_to_ascii(host)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(TcpStream::connect(SocketAddr::new(ip, port)).await?);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let mut last = None;
    for ip in resolver.lookup_ip(host.as_str()).await? {
        debug!("dialing {} at {}:{}", host, ip, port);
        match TcpStream::connect(SocketAddr::new(ip, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => Err(e.into()),
        None => Err(Error::Disconnected),
    }
}
