// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Topology configuration. A config file describes one node: its own listen
//! address (and, depending on the protocol, its id or the network size and
//! whether it initiates), followed by the addresses of its direct neighbours.
//!
//! ```text
//! 127.0.0.1:7001:1:init     <- this node: host:port:id, 4th field = initiator
//! 127.0.0.1:7002            <- neighbours, one host:port per line
//! 127.0.0.1:7003
//! ```
//!
//! Neighbour order is significant: it is the order waves fan out in and the
//! order subtree sizes are accumulated in.

use crate::{Error, Result};
use itertools::Itertools;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Which member of the wave family a node runs.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Protocol {
    /// Single-wave echo: spanning tree plus termination detection.
    Echo,
    /// Echo with extinction over static node ids.
    Election,
    /// Randomized round-based election without ids.
    Anonymous,
}

impl Protocol {
    /// Whether waves carry competing leader values.
    pub fn elects(&self) -> bool {
        !matches!(self, Protocol::Echo)
    }

    /// Whether messages must carry a non-zero sender id.
    pub fn requires_ids(&self) -> bool {
        !matches!(self, Protocol::Anonymous)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Echo => "echo",
            Protocol::Election => "election",
            Protocol::Anonymous => "anonymous",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: String,
}

impl Address {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Address {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(sa: std::net::SocketAddr) -> Self {
        Address::new(sa.ip().to_string(), sa.port().to_string())
    }
}

/// This node's own identity. `id` is zero in the anonymous protocol.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Identity {
    pub id: u64,
    pub addr: Address,
    pub is_initiator: bool,
}

/// Immutable view of a node's place in the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub protocol: Protocol,
    pub me: Identity,
    pub neighbours: Vec<Address>,
    /// Number of nodes in the whole network; known a priori only in the
    /// anonymous protocol, where it is what the election converges on.
    pub network_size: Option<u64>,
}

impl Topology {
    pub fn new(protocol: Protocol, me: Identity, neighbours: Vec<Address>) -> Self {
        Topology {
            protocol,
            me,
            neighbours,
            network_size: None,
        }
    }

    pub fn with_network_size(mut self, n: u64) -> Self {
        self.network_size = Some(n);
        self
    }

    pub fn load(path: impl AsRef<Path>, protocol: Protocol) -> Result<Self> {
        let path = path.as_ref();
        info!("reading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Topology::parse(&text, protocol)
    }

    pub fn parse(text: &str, protocol: Protocol) -> Result<Self> {
        let mut me: Option<(Identity, Option<u64>)> = None;
        let mut neighbours: Vec<Address> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(':').map(str::trim).collect();
            let addr = parse_address(lineno, &fields)?;
            match (&me, fields.len()) {
                (None, 3) | (None, 4) => {
                    let number: u64 = fields[2].parse().map_err(|_| {
                        Error::config(lineno, format!("expected a number, got {:?}", fields[2]))
                    })?;
                    if number == 0 {
                        return Err(Error::config(lineno, "id or network size must be positive"));
                    }
                    let is_initiator = fields.len() == 4;
                    let (id, size) = match protocol {
                        Protocol::Anonymous => (0, Some(number)),
                        _ => (number, None),
                    };
                    info!(
                        "{} node {} ({})",
                        if is_initiator { "initiator" } else { "non-initiator" },
                        id,
                        addr
                    );
                    me = Some((
                        Identity {
                            id,
                            addr,
                            is_initiator,
                        },
                        size,
                    ));
                }
                (None, _) => {
                    return Err(Error::config(
                        lineno,
                        "first entry must be host:port:id or host:port:id:initiator",
                    ))
                }
                (Some(_), 2) => {
                    if neighbours.contains(&addr) {
                        return Err(Error::config(lineno, format!("duplicate neighbour {}", addr)));
                    }
                    neighbours.push(addr);
                }
                (Some(_), _) => {
                    return Err(Error::config(lineno, "neighbour entries must be host:port"))
                }
            }
        }

        let (me, size) = me.ok_or_else(|| Error::config(0, "no entry for this node"))?;
        if neighbours.contains(&me.addr) {
            return Err(Error::config(0, "node lists itself as a neighbour"));
        }
        info!(
            "neighbours of {}: [{}]",
            me.addr,
            neighbours.iter().map(|n| n.to_string()).join(", ")
        );
        let mut topo = Topology::new(protocol, me, neighbours);
        if let Some(n) = size {
            topo = topo.with_network_size(n);
        }
        Ok(topo)
    }
}

fn parse_address(lineno: usize, fields: &[&str]) -> Result<Address> {
    if fields.len() < 2 {
        return Err(Error::config(lineno, "expected at least host:port"));
    }
    let (host, port) = (fields[0], fields[1]);
    if host.is_empty() {
        return Err(Error::config(lineno, "empty host"));
    }
    if port.parse::<u16>().is_err() {
        return Err(Error::config(lineno, format!("invalid port {:?}", port)));
    }
    Ok(Address::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_initiator_with_neighbours() {
        let text = "127.0.0.1:7001:1:init\n127.0.0.1:7002\n\n# comment\n127.0.0.1:7003\n";
        let topo = Topology::parse(text, Protocol::Echo).unwrap();
        assert_eq!(topo.me.id, 1);
        assert!(topo.me.is_initiator);
        assert_eq!(topo.me.addr, Address::new("127.0.0.1", "7001"));
        assert_eq!(
            topo.neighbours,
            vec![
                Address::new("127.0.0.1", "7002"),
                Address::new("127.0.0.1", "7003")
            ]
        );
        assert_eq!(topo.network_size, None);
    }

    #[test]
    fn parse_anonymous_reads_network_size() {
        let topo = Topology::parse("h:9000:3\nh:9001\n", Protocol::Anonymous).unwrap();
        assert_eq!(topo.me.id, 0);
        assert!(!topo.me.is_initiator);
        assert_eq!(topo.network_size, Some(3));
    }

    #[test]
    fn parse_rejects_bad_lines() {
        assert!(Topology::parse("", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000\n", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000:x\n", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000:0\n", Protocol::Election).is_err());
        assert!(Topology::parse("h:notaport:1\n", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000:1\nh:9001:2\n", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000:1\nh:9001\nh:9001\n", Protocol::Echo).is_err());
        assert!(Topology::parse("h:9000:1\nh:9000\n", Protocol::Echo).is_err());
    }

    #[test]
    fn config_error_names_the_line() {
        let err = Topology::parse("h:9000:1\nh\n", Protocol::Echo).unwrap_err();
        match err {
            Error::Config { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
