// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Address, Ballot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four kinds of message a wave is built from. `Ping` carries a wave
/// outward, `Pong` carries the echo (and a subtree size) back towards the
/// root, `LeaderChanged` re-propagates a freshly adopted leader in the
/// static-id election, and `Terminate` drives the final cascade.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Ping,
    Pong,
    LeaderChanged,
    Terminate,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Ping => "ping",
            Kind::Pong => "pong",
            Kind::LeaderChanged => "leader-changed",
            Kind::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// Messages are the only thing nodes exchange. One is built per send and
/// travels over exactly one connection.
///
/// `node_id` is zero for anonymous senders. `leader` and `round` together
/// make up the sender's ballot (both zero in the plain echo), and `size` is
/// only meaningful on a `Pong` in the anonymous variant.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub node_id: u64,
    pub host: String,
    pub port: String,
    pub kind: Kind,
    pub leader: u64,
    pub round: u64,
    pub size: u64,
}

impl Message {
    pub fn new(node_id: u64, from: &Address, kind: Kind, ballot: Ballot) -> Self {
        Message {
            node_id,
            host: from.host.clone(),
            port: from.port.clone(),
            kind,
            leader: ballot.leader,
            round: ballot.round,
            size: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn ballot(&self) -> Ballot {
        Ballot::new(self.round, self.leader)
    }

    /// Whether this message was sent from `addr`.
    pub fn is_from(&self, addr: &Address) -> bool {
        self.host == addr.host && self.port == addr.port
    }

    pub fn sender(&self) -> Address {
        Address::new(self.host.clone(), self.port.clone())
    }
}

/// A message paired with the neighbour it should be delivered to. The engine
/// produces these under its lock; the node runtime transmits them after
/// releasing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: Address,
    pub message: Message,
}
