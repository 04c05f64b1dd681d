// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    Address, Ballot, BallotLE, BallotLEExt, Identity, Kind, Message, Outbound, Protocol, Topology,
};
use im::Vector as ArcVector;
use rand::Rng;
use std::cmp::Ordering;
use tracing::{debug, info, trace, warn};

// The engine does no I/O and never blocks. It is stepped by whoever owns it:
// the node runtime (holding its lock for the duration of one call) or the
// in-memory network simulation in the tests. Each call may push any number of
// `Outbound` messages onto the caller's vector and possibly perform a `Stage`
// transition; actually delivering those messages is the caller's business.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    AwaitingParent,  // Non-initiator that has not joined any wave yet.
    Propagating,     // Wave root about to send its first pings.
    AwaitingReplies, // Pings sent, collecting echoes from non-parent neighbours.
    RepliedUp,       // Echo sent to parent; idle until a higher wave arrives.
    Terminated,      // Termination cascade executed; ignores everything.
}

/// What `receive` did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Failed validation; no state was touched.
    Rejected,
    /// Carried a lower ballot than ours.
    Stale,
    /// Made the sender our parent (and possibly changed leader).
    Adopted,
    /// Counted as the echo on the sender's edge.
    Replied,
    /// Echo on an edge that had already echoed this wave.
    Duplicate,
    /// Valid, but nothing to do.
    Ignored,
    /// Started the termination cascade.
    Terminated,
}

/// What `step` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Waiting,
    Sent,
    Finished,
}

/// One node's local view of one edge.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Neighbour {
    pub addr: Address,
    pub have_sent: bool,
    pub has_replied: bool,
    pub reported_size: u64,
}

impl Neighbour {
    fn new(addr: Address) -> Self {
        Neighbour {
            addr,
            have_sent: false,
            has_replied: false,
            reported_size: 0,
        }
    }

    fn reset(&mut self) {
        self.have_sent = false;
        self.has_replied = false;
        self.reported_size = 0;
    }
}

/// Summary of a node's state once it has finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub addr: Address,
    pub id: u64,
    pub leader: u64,
    pub round: u64,
    pub is_leader: bool,
    pub parent: Option<Address>,
    /// Subtree size this node last computed: the whole network at the root.
    pub detected_size: u64,
}

/// `WaveEngine` is the per-node state machine shared by all three protocols.
///
/// A node joins the wave carrying the greatest ballot it has seen, makes the
/// neighbour that brought that wave its parent, and forwards the wave to
/// everyone else. Once every non-parent neighbour has echoed, it echoes to
/// its parent. Waves carrying lower ballots are ignored and so never
/// complete; only the wave of the greatest ballot makes it back to its root,
/// which then starts the termination cascade (or, in the anonymous protocol
/// when the wave did not cover the whole network, a new round).
///
/// In the plain echo every ballot is the unset one, so no wave ever
/// extinguishes another and the state machine reduces to the classical echo.
#[derive(Clone, Debug)]
pub struct WaveEngine {
    // Fixed for the life of the node.
    pub(crate) me: Identity,
    pub(crate) protocol: Protocol,
    pub(crate) network_size: u64,

    // State variables reset once per wave.
    pub(crate) neighbours: ArcVector<Neighbour>,
    pub(crate) parent: Option<Message>,
    pub(crate) stage: Stage,
    pub(crate) has_initiated: bool,

    // State variables that persist across waves.
    pub(crate) ballot: BallotLE,
    pub(crate) candidate: bool,
    pub(crate) last_size: u64,

    // Terminate forwards decided under `receive`, handed out by `step`.
    pub(crate) farewells: Vec<Outbound>,

    // History variables, for purposes of testing.
    pub(crate) ballot_history: Vec<Ballot>,
}

impl WaveEngine {
    pub fn new<R: Rng + ?Sized>(topology: &Topology, rng: &mut R) -> Self {
        let me = topology.me.clone();
        let network_size = topology.network_size.unwrap_or(0);
        let ballot = if !me.is_initiator {
            Ballot::default()
        } else {
            match topology.protocol {
                Protocol::Echo => Ballot::default(),
                Protocol::Election => Ballot::new(0, me.id),
                Protocol::Anonymous => Ballot::new(0, draw_leader(rng, network_size)),
            }
        };
        let stage = if me.is_initiator {
            Stage::Propagating
        } else {
            Stage::AwaitingParent
        };
        if topology.protocol.elects() {
            info!("{} starts with leader {}", me.addr, ballot);
        }
        WaveEngine {
            candidate: me.is_initiator,
            me,
            protocol: topology.protocol,
            network_size,
            neighbours: topology.neighbours.iter().cloned().map(Neighbour::new).collect(),
            parent: None,
            stage,
            has_initiated: false,
            ballot: BallotLE::new_from(ballot),
            last_size: 0,
            farewells: Vec::new(),
            ballot_history: if ballot.is_unset() { Vec::new() } else { vec![ballot] },
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot.ballot()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn parent(&self) -> Option<&Message> {
        self.parent.as_ref()
    }

    pub fn parent_addr(&self) -> Option<Address> {
        self.parent.as_ref().map(Message::sender)
    }

    /// True while this node's own ballot is the one it is spreading, i.e.
    /// it has not adopted anybody else's wave.
    pub fn is_candidate(&self) -> bool {
        self.candidate
    }

    pub fn is_terminated(&self) -> bool {
        self.stage == Stage::Terminated
    }

    pub fn neighbours(&self) -> impl Iterator<Item = &Neighbour> {
        self.neighbours.iter()
    }

    /// Every ballot this node has held, in order.
    pub fn ballot_history(&self) -> &[Ballot] {
        &self.ballot_history
    }

    pub fn report(&self) -> Report {
        Report {
            addr: self.me.addr.clone(),
            id: self.me.id,
            leader: self.ballot.leader(),
            round: self.ballot.round(),
            is_leader: self.candidate,
            parent: self.parent_addr(),
            detected_size: self.last_size,
        }
    }

    fn is_parent(&self, idx: usize) -> bool {
        match (&self.parent, self.neighbours.get(idx)) {
            (Some(p), Some(n)) => p.is_from(&n.addr),
            _ => false,
        }
    }

    /// True once every neighbour other than the parent has echoed.
    pub fn all_replied(&self) -> bool {
        self.neighbours
            .iter()
            .enumerate()
            .all(|(i, n)| n.has_replied || self.is_parent(i))
    }

    /// This node plus everything its non-parent neighbours have reported.
    pub fn subtree_size(&self) -> u64 {
        1 + self
            .neighbours
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_parent(*i))
            .map(|(_, n)| n.reported_size)
            .sum::<u64>()
    }

    fn message(&self, kind: Kind) -> Message {
        Message::new(self.me.id, &self.me.addr, kind, self.ballot.ballot())
    }

    fn validate(&self, m: &Message) -> Result<usize, &'static str> {
        if m.host.is_empty() || m.port.is_empty() {
            return Err("missing sender address");
        }
        if self.protocol.requires_ids() && m.node_id == 0 {
            return Err("missing sender id");
        }
        if self.protocol.elects() && m.leader == 0 {
            return Err("non-positive leader");
        }
        self.neighbours
            .iter()
            .position(|n| m.is_from(&n.addr))
            .ok_or("sender is not a neighbour")
    }

    fn reset_neighbours(&mut self) {
        for n in self.neighbours.iter_mut() {
            n.reset();
        }
    }

    // Send `kind` to every neighbour except `skip`, marking each as sent.
    fn propagate(&mut self, kind: Kind, skip: Option<usize>, outgoing: &mut Vec<Outbound>) {
        let msg = self.message(kind);
        for (i, n) in self.neighbours.iter_mut().enumerate() {
            if Some(i) == skip {
                continue;
            }
            n.have_sent = true;
            outgoing.push(Outbound {
                to: n.addr.clone(),
                message: msg.clone(),
            });
        }
    }

    fn raise_ballot(&mut self, ballot: Ballot) {
        let before = self.ballot.ballot();
        self.ballot = &self.ballot + &BallotLE::new_from(ballot);
        if self.ballot.ballot() != before {
            self.ballot_history.push(self.ballot.ballot());
        }
    }

    // Join the wave `m` belongs to, with its sender (at `idx`) as parent.
    fn join_wave(&mut self, idx: usize, m: &Message, outgoing: &mut Vec<Outbound>) {
        self.raise_ballot(m.ballot());
        self.candidate = false;
        self.has_initiated = false;
        self.reset_neighbours();
        self.parent = Some(m.clone());
        if let Some(n) = self.neighbours.get_mut(idx) {
            n.has_replied = true;
        }
        let kind = match self.protocol {
            Protocol::Election => Kind::LeaderChanged,
            _ => Kind::Ping,
        };
        self.propagate(kind, Some(idx), outgoing);
        self.stage = Stage::AwaitingReplies;
    }

    fn record_reply(&mut self, idx: usize, m: &Message) -> Handled {
        if self.is_parent(idx) {
            trace!("{} ignoring repeat {} from parent {}", self.me.addr, m.kind, m.sender());
            return Handled::Ignored;
        }
        let root_not_started = self.candidate && !self.has_initiated;
        let n = match self.neighbours.get_mut(idx) {
            Some(n) => n,
            None => return Handled::Ignored,
        };
        let is_echo = match m.kind {
            Kind::Pong => true,
            // A wave message crossing one of ours on the same edge is that
            // edge's echo.
            Kind::Ping | Kind::LeaderChanged => n.have_sent || root_not_started,
            Kind::Terminate => false,
        };
        if !is_echo {
            return Handled::Ignored;
        }
        if n.has_replied {
            trace!("{} duplicate echo from {}", self.me.addr, n.addr);
            return Handled::Duplicate;
        }
        n.has_replied = true;
        n.reported_size = m.size;
        debug!(
            "{} got echo from {} (size {})",
            self.me.addr, n.addr, n.reported_size
        );
        Handled::Replied
    }

    /// Queue termination for every neighbour except `from`, and stop. The
    /// parent is included: with several echo roots it may be the root of
    /// another tree that would otherwise never hear of it. Nodes that have
    /// already terminated ignore the duplicate.
    fn terminate(&mut self, from: Option<usize>) {
        let msg = self.message(Kind::Terminate);
        for (i, n) in self.neighbours.iter().enumerate() {
            if Some(i) == from {
                continue;
            }
            self.farewells.push(Outbound {
                to: n.addr.clone(),
                message: msg.clone(),
            });
        }
        self.stage = Stage::Terminated;
        info!(
            "{} terminating, leader is {}, parent is {}",
            self.me.addr,
            self.ballot.ballot(),
            self.parent_addr()
                .map_or_else(|| "none".to_string(), |a| a.to_string())
        );
    }

    /// Apply one inbound message. A `Terminate` produces no output here; its
    /// forwards are handed out by the next `step`.
    pub fn receive(&mut self, m: &Message, outgoing: &mut Vec<Outbound>) -> Handled {
        if self.stage == Stage::Terminated {
            trace!("{} already terminated, dropping {}", self.me.addr, m.kind);
            return Handled::Ignored;
        }
        let idx = match self.validate(m) {
            Ok(idx) => idx,
            Err(reason) => {
                warn!(
                    "{} rejecting {} from {}:{}: {}",
                    self.me.addr, m.kind, m.host, m.port, reason
                );
                return Handled::Rejected;
            }
        };
        debug!(
            "{} received {} from {} (node {}, ballot {})",
            self.me.addr,
            m.kind,
            m.sender(),
            m.node_id,
            m.ballot()
        );

        if m.kind == Kind::Terminate {
            self.terminate(Some(idx));
            return Handled::Terminated;
        }

        if self.protocol.elects() {
            match m.ballot().cmp(&self.ballot.ballot()) {
                Ordering::Greater => {
                    info!(
                        "{} changing leader {} -> {}",
                        self.me.addr,
                        self.ballot.ballot(),
                        m.ballot()
                    );
                    self.join_wave(idx, m, outgoing);
                    return Handled::Adopted;
                }
                Ordering::Less => {
                    debug!(
                        "{} ignoring {} from {}, current leader is {}",
                        self.me.addr,
                        m.ballot(),
                        m.sender(),
                        self.ballot.ballot()
                    );
                    return Handled::Stale;
                }
                Ordering::Equal => (),
            }
        }

        if self.parent.is_none() && !self.candidate {
            info!("parent of {} is {}", self.me.addr, m.sender());
            self.join_wave(idx, m, outgoing);
            return Handled::Adopted;
        }

        self.record_reply(idx, m)
    }

    /// Advance the driver side of the state machine: initiate a wave, echo to
    /// the parent, start a new round or terminate, whichever is due.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R, outgoing: &mut Vec<Outbound>) -> Progress {
        match self.stage {
            Stage::Terminated => {
                outgoing.append(&mut self.farewells);
                return Progress::Finished;
            }
            Stage::RepliedUp => return Progress::Waiting,
            _ => (),
        }
        if self.candidate && !self.has_initiated {
            debug!("{} initiating wave {}", self.me.addr, self.ballot.ballot());
            self.propagate(Kind::Ping, None, outgoing);
            self.has_initiated = true;
            self.stage = Stage::AwaitingReplies;
            return Progress::Sent;
        }
        if !self.candidate && self.parent.is_none() {
            return Progress::Waiting;
        }
        if !self.all_replied() {
            return Progress::Waiting;
        }
        let size = self.subtree_size();
        self.last_size = size;
        if !self.candidate {
            self.reply_to_parent(size, outgoing);
            return Progress::Sent;
        }
        match self.protocol {
            Protocol::Anonymous if size != self.network_size => {
                self.start_round(rng, size, outgoing);
                Progress::Sent
            }
            _ => {
                info!(
                    "{} elected with ballot {}, detected network size {}",
                    self.me.addr,
                    self.ballot.ballot(),
                    size
                );
                self.terminate(None);
                outgoing.append(&mut self.farewells);
                Progress::Finished
            }
        }
    }

    fn reply_to_parent(&mut self, size: u64, outgoing: &mut Vec<Outbound>) {
        let parent = match self.parent_addr() {
            Some(p) => p,
            None => return,
        };
        debug!("{} echoing to {} with size {}", self.me.addr, parent, size);
        outgoing.push(Outbound {
            to: parent,
            message: self.message(Kind::Pong).with_size(size),
        });
        if self.protocol == Protocol::Anonymous {
            self.reset_neighbours();
        }
        self.stage = Stage::RepliedUp;
    }

    fn start_round<R: Rng + ?Sized>(&mut self, rng: &mut R, size: u64, outgoing: &mut Vec<Outbound>) {
        let next = Ballot::new(
            self.ballot.round() + 1,
            draw_leader(rng, self.network_size),
        );
        info!(
            "{} detected size {} of {}, starting round {} as {}",
            self.me.addr, size, self.network_size, next.round, next.leader
        );
        self.raise_ballot(next);
        self.reset_neighbours();
        self.propagate(Kind::Ping, None, outgoing);
        self.has_initiated = true;
        self.stage = Stage::AwaitingReplies;
    }
}

/// Draw a leader value uniformly from `[1, n]`.
pub fn draw_leader<R: Rng + ?Sized>(rng: &mut R, n: u64) -> u64 {
    rng.gen_range(1..=n.max(1))
}
