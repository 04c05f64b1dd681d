// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Ballots are what competing waves are compared by. A `Ballot` pairs a round
//! number with a leader value, and ballots are ordered lexicographically on
//! `(round, leader)`.
//!
//! The set of ballots forms a max-lattice: joining two ballots picks the
//! greater one. Every leader adoption a node performs is a join of its
//! current ballot with an incoming one, so the sequence of ballots a node
//! holds only ever moves up the lattice.

use pergola::{LatticeDef, LatticeElt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ballot {
    // Field order matters: derived Ord compares round first.
    pub round: u64,
    pub leader: u64,
}

impl Ballot {
    pub fn new(round: u64, leader: u64) -> Self {
        Ballot { round, leader }
    }

    /// A ballot whose leader is zero carries no candidate. Nodes that are
    /// not initiators start out holding one.
    pub fn is_unset(&self) -> bool {
        self.leader == 0
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@r{}", self.leader, self.round)
    }
}

/// Lattice definition for ballots: unit is the unset ballot, join is max.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BallotLD;

impl LatticeDef for BallotLD {
    type T = Ballot;

    fn unit() -> Ballot {
        Ballot::default()
    }

    fn join(lhs: &Ballot, rhs: &Ballot) -> Ballot {
        std::cmp::max(*lhs, *rhs)
    }

    fn partial_order(lhs: &Ballot, rhs: &Ballot) -> Option<Ordering> {
        Some(lhs.cmp(rhs))
    }
}

pub type BallotLE = LatticeElt<BallotLD>;

// Helper methods on ballot lattice elements.
pub trait BallotLEExt {
    fn ballot(&self) -> Ballot;
    fn round(&self) -> u64;
    fn leader(&self) -> u64;
}

impl BallotLEExt for BallotLE {
    fn ballot(&self) -> Ballot {
        self.value
    }
    fn round(&self) -> u64 {
        self.value.round
    }
    fn leader(&self) -> u64 {
        self.value.leader
    }
}
