// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a small family of distributed graph algorithms built
 * on the classical _echo_ (or _wave_) algorithm. Each node is a separate
 * process that knows only its own address and those of its direct
 * neighbours; there is no coordinator. Three protocols share one state
 * machine:
 *
 *   - `Echo`: an initiator floods a wave of pings outward, every other node
 *     adopts the neighbour it first heard from as its parent, and echoes
 *     flow back up the resulting spanning tree. When the initiator has heard
 *     back from every neighbour it knows the wave has covered the network and
 *     starts a termination cascade.
 *
 *   - `Election`: several initiators each start a wave tagged with their
 *     static id. A node that sees a higher id abandons whatever wave it was
 *     in and joins the new one ("echo with extinction"), so only the wave of
 *     the highest id ever completes, and its initiator becomes leader.
 *
 *   - `Anonymous`: nodes have no ids at all. Each initiator draws a random
 *     value in `[1, N]` per round and waves are compared by `(round, value)`.
 *     Subtree sizes are summed up the echo; a root whose wave reports `N` nodes
 *     has won, and a root whose wave reports fewer (because of a tie) draws
 *     again in the next round.
 *
 * The state machine lives in [`WaveEngine`] and does no I/O: it consumes a
 * message or a driver step and produces outbound messages. [`Node`] wires it
 * up to TCP, with one short-lived connection per message.
 *
 * Delivery is assumed to be (eventually) reliable, and neighbours are assumed
 * to (eventually) be reachable; by default connections are retried forever.
 * No timing assumptions are made otherwise, and the protocols tolerate
 * arbitrary interleaving of messages from different neighbours.
 *
 * ## Reference
 *
 * Gerard Tel. Introduction to Distributed Algorithms, 2nd ed., chapters 6
 * (wave algorithms) and 7 (election). Cambridge University Press, 2000.
 */

mod ballot;
mod cfg;
mod error;
mod message;

pub mod codec;
pub mod engine;
pub mod node;
pub mod transport;

pub use ballot::{Ballot, BallotLD, BallotLE, BallotLEExt};
pub use cfg::{Address, Identity, Protocol, Topology};
pub use engine::{Handled, Neighbour, Progress, Report, Stage, WaveEngine};
pub use error::{Error, Result};
pub use message::{Kind, Message, Outbound};
pub use node::{Node, Settings};
pub use transport::RetryPolicy;
