// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::engine::{Handled, Progress, Report, WaveEngine};
use crate::transport::{self, RetryPolicy};
use crate::{codec, Error, Message, Outbound, Protocol, Result, Topology};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Runtime knobs. None of them affect correctness, only how quickly a node
/// notices progress and how patiently it dials.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Fallback re-evaluation interval when no message arrives.
    pub poll_interval: Duration,
    /// Policy for the startup barrier and every protocol send.
    pub dial: RetryPolicy,
    /// Policy for forwarding `Terminate`; the recipient may already be gone.
    pub terminate: RetryPolicy,
    /// How long to keep accepting connections after terminating.
    pub linger: Duration,
    /// Seed for leader draws; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            poll_interval: Duration::from_secs(1),
            dial: RetryPolicy::forever(Duration::from_secs(1)),
            terminate: RetryPolicy::bounded(Duration::from_millis(200), 15),
            linger: Duration::from_secs(3),
            seed: None,
        }
    }
}

// What the listener side hands to the driver after applying a message. The
// forwards of a received `Terminate` stay in the engine until the driver's
// next step collects them, so a step that races ahead of this event still
// sees them.
enum Event {
    Applied(Vec<Outbound>),
    Terminated,
}

/// A `Node` is one process's worth of the protocol: a listener feeding
/// inbound messages into a `WaveEngine`, and a driver loop stepping the same
/// engine. Both sides take the engine's lock only to decide what to send;
/// transmission happens after the lock is released, one task per message.
pub struct Node {
    topology: Topology,
    settings: Settings,
    listener: TcpListener,
}

impl Node {
    /// Bind this node's configured listen address.
    pub async fn bind(topology: Topology, settings: Settings) -> Result<Self> {
        let listener = TcpListener::bind(topology.me.addr.to_string()).await?;
        Node::with_listener(topology, settings, listener)
    }

    /// Use an already-bound listener, e.g. one bound to port 0.
    pub fn with_listener(
        topology: Topology,
        settings: Settings,
        listener: TcpListener,
    ) -> Result<Self> {
        if topology.protocol == Protocol::Anonymous && topology.network_size.is_none() {
            return Err(Error::config(0, "anonymous protocol needs the network size"));
        }
        Ok(Node {
            topology,
            settings,
            listener,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the protocol to completion: wait for all neighbours, drive the
    /// engine until the termination cascade has been executed, linger, and
    /// return the final state.
    pub async fn run(self) -> Result<Report> {
        let Node {
            topology,
            settings,
            listener,
        } = self;
        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let engine = Arc::new(Mutex::new(WaveEngine::new(&topology, &mut rng)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(transport::serve(listener, {
            let engine = engine.clone();
            move |msg: Message| {
                let engine = engine.clone();
                let events = events_tx.clone();
                async move { handle(&engine, msg, &events).await }
            }
        }));

        let mut driver = Driver {
            settings: &settings,
            engine: &engine,
            rng,
            sends: JoinSet::new(),
        };
        let outcome = driver.run(&topology, events_rx).await;
        server.abort();
        // Dropping the driver aborts any sends still retrying.
        drop(driver);
        outcome
    }
}

async fn handle(engine: &Mutex<WaveEngine>, msg: Message, events: &mpsc::UnboundedSender<Event>) {
    let mut outgoing = Vec::new();
    let handled = engine.lock().await.receive(&msg, &mut outgoing);
    let event = match handled {
        Handled::Terminated => Event::Terminated,
        Handled::Adopted | Handled::Replied => Event::Applied(outgoing),
        _ => return,
    };
    // The driver only goes away once the node is done.
    let _ = events.send(event);
}

struct Driver<'a> {
    settings: &'a Settings,
    engine: &'a Mutex<WaveEngine>,
    rng: StdRng,
    sends: JoinSet<Result<()>>,
}

impl<'a> Driver<'a> {
    async fn run(
        &mut self,
        topology: &Topology,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> Result<Report> {
        transport::wait_for_all_reachable(&topology.neighbours, &self.settings.dial).await?;
        info!("all {} neighbours reachable", topology.neighbours.len());

        loop {
            let mut outgoing = Vec::new();
            let progress = self.engine.lock().await.step(&mut self.rng, &mut outgoing);
            if progress == Progress::Finished {
                self.finish(outgoing).await?;
                break;
            }
            self.dispatch(outgoing)?;

            tokio::select! {
                Some(event) = events.recv() => match event {
                    Event::Applied(outgoing) => self.dispatch(outgoing)?,
                    // The next step hands out the forwards.
                    Event::Terminated => (),
                },
                Some(joined) = self.sends.join_next() => {
                    if let Ok(Err(e)) = joined {
                        return Err(e);
                    }
                },
                _ = tokio::time::sleep(self.settings.poll_interval) => (),
            }
        }

        debug!("lingering for {:?}", self.settings.linger);
        tokio::time::sleep(self.settings.linger).await;
        let report = self.engine.lock().await.report();
        Ok(report)
    }

    // Encoding happens here, before anything is spawned, so a message that
    // cannot be encoded fails the node rather than vanishing.
    fn dispatch(&mut self, outgoing: Vec<Outbound>) -> Result<()> {
        for out in outgoing {
            let frame = codec::encode(&out.message)?;
            let policy = self.settings.dial;
            let kind = out.message.kind;
            self.sends.spawn(async move {
                transport::deliver(&out.to, &frame, &policy).await?;
                debug!("sent {} to {}", kind, out.to);
                Ok(())
            });
        }
        Ok(())
    }

    // Forward the termination cascade and wait until every forward has
    // either landed or exhausted its retries.
    async fn finish(&mut self, outgoing: Vec<Outbound>) -> Result<()> {
        let mut forwards = JoinSet::new();
        for out in outgoing {
            let frame = codec::encode(&out.message)?;
            let policy = self.settings.terminate;
            forwards.spawn(async move {
                match transport::deliver(&out.to, &frame, &policy).await {
                    Ok(()) => debug!("forwarded terminate to {}", out.to),
                    Err(e) => warn!("terminate to {} not delivered: {}", out.to, e),
                }
            });
        }
        while forwards.join_next().await.is_some() {}
        Ok(())
    }
}
