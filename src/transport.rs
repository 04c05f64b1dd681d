// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Point-to-point delivery. Every message travels over its own short-lived
//! TCP connection: dial (retrying as the policy allows), write one frame,
//! close. The listening side accepts forever and hands each decoded message
//! to a handler running on its own task.

use crate::{codec, Address, Error, Message, Result};
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// How hard to try reaching a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(backoff: Duration) -> Self {
        RetryPolicy {
            backoff,
            max_attempts: None,
        }
    }

    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            backoff,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::forever(Duration::from_secs(1))
    }
}

async fn dial(addr: &Address, policy: &RetryPolicy) -> Result<TcpStream> {
    let target = addr.to_string();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match TcpStream::connect(target.as_str()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!("dial {} failed (attempt {}): {}", addr, attempts, e);
                if policy.exhausted(attempts) {
                    return Err(Error::Unreachable {
                        addr: addr.clone(),
                        attempts,
                    });
                }
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

/// Deliver one already-encoded frame to `addr`. A failed write counts as a
/// failed attempt and is retried on a fresh connection.
pub async fn deliver(addr: &Address, frame: &[u8], policy: &RetryPolicy) -> Result<()> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut stream = dial(addr, policy).await?;
        match codec::write_frame(&mut stream, frame).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("write to {} failed (attempt {}): {}", addr, attempts, e);
                if policy.exhausted(attempts) {
                    return Err(Error::Unreachable {
                        addr: addr.clone(),
                        attempts,
                    });
                }
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

/// Encode and deliver `msg` to `addr`.
pub async fn send(addr: &Address, msg: &Message, policy: &RetryPolicy) -> Result<()> {
    let frame = codec::encode(msg)?;
    trace!("sending {} to {}", msg.kind, addr);
    deliver(addr, &frame, policy).await?;
    debug!("sent {} to {}", msg.kind, addr);
    Ok(())
}

/// Block until every peer accepts a connection. Nodes are started
/// independently, so some may not be listening yet.
pub async fn wait_for_all_reachable(peers: &[Address], policy: &RetryPolicy) -> Result<()> {
    for peer in peers {
        debug!("probing {}", peer);
        let stream = dial(peer, policy).await?;
        drop(stream);
        info!("successfully dialled {}", peer);
    }
    Ok(())
}

/// Accept connections on `listener` forever. Each connection is read on its
/// own task; a frame that fails to decode is dropped along with its
/// connection and never reaches `on_message`.
pub async fn serve<F, Fut>(listener: TcpListener, on_message: F)
where
    F: Fn(Message) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if let Ok(local) = listener.local_addr() {
        info!("listening on {}", local);
    }
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                let handler = on_message.clone();
                tokio::spawn(async move {
                    match codec::read_message(&mut stream).await {
                        Ok(msg) => handler(msg).await,
                        Err(e) => debug!("dropping connection from {}: {}", peer, e),
                    }
                });
            }
            Err(e) => {
                warn!("accept error: {}", e);
            }
        }
    }
}
