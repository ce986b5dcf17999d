//! TCP session client for engine and controller links
//!
//! A [`Link`] owns one framed stream to a peer. It only moves messages: it
//! never looks at their content. Connection establishment is retried with a
//! fixed delay by [`connect`]; everything above it decides what a lost or
//! corrupt link means.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::{FrameError, LinkError};
use crate::frame::FrameCodec;
use crate::types::Message;

/// Default number of connection attempts
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default delay between connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection retry policy: a bounded number of attempts with a fixed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Single attempt, no delay
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Outcome of a bounded receive
#[derive(Debug)]
pub enum Received {
    Message(Message),
    Timeout,
    Closed,
}

/// A framed connection to one peer
pub struct Link<S = TcpStream> {
    peer: String,
    framed: Framed<S, FrameCodec>,
}

impl<S> Link<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(peer: impl Into<String>, stream: S) -> Self {
        Self {
            peer: peer.into(),
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Peer address this link talks to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one message
    pub async fn send(&mut self, msg: &Message) -> Result<(), LinkError> {
        debug!("-> {}: {}", self.peer, msg);
        self.framed.send(msg).await?;
        Ok(())
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// A corrupt frame is returned as an error; the link must be dropped
    /// afterwards.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Received, LinkError> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Err(_) => Ok(Received::Timeout),
            Ok(None) => Ok(Received::Closed),
            Ok(Some(Ok(msg))) => {
                debug!("<- {}: {}", self.peer, msg);
                Ok(Received::Message(msg))
            }
            Ok(Some(Err(FrameError::Io(e)))) => Err(LinkError::Io(e)),
            Ok(Some(Err(e))) => {
                warn!("Corrupt frame from {}: {}", self.peer, e);
                Err(LinkError::Frame(e))
            }
        }
    }

    /// Wait for the next message with no deadline
    pub async fn next_message(&mut self) -> Result<Option<Message>, LinkError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(msg)) => {
                debug!("<- {}: {}", self.peer, msg);
                Ok(Some(msg))
            }
            Some(Err(FrameError::Io(e))) => Err(LinkError::Io(e)),
            Some(Err(e)) => {
                warn!("Corrupt frame from {}: {}", self.peer, e);
                Err(LinkError::Frame(e))
            }
        }
    }

    /// Throw away every message that has already arrived, without waiting.
    ///
    /// Returns how many were dropped. A peer that closed the link is
    /// reported as [`LinkError::Closed`].
    pub async fn discard_pending(&mut self) -> Result<usize, LinkError> {
        let mut discarded = 0;
        loop {
            match self.receive(Duration::ZERO).await? {
                Received::Message(msg) => {
                    debug!("Discarding unsolicited {} from {}", msg, self.peer);
                    discarded += 1;
                }
                Received::Timeout => return Ok(discarded),
                Received::Closed => return Err(LinkError::Closed(self.peer.clone())),
            }
        }
    }

    /// Consume the link and return the underlying stream
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

/// Connect to `host:port`, retrying per `policy`
pub async fn connect(host: &str, port: u16, policy: RetryPolicy) -> Result<Link, LinkError> {
    let addr = format!("{}:{}", host, port);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                disable_nagle(&stream, &addr);
                info!("Connected to {}", addr);
                return Ok(Link::new(addr, stream));
            }
            Err(e) if attempt >= policy.attempts => {
                warn!(
                    "Failed to connect to {} after {} attempts",
                    addr, policy.attempts
                );
                return Err(LinkError::ConnectExhausted {
                    addr,
                    attempts: policy.attempts,
                    source: e,
                });
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{} to {} failed: {}, retrying in {:?}",
                    attempt, policy.attempts, addr, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Single connection attempt bounded by `timeout`
pub async fn connect_once(host: &str, port: u16, timeout: Duration) -> Result<Link, LinkError> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Err(_) => Err(LinkError::ConnectTimeout { addr, timeout }),
        Ok(Err(e)) => Err(LinkError::ConnectExhausted {
            addr,
            attempts: 1,
            source: e,
        }),
        Ok(Ok(stream)) => {
            disable_nagle(&stream, &addr);
            info!("Connected to {}", addr);
            Ok(Link::new(addr, stream))
        }
    }
}

/// Small frames; do not wait to coalesce
fn disable_nagle(stream: &TcpStream, addr: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
    }
}
