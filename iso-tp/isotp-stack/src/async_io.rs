//! CAN transport seam for the async stack, and an in-memory bus.
//!
//! [`CanTransport`] models the two operations the stack needs from a CAN controller: transmitting
//! one frame and waiting for the next one. Hardware drivers (SocketCAN, PCAN, serial adapters, ...)
//! implement it outside this crate; [`VirtualBus`] implements it in memory so several stacks can
//! talk to each other in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::frame::CanFrame;

/// Errors reported by a [`CanTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing to read right now.
    #[error("no frame available")]
    NoMessage,
    /// The link is gone.
    #[error("transport closed")]
    Closed,
    /// The controller refused the frame.
    #[error("frame rejected: {0}")]
    Rejected(String),
}

/// A CAN controller as seen by the async stack.
#[async_trait]
pub trait CanTransport: Send {
    /// Put one frame on the bus; resolves once the controller accepted it.
    async fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait for the next frame from the bus.
    ///
    /// Must be cancel-safe: a dropped future loses no frame.
    async fn receive(&mut self) -> Result<CanFrame, TransportError>;
}

/// In-memory broadcast CAN bus.
///
/// Every frame transmitted by one endpoint is received by all other endpoints and taps.
#[derive(Debug, Clone)]
pub struct VirtualBus {
    tx: broadcast::Sender<(u64, CanFrame)>,
    next_endpoint: Arc<AtomicU64>,
}

impl VirtualBus {
    /// Bus buffering up to `capacity` frames per listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_endpoint: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a node.
    pub fn endpoint(&self) -> VirtualEndpoint {
        VirtualEndpoint {
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Attach a passive listener that sees every frame.
    pub fn tap(&self) -> VirtualTap {
        VirtualTap {
            rx: self.tx.subscribe(),
        }
    }
}

/// A node attached to a [`VirtualBus`]. It does not receive its own frames.
#[derive(Debug)]
pub struct VirtualEndpoint {
    id: u64,
    tx: broadcast::Sender<(u64, CanFrame)>,
    rx: broadcast::Receiver<(u64, CanFrame)>,
}

#[async_trait]
impl CanTransport for VirtualEndpoint {
    async fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        self.tx
            .send((self.id, *frame))
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<CanFrame, TransportError> {
        loop {
            match self.rx.recv().await {
                Ok((sender, frame)) if sender != self.id => return Ok(frame),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(endpoint = self.id, skipped, "virtual bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }
}

/// Passive listener on a [`VirtualBus`].
#[derive(Debug)]
pub struct VirtualTap {
    rx: broadcast::Receiver<(u64, CanFrame)>,
}

impl VirtualTap {
    /// Next frame on the bus, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok((_, frame)) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "virtual bus tap lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered frame, without waiting.
    pub fn try_next(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.try_recv() {
                Ok((_, frame)) => return Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "virtual bus tap lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
