//! Inbound data bus
//!
//! Ordered, multi-subscriber broadcast of inbound payloads. Each subscriber
//! owns an unbounded queue, so a slow consumer never loses messages and never
//! holds up the others. Posting happens under one lock: two callback threads
//! posting at once are delivered to every subscriber in a single order.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Direction of a payload relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the peripheral
    Inbound,
    /// Sent to the peripheral
    Outbound,
}

/// A raw payload travelling over the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub direction: Direction,
    /// Scheduling delay (outbound only)
    pub delay: Option<Duration>,
}

impl Message {
    pub fn inbound(payload: Vec<u8>) -> Self {
        Self {
            payload,
            direction: Direction::Inbound,
            delay: None,
        }
    }

    pub fn outbound(payload: Vec<u8>, delay: Duration) -> Self {
        Self {
            payload,
            direction: Direction::Outbound,
            delay: Some(delay),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct BusState {
    subscribers: Vec<mpsc::UnboundedSender<Message>>,
    closed: bool,
}

/// Multi-subscriber broadcast channel for inbound messages
pub struct DataBus {
    state: Mutex<BusState>,
}

impl DataBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Deliver `message` to every current subscriber.
    ///
    /// Returns `false` once the bus is closed. Subscribers whose stream was
    /// dropped are pruned here.
    pub fn post(&self, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
        true
    }

    /// Receive every message posted from now on.
    ///
    /// On a closed bus the returned stream is already complete. Subscribers
    /// whose stream was dropped are pruned here too.
    pub fn subscribe(&self) -> InboundStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if state.closed {
            debug!("Subscribe on closed data bus");
        } else {
            state.subscribers.retain(|subscriber| !subscriber.is_closed());
            state.subscribers.push(tx);
        }
        InboundStream { rx }
    }

    /// Complete every subscriber stream and refuse further posts.
    ///
    /// Messages already queued for a subscriber are still delivered.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.subscribers.clear();
            debug!("Data bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for DataBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscription to the data bus
#[derive(Debug)]
pub struct InboundStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl InboundStream {
    /// Next message, or `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next already-delivered message, without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Stream for InboundStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
