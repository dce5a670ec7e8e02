//! The capability shared by every node participating in a [`Pipe`]: real
//! sockets and virtual (multiplexed) endpoints alike.
//!
//! [`Pipe`]: crate::portmux::tunnel::pipe::Pipe

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Data(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Receiver of endpoint events, tagged with the side they came from.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, side: Side, event: EndpointEvent);
}

/// The single subscriber an endpoint reports to.
///
/// Holds the handler weakly: a Pipe owns its endpoints, so a strong reference
/// back would leak both.
#[derive(Clone)]
pub struct Subscriber {
    side: Side,
    handler: Weak<dyn EventHandler>,
}

impl Subscriber {
    pub fn new(side: Side, handler: Weak<dyn EventHandler>) -> Self {
        Self { side, handler }
    }

    pub fn emit(&self, event: EndpointEvent) {
        if let Some(h) = self.handler.upgrade() {
            h.on_event(self.side, event);
        }
    }
}

/// Slot used by endpoint implementations to hold their subscriber.
#[derive(Default)]
pub struct SubscriberSlot {
    inner: Mutex<Option<Subscriber>>,
}

impl SubscriberSlot {
    pub fn set(&self, s: Subscriber) {
        if let Ok(mut g) = self.inner.lock() {
            *g = Some(s);
        }
    }

    pub fn emit(&self, event: EndpointEvent) {
        // Clone out so the handler runs without the slot locked.
        let sub = self.inner.lock().ok().and_then(|g| g.clone());
        if let Some(sub) = sub {
            sub.emit(event);
        }
    }
}

#[async_trait]
pub trait EndPoint: Send + Sync {
    /// Register the single event subscriber. Called before `start`.
    fn subscribe(&self, subscriber: Subscriber);

    /// Asynchronous setup (connect, bind). `false` means the endpoint is
    /// unusable and has been closed.
    async fn start(&self) -> bool;

    /// Queue bytes toward the peer. A no-op after close.
    fn write(&self, data: Bytes);

    /// Idempotent. Emits one `Close` event on the first call.
    fn close(&self);

    /// Push interface for the endpoint's owner; re-emitted as `Data`.
    fn on_receive_data(&self, data: Bytes);
}

pub type SharedEndPoint = Arc<dyn EndPoint>;
