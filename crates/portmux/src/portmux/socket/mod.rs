//! Real sockets exposed as [`EndPoint`]s, plus the listeners that produce them.
//!
//! Transport errors stop here: callers only ever see a `false` from `start` or
//! a `Close` event.
//!
//! [`EndPoint`]: crate::portmux::tunnel::endpoint::EndPoint

pub mod tcp;
pub mod udp;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::portmux::tunnel::endpoint::{EndpointEvent, SharedEndPoint, Subscriber, SubscriberSlot};

pub const READ_BUF: usize = 64 * 1024;

/// Invoked synchronously for every accepted connection (TCP) or new peer
/// (UDP), before any of its data is delivered.
pub type NewConnectFn = Arc<dyn Fn(SharedEndPoint) + Send + Sync>;

#[async_trait]
pub trait Listener: Send + Sync {
    /// Bind. `false` if the address is unavailable.
    async fn start(&self) -> bool;

    /// Stop accepting. Idempotent. The socket is released asynchronously;
    /// await [`Listener::wait_closed`] before rebinding the same port.
    fn close(&self);

    /// Resolves once the tasks owning the bound socket have exited.
    async fn wait_closed(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

pub type SharedListener = Arc<dyn Listener>;

/// State shared by socket endpoints that own a reader task and a queued
/// writer: the subscriber, the write queue and the closed flag.
#[derive(Default)]
pub(crate) struct SocketCore {
    sub: SubscriberSlot,
    inner: Mutex<CoreInner>,
}

#[derive(Default)]
struct CoreInner {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl SocketCore {
    pub(crate) fn subscribe(&self, subscriber: Subscriber) {
        self.sub.set(subscriber);
    }

    /// Run `spawn` and keep its write queue and reader task, unless the
    /// endpoint was closed first. Returns whether the endpoint is now live.
    pub(crate) fn install<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> (mpsc::UnboundedSender<Bytes>, JoinHandle<()>),
    {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        let (tx, reader) = spawn();
        inner.tx = Some(tx);
        inner.reader = Some(reader);
        true
    }

    pub(crate) fn write(&self, data: Bytes) {
        if let Some(tx) = self.lock().tx.as_ref() {
            let _ = tx.send(data);
        }
    }

    pub(crate) fn emit_data(&self, data: Bytes) {
        self.sub.emit(EndpointEvent::Data(data));
    }

    /// Dropping the queue lets the writer flush and exit on its own; the
    /// reader is aborted. Emits `Close` on the first call only.
    pub(crate) fn close(&self) -> bool {
        let reader = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            inner.tx = None;
            inner.reader.take()
        };
        if let Some(r) = reader {
            r.abort();
        }
        self.sub.emit(EndpointEvent::Close);
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bound address and background tasks of a listener.
#[derive(Default)]
pub(crate) struct ListenerTasks {
    inner: Mutex<ListenerInner>,
}

#[derive(Default)]
struct ListenerInner {
    local: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    // Aborted but not yet joined.
    stopping: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ListenerTasks {
    /// Returns false (and aborts `tasks`) if the listener was closed while
    /// binding.
    pub(crate) fn install(&self, local: Option<SocketAddr>, tasks: Vec<JoinHandle<()>>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            tasks.iter().for_each(JoinHandle::abort);
            inner.stopping.extend(tasks);
            return false;
        }
        inner.local = local;
        inner.tasks = tasks;
        true
    }

    /// First call aborts the tasks and returns true.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return false;
        }
        inner.closed = true;
        let tasks = std::mem::take(&mut inner.tasks);
        tasks.iter().for_each(JoinHandle::abort);
        inner.stopping = tasks;
        true
    }

    pub(crate) async fn wait_closed(&self) {
        let stopping = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut inner.stopping)
        };
        for task in stopping {
            let _ = task.await;
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).local
    }
}
