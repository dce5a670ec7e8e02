use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::portmux::tunnel::endpoint::{
    EndpointEvent, EventHandler, SharedEndPoint, Side, Subscriber,
};

type CloseCallback = Box<dyn FnOnce() + Send>;

struct PipeState {
    // None once the pipe is closed.
    endpoints: Option<(SharedEndPoint, SharedEndPoint)>,
    ready: bool,
    queue: VecDeque<(Side, EndpointEvent)>,
}

/// Bidirectional relay between exactly two endpoints.
///
/// Events that arrive before both endpoints have started are queued in arrival
/// order and replayed once the pipe is ready. Closing either side closes both
/// exactly once and fires the `on_close` callback once.
pub struct Pipe {
    id: u32,
    state: Mutex<PipeState>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Pipe {
    /// Builds the pipe and subscribes to both endpoints immediately.
    pub fn new(id: u32, left: SharedEndPoint, right: SharedEndPoint) -> Arc<Self> {
        let pipe = Arc::new(Self {
            id,
            state: Mutex::new(PipeState {
                endpoints: Some((left.clone(), right.clone())),
                ready: false,
                queue: VecDeque::new(),
            }),
            on_close: Mutex::new(None),
        });

        let handler: Weak<dyn EventHandler> = Arc::downgrade(&pipe) as Weak<dyn EventHandler>;
        left.subscribe(Subscriber::new(Side::Left, handler.clone()));
        right.subscribe(Subscriber::new(Side::Right, handler));
        pipe
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_closed(&self) -> bool {
        self.lock().endpoints.is_none()
    }

    /// Register the upward close notification. Runs immediately if the pipe
    /// is already closed.
    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Checked under the callback lock: close() marks the pipe closed
        // before it takes the callback.
        let mut slot = self.on_close.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(slot);
            f();
            return;
        }
        *slot = Some(Box::new(f));
    }

    /// Start left, then right; on success replay queued events and switch to
    /// direct relaying. Any failure closes the pipe without it ever becoming
    /// ready.
    pub async fn link(&self) -> bool {
        let Some((left, right)) = self.lock().endpoints.clone() else {
            return false;
        };

        let ok = left.start().await && right.start().await;
        if !ok {
            tracing::debug!(pipe_id = self.id, "pipe: endpoint start failed");
            self.close();
            return false;
        }

        self.drain_and_ready()
    }

    pub fn close(&self) {
        let (endpoints, was_ready) = {
            let mut st = self.lock();
            st.queue.clear();
            let was_ready = std::mem::replace(&mut st.ready, false);
            (st.endpoints.take(), was_ready)
        };
        let Some((left, right)) = endpoints else {
            return;
        };

        left.close();
        right.close();

        if was_ready {
            metrics::gauge!("portmux_pipes_active").decrement(1.0);
        }
        metrics::counter!("portmux_pipes_closed_total").increment(1);
        tracing::trace!(pipe_id = self.id, "pipe: closed");

        let cb = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn drain_and_ready(&self) -> bool {
        loop {
            let (event, endpoints) = {
                let mut st = self.lock();
                let Some(endpoints) = st.endpoints.clone() else {
                    return false;
                };
                match st.queue.pop_front() {
                    Some(ev) => (ev, endpoints),
                    None => {
                        // Flip under the same lock that guards the queue so no
                        // event can slip past the replay.
                        st.ready = true;
                        break;
                    }
                }
            };
            self.dispatch(event, endpoints);
        }

        metrics::counter!("portmux_pipes_opened_total").increment(1);
        metrics::gauge!("portmux_pipes_active").increment(1.0);
        true
    }

    fn dispatch(
        &self,
        (side, event): (Side, EndpointEvent),
        (left, right): (SharedEndPoint, SharedEndPoint),
    ) {
        match event {
            EndpointEvent::Data(b) => match side {
                Side::Left => right.write(b),
                Side::Right => left.write(b),
            },
            EndpointEvent::Close => self.close(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventHandler for Pipe {
    fn on_event(&self, side: Side, event: EndpointEvent) {
        let endpoints = {
            let mut st = self.lock();
            let Some(endpoints) = st.endpoints.clone() else {
                return;
            };
            if !st.ready {
                st.queue.push_back((side, event));
                return;
            }
            endpoints
        };
        self.dispatch((side, event), endpoints);
    }
}
