use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::portmux::{
    control::PacketSender,
    protocol::{Command, DataPacket, Packet},
    tunnel::endpoint::{EndPoint, EndpointEvent, Subscriber, SubscriberSlot},
};

/// One multiplexed stream on a control connection.
///
/// Writes become `TunnelData` packets addressed to `(tunnel_id, pipe_id)`;
/// incoming `TunnelData` for that address is pushed in via `on_receive_data`.
pub struct VirtualEndpoint {
    tunnel_id: u32,
    pipe_id: u32,
    // Cleared on close; doubles as the closed flag.
    sender: Mutex<Option<PacketSender>>,
    sub: SubscriberSlot,
}

impl std::fmt::Debug for VirtualEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualEndpoint")
            .field("tunnel_id", &self.tunnel_id)
            .field("pipe_id", &self.pipe_id)
            .finish_non_exhaustive()
    }
}

impl VirtualEndpoint {
    pub fn new(tunnel_id: u32, pipe_id: u32, sender: PacketSender) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            pipe_id,
            sender: Mutex::new(Some(sender)),
            sub: SubscriberSlot::default(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    fn sender(&self) -> Option<PacketSender> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EndPoint for VirtualEndpoint {
    fn subscribe(&self, subscriber: Subscriber) {
        self.sub.set(subscriber);
    }

    async fn start(&self) -> bool {
        true
    }

    fn write(&self, data: Bytes) {
        let Some(sender) = self.sender() else {
            return;
        };
        metrics::counter!("portmux_virtual_bytes_sent_total").increment(data.len() as u64);
        let dp = DataPacket::new(self.tunnel_id, self.pipe_id, data);
        sender.send(Packet::data_packet(Command::TunnelData, &dp));
    }

    fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return;
        };
        // Best effort; the control connection may already be gone.
        let dp = DataPacket::header_only(self.tunnel_id, self.pipe_id);
        sender.send(Packet::data_packet(Command::TunnelClosed, &dp));
        self.sub.emit(EndpointEvent::Close);
    }

    fn on_receive_data(&self, data: Bytes) {
        if self.is_closed() {
            return;
        }
        metrics::counter!("portmux_virtual_bytes_received_total").increment(data.len() as u64);
        self.sub.emit(EndpointEvent::Data(data));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::portmux::{
        control,
        tunnel::endpoint::{EventHandler, Side},
    };

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EndpointEvent>>,
    }

    impl EventHandler for Recorder {
        fn on_event(&self, _side: Side, event: EndpointEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn subscribed(ep: &VirtualEndpoint) -> Arc<Recorder> {
        let rec = Arc::new(Recorder::default());
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&rec) as Weak<dyn EventHandler>;
        ep.subscribe(Subscriber::new(Side::Left, weak));
        rec
    }

    #[tokio::test]
    async fn write_emits_addressed_tunnel_data() {
        let (tx, mut rx) = control::channel();
        let ep = VirtualEndpoint::new(11, 22, tx);
        assert!(ep.start().await);

        ep.write(Bytes::from_static(b"abc"));
        let p = rx.try_recv().unwrap();
        assert_eq!(p.command(), Some(Command::TunnelData));
        let dp = DataPacket::decode(p.data).unwrap();
        assert_eq!((dp.tunnel_id, dp.pipe_id), (11, 22));
        assert_eq!(&dp.payload[..], b"abc");
    }

    #[tokio::test]
    async fn close_sends_tunnel_closed_once_and_emits_close() {
        let (tx, mut rx) = control::channel();
        let ep = VirtualEndpoint::new(1, 2, tx);
        let rec = subscribed(&ep);

        ep.close();
        ep.close();
        ep.write(Bytes::from_static(b"late"));

        let p = rx.try_recv().unwrap();
        assert_eq!(p.command(), Some(Command::TunnelClosed));
        let dp = DataPacket::decode(p.data).unwrap();
        assert_eq!((dp.tunnel_id, dp.pipe_id), (1, 2));
        assert!(dp.payload.is_empty());
        assert!(rx.try_recv().is_err());

        assert_eq!(*rec.events.lock().unwrap(), vec![EndpointEvent::Close]);
    }

    #[tokio::test]
    async fn received_data_is_reemitted_until_closed() {
        let (tx, _rx) = control::channel();
        let ep = VirtualEndpoint::new(1, 2, tx);
        let rec = subscribed(&ep);

        ep.on_receive_data(Bytes::from_static(b"in"));
        ep.close();
        ep.on_receive_data(Bytes::from_static(b"ignored"));

        assert_eq!(
            *rec.events.lock().unwrap(),
            vec![
                EndpointEvent::Data(Bytes::from_static(b"in")),
                EndpointEvent::Close
            ]
        );
    }
}
