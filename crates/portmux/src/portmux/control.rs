//! Control-connection plumbing: a cloneable packet sender backed by a single
//! writer task, and a framed packet reader.

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

use crate::portmux::protocol::{Packet, PacketCodec, ProtocolError};

const READ_BUF: usize = 64 * 1024;

/// Shared handle for queuing packets onto one control connection.
///
/// Every VirtualEndpoint and Tunnel on a connection holds a clone. Packets are
/// written in the order `send` is called.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketSender {
    /// Returns false once the connection's writer is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.tx.send(packet).is_ok()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn channel() -> (PacketSender, mpsc::UnboundedReceiver<Packet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketSender { tx }, rx)
}

/// Spawn the writer task for a control connection.
///
/// The task ends when every sender clone is dropped (after flushing what was
/// queued) or on the first write error.
pub fn spawn_writer<W>(wr: W) -> (PacketSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, rx) = channel();
    let task = tokio::spawn(write_loop(wr, rx));
    (sender, task)
}

async fn write_loop<W>(mut wr: W, mut rx: mpsc::UnboundedReceiver<Packet>)
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(READ_BUF);
    while let Some(first) = rx.recv().await {
        out.clear();
        let mut next = Some(first);
        // Coalesce whatever is already queued into one write.
        while let Some(p) = next {
            if let Err(err) = p.encode_into(&mut out) {
                tracing::warn!(cmd = p.cmd, err = %err, "control: dropping unencodable packet");
            }
            if out.len() >= READ_BUF {
                break;
            }
            next = rx.try_recv().ok();
        }
        if let Err(err) = wr.write_all(&out).await {
            tracing::debug!(err = %err, "control: write failed");
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Reads whole packets off a control connection.
pub struct PacketReader<R> {
    rd: R,
    codec: PacketCodec,
    buf: Box<[u8]>,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(rd: R) -> Self {
        Self {
            rd,
            codec: PacketCodec::new(),
            buf: vec![0u8; READ_BUF].into_boxed_slice(),
        }
    }

    /// `Ok(None)` on clean EOF. A framing error is unrecoverable for the
    /// stream and should close the connection.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        loop {
            if let Some(p) = self.codec.try_extract_packet()? {
                return Ok(Some(p));
            }
            let n = self.rd.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.codec.put(&self.buf[..n]);
        }
    }
}
