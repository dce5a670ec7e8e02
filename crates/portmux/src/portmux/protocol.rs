//! Control-channel wire format.
//!
//! ```text
//! Packet      := length:u32le | cmd:u32le | payload:bytes[length-8]
//! DataPacket  := tunnelId:u32le | pipeId:u32le | payload:bytes
//! ```
//!
//! `length` counts the 8-byte header. A DataPacket rides inside the payload of
//! TunnelConnected/TunnelData/TunnelClosed and has no inner length field.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const HEADER_LEN: usize = 8;
pub const DATA_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad packet length: {0}")]
    BadLength(u32),
    #[error("data packet too short: {0} bytes")]
    ShortDataPacket(usize),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Hello = 1,
    Heartbeat = 2,
    NewTunnel = 3,
    TunnelConnected = 4,
    TunnelData = 5,
    TunnelClosed = 6,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Command::Hello),
            2 => Some(Command::Heartbeat),
            3 => Some(Command::NewTunnel),
            4 => Some(Command::TunnelConnected),
            5 => Some(Command::TunnelData),
            6 => Some(Command::TunnelClosed),
            _ => None,
        }
    }
}

/// One framed control-channel message.
///
/// `cmd` stays a raw `u32` so packets with unknown commands can still be
/// decoded, logged and skipped without losing stream alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub cmd: u32,
    pub data: Bytes,
}

impl Packet {
    pub fn new(cmd: Command, data: Bytes) -> Self {
        Self {
            cmd: cmd as u32,
            data,
        }
    }

    pub fn empty(cmd: Command) -> Self {
        Self::new(cmd, Bytes::new())
    }

    pub fn json<T: Serialize>(cmd: Command, value: &T) -> Result<Self, ProtocolError> {
        let b = serde_json::to_vec(value)?;
        Ok(Self::new(cmd, Bytes::from(b)))
    }

    pub fn data_packet(cmd: Command, dp: &DataPacket) -> Self {
        Self::new(cmd, dp.encode())
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.cmd)
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Total encoded length, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    #[cfg(test)]
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let total = self.wire_len();
        let len: u32 = total
            .try_into()
            .map_err(|_| ProtocolError::PayloadTooLarge(self.data.len()))?;
        out.reserve(total);
        out.put_u32_le(len);
        out.put_u32_le(self.cmd);
        out.put_slice(&self.data);
        Ok(())
    }
}

/// Receive accumulator for a byte stream carrying [`Packet`]s.
///
/// Reads may coalesce or split packets arbitrarily, so callers `put` every
/// chunk they read and then call [`PacketCodec::try_extract_packet`] in a loop
/// until it yields `None`. There is no maximum packet size.
#[derive(Debug, Default)]
pub struct PacketCodec {
    buf: BytesMut,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn try_extract_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if (len as usize) < HEADER_LEN {
            return Err(ProtocolError::BadLength(len));
        }
        if self.buf.len() < len as usize {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(len as usize);
        frame.advance(4);
        let cmd = frame.get_u32_le();
        Ok(Some(Packet {
            cmd,
            data: frame.freeze(),
        }))
    }
}

/// Multiplexed payload addressed to one (tunnel, pipe) stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub tunnel_id: u32,
    pub pipe_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn new(tunnel_id: u32, pipe_id: u32, payload: Bytes) -> Self {
        Self {
            tunnel_id,
            pipe_id,
            payload,
        }
    }

    pub fn header_only(tunnel_id: u32, pipe_id: u32) -> Self {
        Self::new(tunnel_id, pipe_id, Bytes::new())
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        out.put_u32_le(self.tunnel_id);
        out.put_u32_le(self.pipe_id);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Zero-copy when `data` is already a `Bytes` slice of the receive buffer.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < DATA_HEADER_LEN {
            return Err(ProtocolError::ShortDataPacket(data.len()));
        }
        let tunnel_id = data.get_u32_le();
        let pipe_id = data.get_u32_le();
        Ok(Self {
            tunnel_id,
            pipe_id,
            payload: data,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    #[serde(default)]
    pub auth_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    #[serde(default)]
    pub is_authed: bool,
}
