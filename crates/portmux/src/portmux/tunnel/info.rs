use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Tcp,
    Udp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Tcp => "tcp",
            TunnelKind::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(TunnelKind::Tcp),
            "udp" => Some(TunnelKind::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One forwarding rule: public `source_port` on the server to
/// `target_addr:target_port` reachable from the client.
///
/// Serialized with the camelCase keys used on the wire (NewTunnel payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    #[serde(default)]
    pub tunnel_id: u32,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    pub target_addr: String,
    pub target_port: u16,
    pub source_port: u16,
    /// UDP session idle timeout in seconds; 0 never expires.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub is_local_tunnel: bool,
}

impl TunnelInfo {
    pub fn new(kind: TunnelKind, target_addr: &str, target_port: u16, source_port: u16) -> Self {
        let mut info = Self {
            tunnel_id: 0,
            kind,
            target_addr: target_addr.to_string(),
            target_port,
            source_port,
            timeout: 0,
            is_local_tunnel: false,
        };
        info.tunnel_id = info.compute_id();
        info
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn local(mut self) -> Self {
        self.is_local_tunnel = true;
        self
    }

    /// Recompute `tunnel_id` from the rule fields. Peers never trust a
    /// transmitted id. `target_addr` is hashed exactly as sent so both ends
    /// agree on ids for padded addresses too.
    pub fn normalize(mut self) -> Self {
        self.tunnel_id = self.compute_id();
        self
    }

    pub fn compute_id(&self) -> u32 {
        tunnel_id(
            self.kind,
            &self.target_addr,
            self.target_port,
            self.source_port,
        )
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_addr, self.target_port)
    }
}

/// Wire-compatible tunnel id: both ends must agree bit-for-bit.
pub fn tunnel_id(kind: TunnelKind, target_addr: &str, target_port: u16, source_port: u16) -> u32 {
    let key = format!("{}{}{}{}", kind.as_str(), target_addr, target_port, source_port);
    hash_code(&key)
}

/// `h = h * 31 + unit` over UTF-16 code units, wrapping at 32 bits.
pub fn hash_code(s: &str) -> u32 {
    s.encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
}
