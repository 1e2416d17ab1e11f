//! Datagram request layouts for the overlay transport.  The byte layout is
//! pinned by the protocol, so frames are packed by hand rather than run
//! through a codec.

use crate::ids::{BundleId, Sid};

/// Solicited payload block size.  Several blocks fit in a typical mesh
/// datagram alongside other traffic.
pub const BLOCK_SIZE: u16 = 200;

/// Blocks tracked per receive window.
pub const WINDOW_BLOCKS: usize = 32;

const PAYLOAD_REQUEST_LEN: usize = 32 + 8 + 8 + 4 + 2;

/// Overlay service ports used by the fetch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPort {
    /// Peers listen here for block/manifest requests.
    BundleRequest,
    /// Requesters receive blocks here.
    BundleResponse,
}

/// Delivery class for outgoing overlay traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    Ordinary,
}

/// One datagram handed to the overlay for routing.  The fetch engine only
/// ever emits single-hop (`ttl = 1`) ordinary-class frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFrame {
    pub dst_sid: Sid,
    pub src_port: OverlayPort,
    pub dst_port: OverlayPort,
    pub ttl: u8,
    pub queue: QueueClass,
    pub payload: Vec<u8>,
}

impl OverlayFrame {
    pub fn request(dst_sid: Sid, payload: Vec<u8>) -> Self {
        Self {
            dst_sid,
            src_port: OverlayPort::BundleResponse,
            dst_port: OverlayPort::BundleRequest,
            ttl: 1,
            queue: QueueClass::Ordinary,
            payload,
        }
    }
}

/// Windowed solicitation for payload blocks:
/// `bid[32] ‖ version u64 BE ‖ window_start u64 BE ‖ bitmap u32 BE ‖
/// block_size u16 BE`.  A set bitmap bit `i` tells the peer the block at
/// `window_start + i * block_size` has already arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub bid: BundleId,
    pub version: u64,
    pub window_start: u64,
    pub bitmap: u32,
    pub block_size: u16,
}

impl BlockRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PAYLOAD_REQUEST_LEN);
        out.extend_from_slice(&self.bid.0);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.window_start.to_be_bytes());
        out.extend_from_slice(&self.bitmap.to_be_bytes());
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != PAYLOAD_REQUEST_LEN {
            anyhow::bail!("block request must be {PAYLOAD_REQUEST_LEN} bytes");
        }
        let mut bid = [0u8; 32];
        bid.copy_from_slice(&bytes[..32]);
        Ok(Self {
            bid: BundleId(bid),
            version: u64::from_be_bytes(bytes[32..40].try_into().expect("8 bytes")),
            window_start: u64::from_be_bytes(bytes[40..48].try_into().expect("8 bytes")),
            bitmap: u32::from_be_bytes(bytes[48..52].try_into().expect("4 bytes")),
            block_size: u16::from_be_bytes(bytes[52..54].try_into().expect("2 bytes")),
        })
    }
}

/// Manifest solicitation: just the id prefix, 1..=32 bytes.
pub fn encode_manifest_request(prefix: &[u8]) -> anyhow::Result<Vec<u8>> {
    if prefix.is_empty() || prefix.len() > 32 {
        anyhow::bail!("manifest request prefix must be 1..=32 bytes");
    }
    Ok(prefix.to_vec())
}
