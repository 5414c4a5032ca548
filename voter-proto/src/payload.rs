//! Payload bodies: proxy envelope, ping body, GPS report, auth flags.

use std::net::Ipv4Addr;

use crate::header::{PayloadType, CHALLENGE_LEN};

/// Capability/grant flag bits exchanged during authentication and carried
/// in proxy envelopes.
pub struct AuthFlags;

impl AuthFlags {
    /// Client needs de-emphasis performed remotely.
    pub const DEEMP: u8 = 1;
    /// Client is a master timing source.
    pub const MASTER: u8 = 2;
    /// Client squelch runs without a PL filter.
    pub const NO_PL_FILTER: u8 = 4;
    /// Master indicator (always set together with MASTER).
    pub const MASTER_IND: u8 = 8;
    /// Client sends/receives ADPCM audio.
    pub const ADPCM: u8 = 16;
    /// Client operates in mix (non-GPS-timed) mode.
    pub const MIX: u8 = 32;
}

/// Encoded proxy envelope size in bytes.
pub const PROXY_HEADER_LEN: usize = 19;

/// Envelope inserted after the packet header when traffic is relayed
/// between a secondary and a primary server. Carries the real client's
/// address, the original payload type, and the client's capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client IPv4 address.
    pub addr: Ipv4Addr,
    /// Original client UDP port.
    pub port: u16,
    /// Raw payload type of the wrapped packet.
    pub payload_type: u16,
    /// Capability flags of the client (see [`AuthFlags`]).
    pub flags: u8,
    /// Challenge the wrapped packet was built against, NUL padded.
    pub challenge: [u8; CHALLENGE_LEN],
}

impl ProxyHeader {
    /// Parse an envelope from the bytes following the packet header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PROXY_HEADER_LEN {
            return None;
        }
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&data[9..19]);
        Some(ProxyHeader {
            addr: Ipv4Addr::new(data[0], data[1], data[2], data[3]),
            port: u16::from_be_bytes([data[4], data[5]]),
            payload_type: u16::from_be_bytes([data[6], data[7]]),
            flags: data[8],
            challenge,
        })
    }

    /// Encode into a buffer. Returns the bytes written.
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < PROXY_HEADER_LEN {
            return 0;
        }
        buffer[0..4].copy_from_slice(&self.addr.octets());
        buffer[4..6].copy_from_slice(&self.port.to_be_bytes());
        buffer[6..8].copy_from_slice(&self.payload_type.to_be_bytes());
        buffer[8] = self.flags;
        buffer[9..19].copy_from_slice(&self.challenge);
        PROXY_HEADER_LEN
    }

    /// Decoded payload type of the wrapped packet, if known.
    pub fn payload(&self) -> Option<PayloadType> {
        PayloadType::from_raw(self.payload_type)
    }
}

/// Encoded ping body size in bytes.
pub const PING_BODY_LEN: usize = 164;

/// Length of the ping filler region.
pub const PING_FILLER_LEN: usize = 128;

/// Body of a PING packet: sequence number, sender timestamp, batch start
/// timestamp, and a patterned filler sized to exercise real audio MTUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingBody {
    pub seqno: u32,
    /// Transmit time (seconds, microseconds).
    pub txtime: (i64, i64),
    /// Batch start time; echoed back so stale sessions can be discarded.
    pub starttime: (i64, i64),
}

impl PingBody {
    /// Parse a ping body. The filler pattern is not validated; its purpose
    /// is to catch truncation via the length check alone.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PING_BODY_LEN {
            return None;
        }
        let d = |i: usize| i64::from_le_bytes(data[i..i + 8].try_into().unwrap());
        Some(PingBody {
            seqno: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            txtime: (d(4), d(12)),
            starttime: (d(20), d(28)),
        })
    }

    /// Encode with the filler pattern `(seqno & 0xFF) + i`.
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < PING_BODY_LEN {
            return 0;
        }
        buffer[0..4].copy_from_slice(&self.seqno.to_le_bytes());
        buffer[4..12].copy_from_slice(&self.txtime.0.to_le_bytes());
        buffer[12..20].copy_from_slice(&self.txtime.1.to_le_bytes());
        buffer[20..28].copy_from_slice(&self.starttime.0.to_le_bytes());
        buffer[28..36].copy_from_slice(&self.starttime.1.to_le_bytes());
        for i in 0..PING_FILLER_LEN {
            buffer[36 + i] = (self.seqno as u8).wrapping_add(i as u8);
        }
        PING_BODY_LEN
    }
}

/// ASCII GPS position report: `lat[9] lon[10] elev[7]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsPayload {
    pub lat: String,
    pub lon: String,
    pub elev: String,
}

impl GpsPayload {
    /// Accepted body lengths (some senders drop the final elevation byte).
    pub fn len_ok(len: usize) -> bool {
        len == 26 || len == 25
    }

    /// Parse a position report body.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if !Self::len_ok(data.len()) {
            return None;
        }
        let field = |range: std::ops::Range<usize>| -> String {
            let end = range.end.min(data.len());
            let raw = &data[range.start..end];
            let cut = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..cut]).trim().to_string()
        };
        Some(GpsPayload {
            lat: field(0..9),
            lon: field(9..19),
            elev: field(19..26),
        })
    }
}
