//! Wire protocol for the voter/simulcast UDP service.
//!
//! Every datagram starts with a fixed 24-byte header ([`PacketHeader`])
//! followed by a payload selected by the header's payload type. All
//! multi-byte header fields are network byte order.

pub mod crc;
pub mod header;
pub mod payload;

pub use crc::crc32_bufs;
pub use header::{PacketHeader, PayloadType, CHALLENGE_LEN, HEADER_LEN};
pub use payload::{AuthFlags, GpsPayload, PingBody, ProxyHeader, PING_BODY_LEN, PROXY_HEADER_LEN};

/// Samples per 20 ms frame at 8 kHz.
pub const FRAME_SIZE: usize = 160;

/// Encoded size of one 40 ms ADPCM frame (160 data bytes + 3 state bytes).
pub const ADPCM_FRAME_SIZE: usize = 163;
