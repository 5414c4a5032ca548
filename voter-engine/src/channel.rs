//! Host-facing channel interface.
//!
//! The engine stands in for a telephony channel driver: per node it emits
//! framed audio, text notifications, and key/unkey control events to the
//! host over an unbounded channel, and accepts transmit audio through the
//! server handle.

use voter_proto::FRAME_SIZE;

/// One 20 ms frame of signed-linear audio.
pub type AudioFrame = [i16; FRAME_SIZE];

/// A frame of silence.
pub const SILENCE: AudioFrame = [0i16; FRAME_SIZE];

/// Events delivered to the host for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Voted (and mixed) receive audio, one 20 ms frame.
    Audio(Box<AudioFrame>),
    /// Text notification: a new winner's name, or pager status
    /// (`"ENDPAGE"`).
    Text(String),
    /// A remote transmitter keyed up.
    RadioKey,
    /// All remote carriers dropped.
    RadioUnkey,
    /// A DTMF digit ended; duration as measured by the detector.
    DtmfEnd { digit: char, duration_ms: u32 },
}

/// A completed DTMF detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub digit: char,
    pub duration_ms: u32,
}

/// Host-pluggable DTMF detector fed with every outbound receive frame.
///
/// The engine squelches the mute digits `m` and `u` and replaces audio
/// with silence on the frame where a digit ends.
pub trait DtmfDetector: Send {
    /// Process one frame; return a detection when a digit ends.
    fn process(&mut self, frame: &AudioFrame) -> Option<DtmfEvent>;
}
