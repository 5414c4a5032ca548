//! Audio DSP for the voter/simulcast driver.
//!
//! Narrowband (8 kHz) codecs and filters:
//! - G.711 μ-law encode/decode
//! - Dialogic/OKI 4-bit ADPCM (40 ms frames with a 3-byte state trailer)
//! - Half-rate μ-law ("nulaw") with low-pass interpolation
//! - PL high-pass, 1900 Hz low-pass, and de-emphasis filters
//! - CTCSS tone generation and saturating mixing

pub mod adpcm;
pub mod filters;
pub mod mix;
pub mod mulaw;
pub mod nulaw;
pub mod tone;

pub use adpcm::AdpcmCoder;
pub use filters::{Deemphasis, Highpass300, Lowpass4k};
pub use mix::{db_to_gain, mix_saturating, apply_gain};
pub use mulaw::{mulaw_decode, mulaw_encode, MULAW_SILENCE};
pub use nulaw::{nulaw_decode, nulaw_encode};
pub use tone::CtcssGen;
