//! Half-rate μ-law ("nulaw") codec.
//!
//! Narrow links carry 160 μ-law bytes per 40 ms: audio sampled at 4 kHz.
//! Decode halves each sample and low-pass interpolates back to 8 kHz;
//! encode low-pass filters at 8 kHz and keeps every second sample.

use crate::filters::Lowpass4k;
use crate::mulaw::{mulaw_decode, mulaw_encode};

/// Decode 160 half-rate bytes into 320 samples at 8 kHz.
pub fn nulaw_decode(data: &[u8; 160], lp: &mut Lowpass4k, out: &mut [i16; 320]) {
    for (i, &byte) in data.iter().enumerate() {
        let s = mulaw_decode(byte) / 2;
        out[i * 2] = lp.filter(s);
        out[i * 2 + 1] = lp.filter(s);
    }
}

/// Encode 320 samples at 8 kHz into 160 half-rate bytes.
///
/// Samples are clamped to ±14000 before filtering; the filter runs over
/// every sample so its state stays correct, but only the second output of
/// each pair is kept.
pub fn nulaw_encode(samples: &[i16; 320], lp: &mut Lowpass4k, out: &mut [u8; 160]) {
    for (i, pair) in samples.chunks_exact(2).enumerate() {
        let a = pair[0].clamp(-14000, 14000);
        let b = pair[1].clamp(-14000, 14000);
        lp.filter(a);
        out[i] = mulaw_encode(lp.filter(b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_produces_doubled_stream() {
        let data = [0x55u8; 160];
        let mut lp = Lowpass4k::new();
        let mut out = [0i16; 320];
        nulaw_decode(&data, &mut lp, &mut out);
        // Steady input settles to a steady (non-zero) output.
        assert_ne!(out[300], 0);
        assert!((out[318] as i32 - out[319] as i32).abs() < 64);
    }

    #[test]
    fn roundtrip_preserves_voice_band_tone() {
        // 500 Hz tone survives the 4 kHz round trip with its level intact.
        let mut samples = [0i16; 320];
        for (i, s) in samples.iter_mut().enumerate() {
            let t = i as f32 / 8000.0;
            *s = (8000.0 * (2.0 * std::f32::consts::PI * 500.0 * t).sin()) as i16;
        }
        let mut enc_lp = Lowpass4k::new();
        let mut out = [0u8; 160];
        nulaw_encode(&samples, &mut enc_lp, &mut out);

        let mut dec_lp = Lowpass4k::new();
        let mut decoded = [0i16; 320];
        nulaw_decode(&out, &mut dec_lp, &mut decoded);

        let rms = |buf: &[i16]| {
            let acc: f64 = buf.iter().map(|&s| (s as f64) * (s as f64)).sum();
            (acc / buf.len() as f64).sqrt()
        };
        let orig = rms(&samples[160..]);
        let got = rms(&decoded[160..]);
        assert!(got > orig * 0.3, "orig {} got {}", orig, got);
        assert!(got < orig * 3.0, "orig {} got {}", orig, got);
    }

    #[test]
    fn encode_clamps_hot_audio() {
        let samples = [i16::MAX; 320];
        let mut lp = Lowpass4k::new();
        let mut out = [0u8; 160];
        nulaw_encode(&samples, &mut lp, &mut out);
        // No panic and the settled output decodes within the clamp range.
        let settled = mulaw_decode(out[159]);
        assert!(settled.abs() <= 14500, "settled {}", settled);
    }
}
