//! Linear-domain mixing helpers.

/// Sum `src` into `dst` with 32-bit intermediates, clamped to ±32767.
pub fn mix_saturating(dst: &mut [i16], src: &[i16]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        let sum = *d as i32 + s as i32;
        *d = sum.clamp(-32767, 32767) as i16;
    }
}

/// Convert a gain in dB to a linear multiplier.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Apply a linear gain, clamping to ±32765.
pub fn apply_gain(buf: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in buf.iter_mut() {
        let v = (*s as f32 * gain).clamp(-32765.0, 32765.0);
        *s = v as i16;
    }
}
