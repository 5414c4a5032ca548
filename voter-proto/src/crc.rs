//! CRC-32 authentication digests.
//!
//! Digests are computed over the concatenation of two NUL-terminated
//! strings (challenge then password) with the IEEE polynomial 0xEDB88320,
//! an initial value of 0xFFFFFFFF, and a final bit complement.

const POLY: u32 = 0xEDB8_8320;

const fn make_table() -> [u32; 256] {
    let mut tab = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        tab[n] = c;
        n += 1;
    }
    tab
}

static CRC_TAB: [u32; 256] = make_table();

/// Feed bytes into a running CRC, stopping at the first NUL byte.
fn update(mut crc: u32, buf: &[u8]) -> u32 {
    for &b in buf {
        if b == 0 {
            break;
        }
        crc = CRC_TAB[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}

/// Digest of two string buffers, as exchanged in packet headers.
///
/// Both buffers are treated as NUL-terminated: a padded challenge field may
/// be passed directly. Empty inputs yield 0.
pub fn crc32_bufs(challenge: &[u8], password: &[u8]) -> u32 {
    !update(update(0xFFFF_FFFF, challenge), password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs_digest_to_zero() {
        assert_eq!(crc32_bufs(b"", b""), 0);
    }

    #[test]
    fn nonempty_digest_is_nonzero() {
        assert_ne!(crc32_bufs(b"abc1234567", b"secret"), 0);
    }

    #[test]
    fn matches_ieee_reference() {
        // CRC-32 of "123456789" is the classic check value.
        assert_eq!(crc32_bufs(b"123456789", b""), 0xCBF4_3926);
        // Concatenation across the two buffers is seamless.
        assert_eq!(crc32_bufs(b"12345", b"6789"), 0xCBF4_3926);
    }

    #[test]
    fn stops_at_nul_padding() {
        let padded = *b"abc\0\0\0\0\0\0\0";
        assert_eq!(crc32_bufs(&padded, b"pw"), crc32_bufs(b"abc", b"pw"));
    }

    #[test]
    fn order_matters() {
        assert_ne!(crc32_bufs(b"abc", b"def"), crc32_bufs(b"def", b"abc"));
    }
}
