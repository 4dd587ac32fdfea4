//! Byte-order helpers and the Internet checksum (component A).
//!
//! All wire fields are big-endian; these helpers are pure functions with no
//! dependency on the rest of the stack so they can be unit tested in
//! isolation.

/// Computes the 16-bit Internet checksum (RFC 1071) over `data`, continuing
/// from `seed` (pass `0` for a fresh computation, or a partial sum to cover
/// a pseudo-header followed by a header and payload in separate calls).
///
/// The result is the ones'-complement of the folded 16-bit sum. Verifying a
/// received checksum is done by calling this with the checksum field left
/// in place and checking the result is zero.
pub fn checksum(data: &[u8], seed: u32) -> u16 {
    let mut sum = sum16(data, seed);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// The running sum step of [`checksum`], without the final fold and
/// complement. Exposed so UDP/TCP can fold a pseudo-header into the seed
/// before handing the header+payload to `checksum`.
pub(crate) fn sum16(data: &[u8], seed: u32) -> u32 {
    let mut sum = seed;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// `true` iff `checksum(data, 0) == 0`, i.e. the embedded checksum field is
/// internally consistent with the rest of `data`.
pub fn checksum_valid(data: &[u8]) -> bool {
    checksum(data, 0) == 0
}

/// Maps a computed UDP/TCP checksum of `0x0000` to `0xffff`, since a wire
/// value of all-zero means "no checksum was computed" (RFC 768 §UDP
/// checksum). Per `spec.md` §9 open question 4, this rewrite always applies
/// the RFC-conformant mapping, where the reference source transmits a raw
/// zero unchanged.
pub fn checksum_nonzero(sum: u16) -> u16 {
    if sum == 0 { 0xffff } else { sum }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_known_vector_is_correct() {
        // RFC 1071 example: 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data, 0), 0x220d);
    }

    #[test]
    fn embedding_the_checksum_validates() {
        let mut data = vec![0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00];
        let sum = checksum(&data, 0);
        data[10] = (sum >> 8) as u8;
        data[11] = (sum & 0xff) as u8;
        assert!(checksum_valid(&data));
    }

    #[test]
    fn odd_length_buffer_pads_with_zero() {
        assert_eq!(checksum(&[0xff], 0), checksum(&[0xff, 0x00], 0));
    }

    #[test]
    fn zero_maps_to_all_ones() {
        assert_eq!(checksum_nonzero(0), 0xffff);
        assert_eq!(checksum_nonzero(0x1234), 0x1234);
    }
}
