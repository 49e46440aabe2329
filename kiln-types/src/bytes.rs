//! Little-endian byte access and the FNV-1a hash used for structural keys
//! and the runtime hash.

/// Reads a little-endian `u16` from the front of `bytes`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than two bytes.
pub fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Reads a little-endian `u32` from the front of `bytes`.
pub fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reads a little-endian `u64` from the front of `bytes`.
pub fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Reads a little-endian `i64` from the front of `bytes`.
pub fn read_i64(bytes: &[u8]) -> i64 {
    read_u64(bytes) as i64
}

/// Writes a little-endian `u16` to the front of `bytes`.
pub fn write_u16(bytes: &mut [u8], value: u16) {
    bytes[..2].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u32` to the front of `bytes`.
pub fn write_u32(bytes: &mut [u8], value: u32) {
    bytes[..4].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u64` to the front of `bytes`.
pub fn write_u64(bytes: &mut [u8], value: u64) {
    bytes[..8].copy_from_slice(&value.to_le_bytes());
}

/// Rounds `len` up to the next multiple of `align`. `align` must be a power
/// of two.
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// FNV-1a, the stable non-cryptographic hash behind structural dedup keys
/// and the runtime hash. 64-bit variant regardless of host pointer width so
/// serialized hashes stay portable across toolchain builds.
pub mod fnv {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Initial hash state.
    pub const fn offset() -> u64 {
        OFFSET
    }

    /// Folds `bytes` into `hash`.
    pub const fn append(mut hash: u64, bytes: &[u8]) -> u64 {
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(PRIME);
            i += 1;
        }
        hash
    }

    /// Hash of a byte slice.
    pub const fn hash(bytes: &[u8]) -> u64 {
        append(OFFSET, bytes)
    }

    /// Folds a string into `hash`.
    pub const fn append_str(hash: u64, value: &str) -> u64 {
        append(hash, value.as_bytes())
    }

    /// Folds a little-endian `u64` into `hash`.
    pub const fn append_u64(hash: u64, value: u64) -> u64 {
        append(hash, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn round_trip_le() {
        let mut buf = [0u8; 8];
        write_u32(&mut buf, 0xDEAD_BEEF);
        assert_eq!(read_u32(&buf), 0xDEAD_BEEF);
        write_u64(&mut buf, 0x0123_4567_89AB_CDEF);
        assert_eq!(read_u64(&buf), 0x0123_4567_89AB_CDEF);
        write_u16(&mut buf, 0xA55A);
        assert_eq!(read_u16(&buf), 0xA55A);
    }

    #[rstest]
    #[case(0, 8, 0)]
    #[case(1, 8, 8)]
    #[case(8, 8, 8)]
    #[case(13, 4, 16)]
    #[case(56, 8, 56)]
    fn align_up_powers_of_two(#[case] len: usize, #[case] align: usize, #[case] expected: usize) {
        assert_eq!(align_up(len, align), expected);
    }

    #[test]
    fn fnv_known_vectors() {
        // Reference vectors of 64-bit FNV-1a.
        assert_eq!(fnv::hash(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv::hash(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(fnv::hash(b"ab"), fnv::hash(b"ba"));
    }
}
