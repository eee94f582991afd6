//! Test pattern generation for mock frame buffers.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Fill `buffer` with a moving diagonal gradient plus light noise.
///
/// Pixels wider than one byte are written little-endian and scaled to the
/// full range of `bits_per_pixel`. The first eight bytes always carry
/// `frame_num` (little-endian) so tests can tell frames apart.
pub fn fill_test_pattern(buffer: &mut [u8], width: u32, height: u32, bits_per_pixel: u32, frame_num: u64) {
    let bytes_per_pixel = (bits_per_pixel as usize).div_ceil(8).max(1);
    let max_value: u64 = if bits_per_pixel >= 64 {
        u64::MAX
    } else {
        (1u64 << bits_per_pixel.max(1)) - 1
    };
    let w = width.max(1) as u64;
    let h = height.max(1) as u64;
    let frame_seed = frame_num.wrapping_mul(2654435761);

    for (idx, pixel) in buffer.chunks_exact_mut(bytes_per_pixel).enumerate() {
        let x = idx as u64 % w;
        let y = (idx as u64 / w) % h;
        let pos = (x + y).wrapping_add(frame_num) % (w + h);
        let ramp = (pos as u128 * max_value as u128 / (w + h) as u128) as u64;
        let noise = prng(frame_seed ^ idx as u64) % 8;
        let value = ramp.saturating_add(noise).min(max_value);
        for (i, byte) in pixel.iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
    }

    let stamp = frame_num.to_le_bytes();
    let n = stamp.len().min(buffer.len());
    buffer[..n].copy_from_slice(&stamp[..n]);
}

/// Frame number stamped by [`fill_test_pattern`].
pub fn read_frame_stamp(buffer: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = buffer.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_round_trip() {
        let mut buf = vec![0u8; 64 * 48];
        fill_test_pattern(&mut buf, 64, 48, 8, 42);
        assert_eq!(read_frame_stamp(&buf), Some(42));
    }

    #[test]
    fn test_frames_differ() {
        let mut a = vec![0u8; 32 * 32 * 2];
        let mut b = a.clone();
        fill_test_pattern(&mut a, 32, 32, 16, 1);
        fill_test_pattern(&mut b, 32, 32, 16, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tiny_buffer() {
        let mut buf = vec![0u8; 3];
        fill_test_pattern(&mut buf, 1, 3, 8, 7);
        assert_eq!(buf[0], 7);
        assert!(read_frame_stamp(&buf).is_none());
    }
}
