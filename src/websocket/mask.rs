//! Payload masking

/// XORs `data` with the rotating 4-byte `mask`, starting `offset` bytes
/// into the mask. Returns the offset to continue with on the next chunk of
/// the same payload.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) -> usize {
    let len = data.len();
    let offset = offset & 3;
    let rotated = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    let wide = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2], rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ wide).to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }

    (offset + len) & 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(data: &mut [u8], mask: [u8; 4], offset: usize) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= mask[(offset + i) % 4];
        }
    }

    #[test]
    fn test_matches_bytewise_xor() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in [0, 1, 3, 7, 8, 9, 31] {
            for offset in 0..4 {
                let original: Vec<u8> = (0..len as u8).collect();
                let mut fast = original.clone();
                let mut slow = original.clone();
                apply_mask(&mut fast, mask, offset);
                naive(&mut slow, mask, offset);
                assert_eq!(fast, slow, "len {} offset {}", len, offset);
            }
        }
    }

    #[test]
    fn test_split_payload_continues_rotation() {
        let mask = [1, 2, 3, 4];
        let mut whole = *b"Hello, masked world";
        apply_mask(&mut whole, mask, 0);

        let mut parts = *b"Hello, masked world";
        let (head, tail) = parts.split_at_mut(5);
        let next = apply_mask(head, mask, 0);
        assert_eq!(next, 1);
        apply_mask(tail, mask, next);
        assert_eq!(parts, whole);
    }
}
