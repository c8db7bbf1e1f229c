//! MurmurHash3 x86 32-bit, used to shard session keys across buckets

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

fn mix_k1(mut k1: u32) -> u32 {
    k1 = k1.wrapping_mul(C1);
    k1 = k1.rotate_left(15);
    k1.wrapping_mul(C2)
}

pub fn murmur3_32(key: &[u8], seed: u32) -> u32 {
    let mut h1 = seed;
    let mut blocks = key.chunks_exact(4);

    for block in &mut blocks {
        let k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k1 ^= (b as u32) << (8 * i);
        }
        h1 ^= mix_k1(k1);
    }

    h1 ^= key.len() as u32;
    fmix32(h1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0x9747_b28c),
            0x2fa8_26cd
        );
    }

    #[test]
    fn test_tail_lengths_differ() {
        let a = murmur3_32(b"k1", 0);
        let b = murmur3_32(b"k12", 0);
        let c = murmur3_32(b"k123", 0);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }
}
