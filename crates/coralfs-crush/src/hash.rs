//! The placement hash family.
//!
//! These functions are protocol constants: every participant must compute the
//! same value for the same input, or placement disagrees across the cluster.
//! The mix schedule is Robert Jenkins' 32-bit integer hash, seeded and fanned
//! out over one to five input words.

const HASH_SEED: u32 = 1315423911;

#[inline]
fn mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15);
    (a, b, c)
}

/// Hash one 32-bit word.
pub fn hash32(a: u32) -> u32 {
    let mut hash = HASH_SEED ^ a;
    let b = a;
    let x = 231232u32;
    let y = 1232u32;
    let (_, _, h) = mix(b, x, hash);
    hash = h;
    let (_, _, h) = mix(y, a, hash);
    h
}

/// Hash two 32-bit words.
pub fn hash32_2(a: u32, b: u32) -> u32 {
    let mut hash = HASH_SEED ^ a ^ b;
    let x = 231232u32;
    let y = 1232u32;
    let (_, _, h) = mix(a, b, hash);
    hash = h;
    let (_, _, h) = mix(x, a, hash);
    hash = h;
    let (_, _, h) = mix(b, y, hash);
    h
}

/// Hash three 32-bit words.
pub fn hash32_3(a: u32, b: u32, c: u32) -> u32 {
    let mut hash = HASH_SEED ^ a ^ b ^ c;
    let x = 231232u32;
    let y = 1232u32;
    let (_, _, h) = mix(a, b, hash);
    hash = h;
    let (_, _, h) = mix(c, x, hash);
    hash = h;
    let (_, _, h) = mix(y, a, hash);
    hash = h;
    let (_, _, h) = mix(b, x, hash);
    hash = h;
    let (_, _, h) = mix(y, c, hash);
    h
}

/// Hash four 32-bit words.
pub fn hash32_4(a: u32, b: u32, c: u32, d: u32) -> u32 {
    let mut hash = HASH_SEED ^ a ^ b ^ c ^ d;
    let x = 231232u32;
    let y = 1232u32;
    let (_, _, h) = mix(a, b, hash);
    hash = h;
    let (_, _, h) = mix(c, d, hash);
    hash = h;
    let (_, _, h) = mix(a, x, hash);
    hash = h;
    let (_, _, h) = mix(y, b, hash);
    hash = h;
    let (_, _, h) = mix(c, x, hash);
    hash = h;
    let (_, _, h) = mix(y, d, hash);
    h
}

/// Hash five 32-bit words.
pub fn hash32_5(a: u32, b: u32, c: u32, d: u32, e: u32) -> u32 {
    let mut hash = HASH_SEED ^ a ^ b ^ c ^ d ^ e;
    let x = 231232u32;
    let y = 1232u32;
    let (_, _, h) = mix(a, b, hash);
    hash = h;
    let (_, _, h) = mix(c, d, hash);
    hash = h;
    let (_, _, h) = mix(e, x, hash);
    hash = h;
    let (_, _, h) = mix(y, a, hash);
    hash = h;
    let (_, _, h) = mix(b, x, hash);
    hash = h;
    let (_, _, h) = mix(y, c, hash);
    hash = h;
    let (_, _, h) = mix(d, x, hash);
    hash = h;
    let (_, _, h) = mix(y, e, hash);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash32(0x2010), hash32(0x2010));
        assert_eq!(hash32_2(1, 2), hash32_2(1, 2));
        assert_eq!(hash32_3(1, 2, 3), hash32_3(1, 2, 3));
        assert_eq!(hash32_4(1, 2, 3, 4), hash32_4(1, 2, 3, 4));
        assert_eq!(hash32_5(1, 2, 3, 4, 5), hash32_5(1, 2, 3, 4, 5));
    }

    #[test]
    fn test_hash_argument_order_matters() {
        assert_ne!(hash32_2(1, 2), hash32_2(2, 1));
        assert_ne!(hash32_3(1, 2, 3), hash32_3(3, 2, 1));
    }

    #[test]
    fn test_hash_arity_distinguished() {
        // Padding with zeros must not collide across arities.
        assert_ne!(hash32_2(7, 0), hash32(7));
        assert_ne!(hash32_3(7, 8, 0), hash32_2(7, 8));
    }

    #[test]
    fn test_hash_spreads_low_bits() {
        // Consecutive inputs should not produce consecutive outputs.
        let a = hash32(100);
        let b = hash32(101);
        assert_ne!(a.wrapping_add(1), b);
        assert_ne!(a, b);
    }
}
