use bitcoin::hashes::{sha256d, siphash24, Hash};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A 256 bit hash, stored in the canonical byte order used on the wire.
///
/// Display and FromStr use the conventional reversed hex form so values
/// round-trip against txids as users paste them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

/// A 160 bit hash, the ripemd160-of-sha256 form addresses use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash160(pub [u8; 20]);

impl Hash256 {
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_slice(data: &[u8]) -> Option<Hash256> {
        if data.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(data);
        Some(Hash256(out))
    }

    /// Compare with the least-significant byte as the most significant.
    ///
    /// Bitcoin hashes carry their zero bytes at the high end, so ordering on
    /// the reversed bytes spreads keys evenly over the first-byte jumptable.
    pub fn cmp_reversed(&self, other: &Hash256) -> Ordering {
        for i in 0..32 {
            let ord = self.0[31 - i].cmp(&other.0[31 - i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// The byte binary searches partition on; last in storage order.
    pub fn partition_byte(&self) -> u8 {
        self.0[31]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Hash160 {
    pub fn from_slice(data: &[u8]) -> Option<Hash160> {
        if data.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(data);
        Some(Hash160(out))
    }

    /// Widen into the 32-byte records HashStorage keeps; the zero padding
    /// lands in the high bytes so reversed ordering still keys on real data.
    pub fn widen(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out[..20].copy_from_slice(&self.0);
        Hash256(out)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash256(bytes))
    }
}

/// sha256d over arbitrary bytes; checkpoints checksum their jumptables with it.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let digest = sha256d::Hash::hash(data);
    Hash256(digest.to_byte_array())
}

// The cheap-hash key never changes: bucket records persist the hash value,
// so it must be identical across restarts and across machines.
const CHEAP_HASH_K0: u64 = 0x8f02_6a77_5c9d_2e31;
const CHEAP_HASH_K1: u64 = 0x1d4b_93e8_0a6f_57c2;

/// Keyed 64 bit hash of a txid, used to avoid disk reads on bucket walks.
pub fn cheap_hash(txid: &Hash256) -> u64 {
    siphash24::Hash::hash_to_u64_with_keys(CHEAP_HASH_K0, CHEAP_HASH_K1, &txid.0)
}

/// Bucket count of the unspent-output database.
pub const BUCKET_COUNT: usize = 1 << 20;

/// Bucket selector: the low 20 bits of the cheap hash.
pub fn short_hash(cheap: u64) -> u32 {
    (cheap & 0xF_FFFF) as u32
}

pub fn read_u32_le(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[..4]);
    u32::from_le_bytes(buf)
}

pub fn read_u64_le(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reversed_order() {
        let mut a = Hash256::default();
        let mut b = Hash256::default();
        a.0[31] = 1;
        b.0[0] = 0xFF;
        // the last byte dominates in reversed order
        assert_eq!(a.cmp_reversed(&b), Ordering::Greater);
        assert_eq!(b.cmp_reversed(&a), Ordering::Less);
        assert_eq!(a.cmp_reversed(&a), Ordering::Equal);
    }

    #[test]
    fn test_hex_roundtrip() {
        let hex = "000000006c02c8ea6e4ff69651f7fcde348fb9d557a06e6957b65552002a7820";
        let hash: Hash256 = hex.parse().unwrap();
        assert_eq!(hash.to_string(), hex);
        // reversed display means the leading zeros sit in the high bytes
        assert_eq!(hash.0[31], 0);
        assert_eq!(hash.0[0], 0x20);
    }

    #[test]
    fn test_cheap_hash_stable() {
        let mut txid = Hash256::default();
        txid.0[0] = 42;
        let first = cheap_hash(&txid);
        assert_eq!(first, cheap_hash(&txid));
        assert!(short_hash(first) < BUCKET_COUNT as u32);
        txid.0[0] = 43;
        assert_ne!(first, cheap_hash(&txid));
    }

    #[test]
    fn test_widen_padding() {
        let ripe = Hash160([7u8; 20]);
        let wide = ripe.widen();
        assert_eq!(&wide.0[..20], &[7u8; 20]);
        assert_eq!(&wide.0[20..], &[0u8; 12]);
    }
}
