use crate::cmf::{self, ValueType};
use crate::hash::Hash256;

/// Tags of the records inside a `.db` file and its `.info` checkpoints.
pub mod tags {
    pub const SEPARATOR: u32 = 0;
    pub const TXID: u32 = 1;
    pub const OUT_INDEX: u32 = 2;
    pub const BLOCK_HEIGHT: u32 = 3;
    pub const OFFSET_IN_BLOCK: u32 = 4;
    pub const CHEAP_HASH: u32 = 5;
    pub const LEAF_POSITION: u32 = 6;
    pub const LEAF_POS_REL_TO_BUCKET: u32 = 7;
    pub const LEAF_POS_FROM_PREV_LEAF: u32 = 8;
    pub const LEAF_POS_ON_512MB: u32 = 9;

    pub const IS_TIP: u32 = 10;
    pub const LAST_BLOCK_ID: u32 = 11;
    pub const FIRST_BLOCK_HEIGHT: u32 = 12;
    pub const LAST_BLOCK_HEIGHT: u32 = 13;
    pub const JUMPTABLE_HASH: u32 = 14;
    pub const POSITION_IN_FILE: u32 = 15;
    pub const CHANGES_SINCE_PRUNE: u32 = 16;
    pub const INITIAL_BUCKET_SIZE: u32 = 17;
    pub const INVALID_BLOCK_HASH: u32 = 18;
}

pub const ANCHOR_512MB: u64 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record does not parse as CMF")]
    Malformed,

    #[error("record is truncated")]
    Truncated,

    #[error("leaf position before start of file")]
    NegativePosition,
}

/// The payload a bucket entry points at: the indexed key and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub txid: Hash256,
    pub out_index: u32,
    pub block_height: i32,
    pub offset_in_block: i32,
}

/// One bucket entry: the cheap hash gate plus the leaf's file position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRef {
    pub cheap_hash: u64,
    pub leaf_pos: u64,
}

fn write_int(out: &mut Vec<u8>, tag: u32, value: u64) {
    cmf::write_token(out, tag, ValueType::PositiveNumber);
    cmf::write_var_int(out, value);
}

fn int_field_len(tag: u32, value: u64) -> usize {
    let token = if tag >= 31 {
        1 + cmf::var_int_len(u64::from(tag))
    } else {
        1
    };
    token + cmf::var_int_len(value)
}

/// Serialize a leaf. When the cheap hash committed by the bucket entry
/// equals the first eight txid bytes, only the 24 byte tail is stored.
pub fn write_leaf(out: &mut Vec<u8>, leaf: &Leaf, cheap_hash: u64) {
    cmf::write_token(out, tags::TXID, ValueType::ByteArray);
    if leaf.txid.0[..8] == cheap_hash.to_le_bytes() {
        cmf::write_var_int(out, 24);
        out.extend_from_slice(&leaf.txid.0[8..]);
    } else {
        cmf::write_var_int(out, 32);
        out.extend_from_slice(&leaf.txid.0);
    }
    if leaf.out_index != 0 {
        write_int(out, tags::OUT_INDEX, u64::from(leaf.out_index));
    }
    write_int(out, tags::BLOCK_HEIGHT, leaf.block_height as u64);
    write_int(out, tags::OFFSET_IN_BLOCK, leaf.offset_in_block as u64);
    cmf::write_token(out, tags::SEPARATOR, ValueType::BoolTrue);
}

/// Parse a leaf record; `cheap_hash` reconstructs a 24 byte txid tail.
/// Returns the leaf and the bytes consumed.
pub fn read_leaf(data: &[u8], cheap_hash: u64) -> Result<(Leaf, usize), RecordError> {
    let mut parser = crate::message::MessageParser::new(crate::buffer::ConstBuffer::from(data));
    let mut leaf = Leaf {
        txid: Hash256::default(),
        out_index: 0,
        block_height: -1,
        offset_in_block: -1,
    };
    loop {
        match parser.next() {
            crate::message::Token::Field { tag, .. } => match tag {
                tags::TXID => {
                    let bytes = parser.bytes_data();
                    match bytes.len() {
                        32 => leaf.txid = Hash256::from_slice(&bytes).unwrap(),
                        24 => {
                            let mut full = [0u8; 32];
                            full[..8].copy_from_slice(&cheap_hash.to_le_bytes());
                            full[8..].copy_from_slice(&bytes);
                            leaf.txid = Hash256(full);
                        }
                        _ => return Err(RecordError::Malformed),
                    }
                }
                tags::OUT_INDEX => leaf.out_index = parser.int_data() as u32,
                tags::BLOCK_HEIGHT => leaf.block_height = parser.int_data() as i32,
                tags::OFFSET_IN_BLOCK => leaf.offset_in_block = parser.int_data() as i32,
                tags::SEPARATOR => return Ok((leaf, parser.consumed())),
                _ => return Err(RecordError::Malformed),
            },
            crate::message::Token::EndOfDocument => return Err(RecordError::Truncated),
            crate::message::Token::Error => {
                // a length running past the buffer just means we need more
                return Err(RecordError::Truncated);
            }
        }
    }
}

/// Serialize a bucket at file position `bucket_pos`. Entries are stored
/// newest first; each leaf position uses the cheapest of the four
/// encodings, ties resolved in a fixed order so identical content always
/// produces identical bytes.
pub fn write_bucket(out: &mut Vec<u8>, entries: &[LeafRef], bucket_pos: u64) {
    let mut prev_leaf: Option<u64> = None;
    for entry in entries {
        write_int(out, tags::CHEAP_HASH, entry.cheap_hash);
        let pos = entry.leaf_pos;

        let mut best_tag = tags::LEAF_POSITION;
        let mut best_value = pos;
        let mut best_len = int_field_len(best_tag, best_value);
        let consider = |tag: u32,
                        value: u64,
                        best_tag: &mut u32,
                        best_value: &mut u64,
                        best_len: &mut usize| {
            let len = int_field_len(tag, value);
            if len < *best_len {
                *best_tag = tag;
                *best_value = value;
                *best_len = len;
            }
        };
        consider(
            tags::LEAF_POS_REL_TO_BUCKET,
            bucket_pos - pos,
            &mut best_tag,
            &mut best_value,
            &mut best_len,
        );
        if let Some(prev) = prev_leaf {
            if prev >= pos {
                consider(
                    tags::LEAF_POS_FROM_PREV_LEAF,
                    prev - pos,
                    &mut best_tag,
                    &mut best_value,
                    &mut best_len,
                );
            }
        }
        if pos >= ANCHOR_512MB {
            consider(
                tags::LEAF_POS_ON_512MB,
                pos - ANCHOR_512MB,
                &mut best_tag,
                &mut best_value,
                &mut best_len,
            );
        }
        write_int(out, best_tag, best_value);
        prev_leaf = Some(pos);
    }
    cmf::write_token(out, tags::SEPARATOR, ValueType::BoolTrue);
}

/// Parse a bucket record stored at `bucket_pos`, resolving every entry to
/// an absolute leaf position. Returns the entries and the bytes consumed.
pub fn read_bucket(data: &[u8], bucket_pos: u64) -> Result<(Vec<LeafRef>, usize), RecordError> {
    let mut parser = crate::message::MessageParser::new(crate::buffer::ConstBuffer::from(data));
    let mut entries = Vec::new();
    let mut cheap_hash = 0u64;
    loop {
        match parser.next() {
            crate::message::Token::Field { tag, .. } => match tag {
                tags::CHEAP_HASH => cheap_hash = parser.int_data() as u64,
                tags::LEAF_POSITION => entries.push(LeafRef {
                    cheap_hash,
                    leaf_pos: parser.int_data() as u64,
                }),
                tags::LEAF_POS_REL_TO_BUCKET => {
                    let offset = parser.int_data() as u64;
                    if offset > bucket_pos {
                        return Err(RecordError::NegativePosition);
                    }
                    entries.push(LeafRef {
                        cheap_hash,
                        leaf_pos: bucket_pos - offset,
                    });
                }
                tags::LEAF_POS_FROM_PREV_LEAF => {
                    let delta = parser.int_data() as u64;
                    let prev = entries.last().ok_or(RecordError::Malformed)?.leaf_pos;
                    if delta > prev {
                        return Err(RecordError::NegativePosition);
                    }
                    entries.push(LeafRef {
                        cheap_hash,
                        leaf_pos: prev - delta,
                    });
                }
                tags::LEAF_POS_ON_512MB => entries.push(LeafRef {
                    cheap_hash,
                    leaf_pos: ANCHOR_512MB + parser.int_data() as u64,
                }),
                tags::SEPARATOR => return Ok((entries, parser.consumed())),
                _ => return Err(RecordError::Malformed),
            },
            crate::message::Token::EndOfDocument => return Err(RecordError::Truncated),
            crate::message::Token::Error => return Err(RecordError::Truncated),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(txid_byte: u8, out_index: u32) -> Leaf {
        let mut txid = Hash256::default();
        txid.0[0] = txid_byte;
        txid.0[20] = 0xEE;
        Leaf {
            txid,
            out_index,
            block_height: 112,
            offset_in_block: 81,
        }
    }

    #[test]
    fn test_leaf_roundtrip() {
        let mut out = Vec::new();
        let sample = leaf(9, 3);
        write_leaf(&mut out, &sample, 0xDEAD_BEEF);
        let (back, used) = read_leaf(&out, 0xDEAD_BEEF).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(back, sample);
    }

    #[test]
    fn test_leaf_short_txid() {
        let mut sample = leaf(0, 0);
        let cheap = 0x1122_3344_5566_7788u64;
        sample.txid.0[..8].copy_from_slice(&cheap.to_le_bytes());
        let mut out = Vec::new();
        write_leaf(&mut out, &sample, cheap);
        // 24 byte tail plus tags must be smaller than a full txid record
        assert!(out.len() < 32 + 8);
        let (back, _) = read_leaf(&out, cheap).unwrap();
        assert_eq!(back.txid, sample.txid);
    }

    #[test]
    fn test_leaf_truncated() {
        let mut out = Vec::new();
        write_leaf(&mut out, &leaf(1, 0), 7);
        let err = read_leaf(&out[..out.len() - 1], 7).unwrap_err();
        assert_eq!(err, RecordError::Truncated);
    }

    #[test]
    fn test_bucket_roundtrip_all_encodings() {
        let entries = vec![
            LeafRef {
                cheap_hash: 1,
                leaf_pos: ANCHOR_512MB + 100, // near the anchor
            },
            LeafRef {
                cheap_hash: 2,
                leaf_pos: ANCHOR_512MB + 90, // close to previous leaf
            },
            LeafRef {
                cheap_hash: 3,
                leaf_pos: 50, // small absolute position
            },
        ];
        let bucket_pos = ANCHOR_512MB + 200;
        let mut out = Vec::new();
        write_bucket(&mut out, &entries, bucket_pos);
        let (back, used) = read_bucket(&out, bucket_pos).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(back, entries);
    }

    #[test]
    fn test_bucket_encoding_is_deterministic() {
        let entries = vec![
            LeafRef {
                cheap_hash: 77,
                leaf_pos: 1000,
            },
            LeafRef {
                cheap_hash: 78,
                leaf_pos: 400,
            },
        ];
        let mut a = Vec::new();
        let mut b = Vec::new();
        write_bucket(&mut a, &entries, 2000);
        write_bucket(&mut b, &entries, 2000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bucket_rejects_negative_position() {
        let mut out = Vec::new();
        write_int(&mut out, tags::CHEAP_HASH, 1);
        write_int(&mut out, tags::LEAF_POS_REL_TO_BUCKET, 500);
        cmf::write_token(&mut out, tags::SEPARATOR, ValueType::BoolTrue);
        assert_eq!(
            read_bucket(&out, 100).unwrap_err(),
            RecordError::NegativePosition
        );
    }
}
