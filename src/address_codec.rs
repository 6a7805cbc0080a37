use crate::hash::Hash160;
use bitcoin::base58;

/// The two output kinds the REST layer renders addresses for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    P2PKH,
    P2SH,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address does not parse")]
    Invalid,

    #[error("address checksum mismatch")]
    BadChecksum,
}

const PREFIX: &str = "bitcoincash";
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

// legacy base58check version bytes, mainnet
const LEGACY_P2PKH: u8 = 0x00;
const LEGACY_P2SH: u8 = 0x05;

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x0007_ffff_ffff) << 5) ^ u64::from(*d);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn expanded_prefix() -> Vec<u8> {
    let mut out: Vec<u8> = PREFIX.bytes().map(|b| b & 0x1f).collect();
    out.push(0);
    out
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::new();
    let max = (1u32 << to) - 1;
    for value in data {
        let value = u32::from(*value);
        if value >> from != 0 {
            return None;
        }
        acc = (acc << from) | value;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return None;
    }
    Some(out)
}

/// Render a hash160 in CashAddr form, `bitcoincash:` prefix included.
pub fn to_cash_address(hash: &Hash160, kind: AddressType) -> String {
    let version: u8 = match kind {
        AddressType::P2PKH => 0,
        AddressType::P2SH => 8,
    };
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(&hash.0);
    let mut packed = convert_bits(&payload, 8, 5, true).unwrap();

    let mut checksum_input = expanded_prefix();
    checksum_input.extend_from_slice(&packed);
    checksum_input.extend_from_slice(&[0u8; 8]);
    let checksum = polymod(&checksum_input);
    for i in 0..8 {
        packed.push(((checksum >> (5 * (7 - i))) & 0x1f) as u8);
    }

    let mut out = String::with_capacity(PREFIX.len() + 1 + packed.len());
    out.push_str(PREFIX);
    out.push(':');
    for five in packed {
        out.push(CHARSET[five as usize] as char);
    }
    out
}

/// Render a hash160 in legacy base58check form.
pub fn to_legacy_address(hash: &Hash160, kind: AddressType) -> String {
    let version = match kind {
        AddressType::P2PKH => LEGACY_P2PKH,
        AddressType::P2SH => LEGACY_P2SH,
    };
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(&hash.0);
    base58::encode_check(&payload)
}

/// Parse either address form into the hash it pays to.
pub fn parse_address(address: &str) -> Result<(Hash160, AddressType), AddressError> {
    if address.contains(':') || address.starts_with('q') || address.starts_with('p') {
        parse_cash_address(address)
    } else {
        parse_legacy_address(address)
    }
}

fn parse_cash_address(address: &str) -> Result<(Hash160, AddressType), AddressError> {
    let lower = address.to_ascii_lowercase();
    let body = match lower.split_once(':') {
        Some((prefix, body)) => {
            if prefix != PREFIX {
                return Err(AddressError::Invalid);
            }
            body
        }
        None => lower.as_str(),
    };
    let mut packed = Vec::with_capacity(body.len());
    for ch in body.bytes() {
        let value = CHARSET
            .iter()
            .position(|c| *c == ch)
            .ok_or(AddressError::Invalid)?;
        packed.push(value as u8);
    }
    if packed.len() < 8 {
        return Err(AddressError::Invalid);
    }
    let mut checksum_input = expanded_prefix();
    checksum_input.extend_from_slice(&packed);
    if polymod(&checksum_input) != 0 {
        return Err(AddressError::BadChecksum);
    }
    let payload =
        convert_bits(&packed[..packed.len() - 8], 5, 8, false).ok_or(AddressError::Invalid)?;
    if payload.len() != 21 {
        return Err(AddressError::Invalid);
    }
    let kind = match payload[0] {
        0 => AddressType::P2PKH,
        8 => AddressType::P2SH,
        _ => return Err(AddressError::Invalid),
    };
    Ok((Hash160::from_slice(&payload[1..]).unwrap(), kind))
}

fn parse_legacy_address(address: &str) -> Result<(Hash160, AddressType), AddressError> {
    let payload = base58::decode_check(address).map_err(|_| AddressError::BadChecksum)?;
    if payload.len() != 21 {
        return Err(AddressError::Invalid);
    }
    let kind = match payload[0] {
        LEGACY_P2PKH => AddressType::P2PKH,
        LEGACY_P2SH => AddressType::P2SH,
        _ => return Err(AddressError::Invalid),
    };
    Ok((Hash160::from_slice(&payload[1..]).unwrap(), kind))
}

#[cfg(test)]
mod test {
    use super::*;

    // test vector from the cashaddr specification
    const SPEC_HASH: [u8; 20] = [
        0xF5, 0xBF, 0x48, 0xB3, 0x97, 0xDA, 0xE7, 0x0B, 0xE8, 0x2B, 0x3C, 0xCA, 0x47, 0x93, 0xF8,
        0xEB, 0x2B, 0x6C, 0xDA, 0xC9,
    ];

    #[test]
    fn test_cashaddr_spec_vector() {
        let addr = to_cash_address(&Hash160(SPEC_HASH), AddressType::P2PKH);
        assert_eq!(
            addr,
            "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2"
        );
    }

    #[test]
    fn test_cashaddr_roundtrip() {
        for kind in [AddressType::P2PKH, AddressType::P2SH] {
            let hash = Hash160([0x42; 20]);
            let addr = to_cash_address(&hash, kind);
            let (back, back_kind) = parse_address(&addr).unwrap();
            assert_eq!(back, hash);
            assert_eq!(back_kind, kind);
            // also without the prefix
            let bare = addr.split(':').nth(1).unwrap();
            assert_eq!(parse_address(bare).unwrap().0, hash);
        }
    }

    #[test]
    fn test_legacy_roundtrip() {
        for kind in [AddressType::P2PKH, AddressType::P2SH] {
            let hash = Hash160([0x17; 20]);
            let addr = to_legacy_address(&hash, kind);
            let (back, back_kind) = parse_address(&addr).unwrap();
            assert_eq!(back, hash);
            assert_eq!(back_kind, kind);
        }
    }

    #[test]
    fn test_checksum_detects_typo() {
        let addr = to_cash_address(&Hash160(SPEC_HASH), AddressType::P2PKH);
        let mut broken = addr.into_bytes();
        let last = broken.len() - 1;
        broken[last] = if broken[last] == b'2' { b'3' } else { b'2' };
        let broken = String::from_utf8(broken).unwrap();
        assert_eq!(
            parse_address(&broken).unwrap_err(),
            AddressError::BadChecksum
        );
    }
}
