//! Varint and ZigZag encoding for snapshot records.

use crate::error::{CountsError, Result};
use crate::types::{CountsKey, TokenId};

/// Maximum encoded length of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Encodes a u64 as an unsigned LEB128 varint.
pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a u64 varint starting at `*off`, advancing the offset.
pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let byte = *src
            .get(*off)
            .ok_or_else(|| CountsError::CorruptSnapshot(format!("varint truncated at byte {}", i)))?;
        *off += 1;
        let payload = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && payload > 1 {
            return Err(CountsError::CorruptSnapshot("varint overflows 64 bits".into()));
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(CountsError::CorruptSnapshot("varint longer than 10 bytes".into()))
}

#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
    encode_u64(zigzag(v), out);
}

pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
    decode_u64(src, off).map(unzigzag)
}

fn decode_token(src: &[u8], off: &mut usize) -> Result<TokenId> {
    let v = decode_i64(src, off)?;
    TokenId::try_from(v)
        .map_err(|_| CountsError::CorruptSnapshot(format!("token id {} out of range", v)))
}

/// Appends one `(key, count)` record.
pub fn encode_entry(key: &CountsKey, count: i64, out: &mut Vec<u8>) {
    out.push(key.kind());
    match *key {
        CountsKey::Node { label } => encode_i64(label as i64, out),
        CountsKey::Relationship {
            rel_type,
            start_label,
            end_label,
        } => {
            encode_i64(rel_type as i64, out);
            encode_i64(start_label as i64, out);
            encode_i64(end_label as i64, out);
        }
    }
    encode_i64(count, out);
}

/// Decodes one `(key, count)` record starting at `*off`.
pub fn decode_entry(src: &[u8], off: &mut usize) -> Result<(CountsKey, i64)> {
    let kind = *src
        .get(*off)
        .ok_or_else(|| CountsError::CorruptSnapshot("record truncated before key kind".into()))?;
    *off += 1;

    let key = match kind {
        1 => CountsKey::node(decode_token(src, off)?),
        2 => {
            let rel_type = decode_token(src, off)?;
            let start_label = decode_token(src, off)?;
            let end_label = decode_token(src, off)?;
            CountsKey::relationship(start_label, rel_type, end_label)
        }
        other => {
            return Err(CountsError::CorruptSnapshot(format!(
                "unknown key kind {}",
                other
            )))
        }
    };
    let count = decode_i64(src, off)?;
    Ok((key, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ANY_LABEL;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_u64(v, &mut buf);
            let mut off = 0;
            assert_eq!(decode_u64(&buf, &mut off).unwrap(), v);
            assert_eq!(off, buf.len());
        }
    }

    #[test]
    fn test_zigzag_small_magnitudes_stay_short() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
        assert_eq!(unzigzag(zigzag(i64::MAX)), i64::MAX);

        let mut buf = Vec::new();
        encode_i64(-1, &mut buf);
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn test_entry_layout() {
        let mut buf = Vec::new();
        encode_entry(&CountsKey::relationship(ANY_LABEL, 3, 4), 10, &mut buf);
        // kind, type=3, start=ANY, end=4, count=10
        assert_eq!(buf, vec![2, 6, 1, 8, 20]);

        let mut off = 0;
        let (key, count) = decode_entry(&buf, &mut off).unwrap();
        assert_eq!(key, CountsKey::relationship(ANY_LABEL, 3, 4));
        assert_eq!(count, 10);
    }

    #[test]
    fn test_truncated_input_is_corruption() {
        let mut off = 0;
        assert!(matches!(
            decode_u64(&[0x80, 0x80], &mut off),
            Err(CountsError::CorruptSnapshot(_))
        ));

        let mut off = 0;
        assert!(matches!(
            decode_entry(&[9, 0, 0], &mut off),
            Err(CountsError::CorruptSnapshot(_))
        ));
    }
}
