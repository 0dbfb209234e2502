//! CompactSize (Bitcoin varint) encoding for counts and script lengths

use bytes::{Buf, BufMut};

use super::transaction::TransactionError;

/// Append a CompactSize-encoded integer
pub fn write_compact_size(buf: &mut impl BufMut, n: u64) {
    if n < 0xfd {
        buf.put_u8(n as u8);
    } else if n <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(n as u16);
    } else if n <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32_le(n as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(n);
    }
}

/// Number of bytes `write_compact_size` produces for `n`
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Read a CompactSize integer, rejecting non-minimal encodings
pub fn read_compact_size(buf: &mut &[u8]) -> Result<u64, TransactionError> {
    ensure(buf, 1)?;
    let (value, min) = match buf.get_u8() {
        0xfd => {
            ensure(buf, 2)?;
            (buf.get_u16_le() as u64, 0xfd)
        }
        0xfe => {
            ensure(buf, 4)?;
            (buf.get_u32_le() as u64, 0x1_0000)
        }
        0xff => {
            ensure(buf, 8)?;
            (buf.get_u64_le(), 0x1_0000_0000)
        }
        n => return Ok(n as u64),
    };
    if value < min {
        return Err(TransactionError::NonCanonicalCompactSize(value));
    }
    Ok(value)
}

/// Fail with `UnexpectedEof` unless `needed` bytes remain
pub(crate) fn ensure(buf: &&[u8], needed: usize) -> Result<(), TransactionError> {
    if buf.remaining() < needed {
        return Err(TransactionError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Read a CompactSize length followed by that many bytes
pub fn read_var_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, TransactionError> {
    let len = read_compact_size(buf)?;
    let len = usize::try_from(len).map_err(|_| TransactionError::LengthOverflow(len))?;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a CompactSize length followed by the bytes
pub fn write_var_bytes(buf: &mut impl BufMut, data: &[u8]) {
    write_compact_size(buf, data.len() as u64);
    buf.put_slice(data);
}
