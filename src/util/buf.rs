use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw)?;
    Ok(s)
}

/// length-prefixed (varint) byte sequence
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

/// serialized length of a byte sequence written by [put_bytes]
pub fn prefixed_len(len: usize) -> usize {
    let mut num_prefix_bytes = 1;
    let mut rest = len >> 7;
    while rest > 0 {
        num_prefix_bytes += 1;
        rest >>= 7;
    }
    num_prefix_bytes + len
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("declared length {} exceeds remaining {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}
