//! Bounds-checked primitives shared by the binary decoders.

use bytes::{Buf, BufMut};

use crate::errors::{ProtocolError, Result};

/// Split `n` bytes off the front of `src`.
pub(crate) fn take<'a>(src: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if src.len() < n {
        return Err(ProtocolError::Truncated { needed: n, available: src.len() });
    }
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

pub(crate) fn take_array<const N: usize>(src: &mut &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(src, N)?);
    Ok(out)
}

pub(crate) fn get_u8(src: &mut &[u8]) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

pub(crate) fn get_u16(src: &mut &[u8]) -> Result<u16> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

pub(crate) fn get_u32(src: &mut &[u8]) -> Result<u32> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

pub(crate) fn get_u64(src: &mut &[u8]) -> Result<u64> {
    ensure(src, 8)?;
    Ok(src.get_u64())
}

/// Read a `u32` length prefix followed by that many bytes.
pub(crate) fn get_blob<'a>(src: &mut &'a [u8], field: &'static str, max: usize) -> Result<&'a [u8]> {
    let len = get_u32(src)? as usize;
    if len > max {
        return Err(ProtocolError::FieldTooLarge { field, size: len, max });
    }
    take(src, len)
}

/// Write a `u32` length prefix followed by the bytes.
pub(crate) fn put_blob(
    dst: &mut impl BufMut,
    field: &'static str,
    bytes: &[u8],
    max: usize,
) -> Result<()> {
    if bytes.len() > max {
        return Err(ProtocolError::FieldTooLarge { field, size: bytes.len(), max });
    }
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
    Ok(())
}

pub(crate) fn ensure_empty(src: &[u8]) -> Result<()> {
    if src.is_empty() { Ok(()) } else { Err(ProtocolError::TrailingBytes(src.len())) }
}

fn ensure(src: &[u8], n: usize) -> Result<()> {
    if src.len() < n {
        return Err(ProtocolError::Truncated { needed: n, available: src.len() });
    }
    Ok(())
}
