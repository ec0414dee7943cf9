//! Little-endian read/write helpers shared by the on-disk formats
//!
//! All multi-byte integers in data files, companion indexes, and replay
//! units are little-endian. String fields are length-prefixed UTF-8.

use crate::storage::error::{StorageError, StorageResult};
use std::io::{Read, Write};

/// Longest accepted string field (device or measurement name)
pub(crate) const MAX_STR_LEN: usize = u16::MAX as usize;

pub(crate) fn write_u8<W: Write>(w: &mut W, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

pub(crate) fn write_u16<W: Write>(w: &mut W, v: u16) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u64<W: Write>(w: &mut W, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_i64<W: Write>(w: &mut W, v: i64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_f64<W: Write>(w: &mut W, v: f64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i64<R: Read>(r: &mut R) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn read_f64<R: Read>(r: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Write a u16-length-prefixed UTF-8 string (data file records)
pub(crate) fn write_str16<W: Write>(w: &mut W, s: &str) -> StorageResult<()> {
    if s.len() > MAX_STR_LEN {
        return Err(StorageError::Serialization(format!(
            "string field too long: {} bytes",
            s.len()
        )));
    }
    write_u16(w, s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Read a u16-length-prefixed UTF-8 string
pub(crate) fn read_str16<R: Read>(r: &mut R) -> StorageResult<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| StorageError::Corruption("string field is not valid UTF-8".to_string()))
}

/// Write a u32-length-prefixed UTF-8 string (companion index tuples)
pub(crate) fn write_str32<W: Write>(w: &mut W, s: &str) -> StorageResult<()> {
    if s.len() > MAX_STR_LEN {
        return Err(StorageError::Serialization(format!(
            "string field too long: {} bytes",
            s.len()
        )));
    }
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Read a u32-length-prefixed UTF-8 string, rejecting implausible lengths
pub(crate) fn read_str32<R: Read>(r: &mut R) -> StorageResult<String> {
    let len = read_u32(r)? as usize;
    if len > MAX_STR_LEN {
        return Err(StorageError::Corruption(format!(
            "string length {} exceeds maximum {}",
            len, MAX_STR_LEN
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| StorageError::Corruption("string field is not valid UTF-8".to_string()))
}
