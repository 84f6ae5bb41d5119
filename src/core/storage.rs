//! Session snapshot file format.
//!
//! Layout:
//! - magic: `LATLIV01`
//! - version: u32
//! - one `SESS` chunk: tag, len (u32, bytes following), uncompressed_len (u32),
//!   LZ4-compressed JSON payload

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MAGIC: &[u8; 8] = b"LATLIV01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub const SESSION_TAG: [u8; 4] = *b"SESS";

/// Refuse to inflate payloads larger than this.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Write an LZ4 chunk: payload preceded by its uncompressed length.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len =
        u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len()).map_err(|_| invalid("chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

/// Read an LZ4 chunk, checking its tag.
pub fn read_chunk_lz4<R: Read>(r: &mut R, expected: [u8; 4]) -> io::Result<Vec<u8>> {
    let tag = read_exact::<4, _>(r)?;
    if tag != expected {
        return Err(invalid(format!(
            "unexpected chunk tag {:?}, wanted {:?}",
            String::from_utf8_lossy(&tag),
            String::from_utf8_lossy(&expected)
        )));
    }
    let total_len = read_u32_le(r)? as usize;
    let uncompressed_len = read_u32_le(r)? as usize;
    if total_len < 4 {
        return Err(invalid("chunk length shorter than its header"));
    }
    if uncompressed_len > MAX_PAYLOAD_BYTES {
        return Err(invalid(format!(
            "chunk claims {uncompressed_len} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }
    let mut compressed = vec![0u8; total_len - 4];
    r.read_exact(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

pub fn write_snapshot<W: Write, T: Serialize>(w: &mut W, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| invalid(format!("encode failed: {e}")))?;
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)?;
    write_chunk_lz4(w, SESSION_TAG, &json)
}

pub fn read_snapshot<R: Read, T: DeserializeOwned>(r: &mut R) -> io::Result<T> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(invalid("not a session snapshot (bad magic)"));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(invalid(format!("unsupported snapshot version {version}")));
    }
    let json = read_chunk_lz4(r, SESSION_TAG)?;
    serde_json::from_slice(&json).map_err(|e| invalid(format!("decode failed: {e}")))
}
