use bytes::{Buf, BufMut, BytesMut};
use crate::{Result, WireError, MAX_FRAME_LEN};

// Field helpers shared by the rpc and directory codecs. All integers are
// big-endian; strings and byte blobs are u32-length-prefixed.

pub(crate) fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.extend_from_slice(s.as_bytes());
}

pub(crate) fn get_str(src: &mut BytesMut) -> Result<String> {
    let raw = get_blob(src)?;
    Ok(String::from_utf8(raw)?)
}

pub(crate) fn put_str_list(dst: &mut BytesMut, items: &[String]) {
    dst.put_u32(items.len() as u32);
    for item in items {
        put_str(dst, item);
    }
}

pub(crate) fn get_str_list(src: &mut BytesMut) -> Result<Vec<String>> {
    let count = get_u32(src)? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(get_str(src)?);
    }
    Ok(items)
}

pub(crate) fn put_blob(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.extend_from_slice(data);
}

pub(crate) fn get_blob(src: &mut BytesMut) -> Result<Vec<u8>> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut data = vec![0; len];
    src.copy_to_slice(&mut data);
    Ok(data)
}

pub(crate) fn get_u8(src: &mut BytesMut) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u8())
}

pub(crate) fn get_u32(src: &mut BytesMut) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u32())
}

pub(crate) fn get_u64(src: &mut BytesMut) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u64())
}

// Writes a u32 length prefix, lets `body` fill in the frame, then patches
// the prefix with the number of bytes actually written.
pub(crate) fn encode_frame<F>(dst: &mut BytesMut, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    let start = dst.len();
    dst.put_u32(0);
    body(dst);
    let len = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

// Splits one complete frame off `src`, or returns None until enough bytes
// have arrived. An empty frame carries no tag and is malformed.
pub(crate) fn take_frame(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    if src.remaining() < 4 {
        return Ok(None);
    }

    let mut peeker = std::io::Cursor::new(&src[..]);
    let frame_len = peeker.get_u32() as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(frame_len));
    }
    if frame_len == 0 {
        return Err(WireError::Truncated);
    }
    if src.remaining() < 4 + frame_len {
        return Ok(None);
    }

    src.advance(4);
    Ok(Some(src.split_to(frame_len)))
}

// All four codecs are frame-then-parse; this wraps the shared framing.
pub(crate) fn decode_with<T, F>(src: &mut BytesMut, parse: F) -> Result<Option<T>>
where
    F: FnOnce(&mut BytesMut) -> Result<T>,
{
    match take_frame(src)? {
        Some(mut frame) => Ok(Some(parse(&mut frame)?)),
        None => Ok(None),
    }
}
