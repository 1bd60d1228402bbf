use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{util::*, Result, WireError};

// Bootstrap registry protocol. Endpoints travel as socket-address strings;
// the registry itself never parses them.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum DirectoryRequest {

    // Binds `name` to `endpoint`, replacing any previous binding.
    Register { name: String, endpoint: String },

    Unregister { name: String },

    Lookup { name: String },

    // All bindings whose name starts with `prefix`.
    List { prefix: String },

}

#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum DirectoryResponse {

    Done { ok: bool },

    Endpoint { endpoint: Option<String> },

    Listing { entries: Vec<(String, String)> },

}

impl DirectoryRequest {

    fn encode(&self, dst: &mut BytesMut) {
        match self {

            DirectoryRequest::Register { name, endpoint } => {
                dst.put_u8(0);
                put_str(dst, name);
                put_str(dst, endpoint);
            },

            DirectoryRequest::Unregister { name } => {
                dst.put_u8(1);
                put_str(dst, name);
            },

            DirectoryRequest::Lookup { name } => {
                dst.put_u8(2);
                put_str(dst, name);
            },

            DirectoryRequest::List { prefix } => {
                dst.put_u8(3);
                put_str(dst, prefix);
            },

        }
    }

    fn decode(src: &mut BytesMut) -> Result<Self> {
        let req = match get_u8(src)? {
            0 => DirectoryRequest::Register {
                name: get_str(src)?,
                endpoint: get_str(src)?,
            },
            1 => DirectoryRequest::Unregister { name: get_str(src)? },
            2 => DirectoryRequest::Lookup { name: get_str(src)? },
            3 => DirectoryRequest::List { prefix: get_str(src)? },
            tag => {
                tracing::warn!("invalid directory request tag: {}", tag);
                return Err(WireError::InvalidTag(tag));
            },
        };
        Ok(req)
    }
}

impl DirectoryResponse {

    fn encode(&self, dst: &mut BytesMut) {
        match self {

            DirectoryResponse::Done { ok } => {
                dst.put_u8(0);
                dst.put_u8(*ok as u8);
            },

            DirectoryResponse::Endpoint { endpoint } => {
                dst.put_u8(1);
                match endpoint {
                    Some(endpoint) => {
                        dst.put_u8(1);
                        put_str(dst, endpoint);
                    },
                    None => dst.put_u8(0),
                }
            },

            DirectoryResponse::Listing { entries } => {
                dst.put_u8(2);
                dst.put_u32(entries.len() as u32);
                for (name, endpoint) in entries {
                    put_str(dst, name);
                    put_str(dst, endpoint);
                }
            },

        }
    }

    fn decode(src: &mut BytesMut) -> Result<Self> {
        let resp = match get_u8(src)? {
            0 => DirectoryResponse::Done { ok: get_u8(src)? != 0 },
            1 => {
                let endpoint = if get_u8(src)? != 0 {
                    Some(get_str(src)?)
                } else {
                    None
                };
                DirectoryResponse::Endpoint { endpoint }
            },
            2 => {
                let count = get_u32(src)? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name = get_str(src)?;
                    let endpoint = get_str(src)?;
                    entries.push((name, endpoint));
                }
                DirectoryResponse::Listing { entries }
            },
            tag => {
                tracing::warn!("invalid directory response tag: {}", tag);
                return Err(WireError::InvalidTag(tag));
            },
        };
        Ok(resp)
    }
}

pub struct DirectoryClientCodec;

impl Encoder<DirectoryRequest> for DirectoryClientCodec {

    type Error = WireError;

    fn encode(&mut self, req: DirectoryRequest, dst: &mut BytesMut) -> Result<()> {
        encode_frame(dst, |dst| req.encode(dst));
        Ok(())
    }
}

impl Decoder for DirectoryClientCodec {

    type Item = DirectoryResponse;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DirectoryResponse>> {
        decode_with(src, DirectoryResponse::decode)
    }
}

pub struct DirectoryServerCodec;

impl Encoder<DirectoryResponse> for DirectoryServerCodec {

    type Error = WireError;

    fn encode(&mut self, resp: DirectoryResponse, dst: &mut BytesMut) -> Result<()> {
        encode_frame(dst, |dst| resp.encode(dst));
        Ok(())
    }
}

impl Decoder for DirectoryServerCodec {

    type Item = DirectoryRequest;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DirectoryRequest>> {
        decode_with(src, DirectoryRequest::decode)
    }
}
