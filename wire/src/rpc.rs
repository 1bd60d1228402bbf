use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    util::*,
    Epoch, PeerId, Result, WireError,
};

// The remote-callable surface every peer exposes. `register_files`,
// `search_file` and `get_file_index` only do anything on the Tracker;
// a non-Tracker answers them with the empty/false result.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum Request {

    // Liveness probe, valid in any role.
    Ping,

    // Tracker liveness broadcast carrying the Tracker's epoch.
    Heartbeat { epoch: Epoch },

    // Vote solicitation from a candidate for `epoch`.
    RequestVote { candidate: PeerId, epoch: Epoch },

    // Replaces the Tracker's record of `peer`'s files wholesale.
    RegisterFiles { peer: PeerId, files: Vec<String> },

    // Asks the Tracker which peers hold `filename`.
    SearchFile { filename: String },

    // Snapshot of the Tracker's whole index.
    GetFileIndex,

    // Fetches the named file's bytes from the receiving peer's store.
    DownloadFile { filename: String },

}

#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum Response {

    Pong,

    Heartbeat { accepted: bool },

    Vote { granted: bool },

    Registered { ok: bool },

    // Ids of the peers holding the searched file.
    Holders { peers: Vec<PeerId> },

    // Index snapshot, one entry per registered peer.
    FileIndex { entries: Vec<(PeerId, Vec<String>)> },

    // File body, empty on miss or read error.
    FileData { data: Vec<u8> },

}

impl Request {

    fn encode(&self, dst: &mut BytesMut) {
        match self {

            // <len><0>
            Request::Ping => dst.put_u8(0),

            // <len><1><epoch>
            Request::Heartbeat { epoch } => {
                dst.put_u8(1);
                dst.put_u64(*epoch);
            },

            // <len><2><candidate><epoch>
            Request::RequestVote { candidate, epoch } => {
                dst.put_u8(2);
                dst.put_u32(*candidate);
                dst.put_u64(*epoch);
            },

            // <len><3><peer><count>(<name>)*
            Request::RegisterFiles { peer, files } => {
                dst.put_u8(3);
                dst.put_u32(*peer);
                put_str_list(dst, files);
            },

            // <len><4><filename>
            Request::SearchFile { filename } => {
                dst.put_u8(4);
                put_str(dst, filename);
            },

            // <len><5>
            Request::GetFileIndex => dst.put_u8(5),

            // <len><6><filename>
            Request::DownloadFile { filename } => {
                dst.put_u8(6);
                put_str(dst, filename);
            },

        }
    }

    fn decode(src: &mut BytesMut) -> Result<Self> {
        let req = match get_u8(src)? {
            0 => Request::Ping,
            1 => Request::Heartbeat { epoch: get_u64(src)? },
            2 => Request::RequestVote {
                candidate: get_u32(src)?,
                epoch: get_u64(src)?,
            },
            3 => Request::RegisterFiles {
                peer: get_u32(src)?,
                files: get_str_list(src)?,
            },
            4 => Request::SearchFile { filename: get_str(src)? },
            5 => Request::GetFileIndex,
            6 => Request::DownloadFile { filename: get_str(src)? },
            tag => {
                tracing::warn!("invalid request tag: {}", tag);
                return Err(WireError::InvalidTag(tag));
            },
        };
        Ok(req)
    }
}

impl Response {

    fn encode(&self, dst: &mut BytesMut) {
        match self {

            Response::Pong => dst.put_u8(0),

            Response::Heartbeat { accepted } => {
                dst.put_u8(1);
                dst.put_u8(*accepted as u8);
            },

            Response::Vote { granted } => {
                dst.put_u8(2);
                dst.put_u8(*granted as u8);
            },

            Response::Registered { ok } => {
                dst.put_u8(3);
                dst.put_u8(*ok as u8);
            },

            Response::Holders { peers } => {
                dst.put_u8(4);
                dst.put_u32(peers.len() as u32);
                for peer in peers {
                    dst.put_u32(*peer);
                }
            },

            Response::FileIndex { entries } => {
                dst.put_u8(5);
                dst.put_u32(entries.len() as u32);
                for (peer, files) in entries {
                    dst.put_u32(*peer);
                    put_str_list(dst, files);
                }
            },

            Response::FileData { data } => {
                dst.put_u8(6);
                put_blob(dst, data);
            },

        }
    }

    fn decode(src: &mut BytesMut) -> Result<Self> {
        let resp = match get_u8(src)? {
            0 => Response::Pong,
            1 => Response::Heartbeat { accepted: get_u8(src)? != 0 },
            2 => Response::Vote { granted: get_u8(src)? != 0 },
            3 => Response::Registered { ok: get_u8(src)? != 0 },
            4 => {
                let count = get_u32(src)? as usize;
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    peers.push(get_u32(src)?);
                }
                Response::Holders { peers }
            },
            5 => {
                let count = get_u32(src)? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let peer = get_u32(src)?;
                    let files = get_str_list(src)?;
                    entries.push((peer, files));
                }
                Response::FileIndex { entries }
            },
            6 => Response::FileData { data: get_blob(src)? },
            tag => {
                tracing::warn!("invalid response tag: {}", tag);
                return Err(WireError::InvalidTag(tag));
            },
        };
        Ok(resp)
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Ping => write!(f, "ping"),
            Request::Heartbeat { epoch } => write!(f, "heartbeat {{ epoch: {} }}", epoch),
            Request::RequestVote { candidate, epoch } => {
                write!(f, "request vote {{ candidate: {}, epoch: {} }}", candidate, epoch)
            },
            Request::RegisterFiles { peer, files } => {
                write!(f, "register files {{ peer: {}, count: {} }}", peer, files.len())
            },
            Request::SearchFile { filename } => write!(f, "search file {:?}", filename),
            Request::GetFileIndex => write!(f, "get file index"),
            Request::DownloadFile { filename } => write!(f, "download file {:?}", filename),
        }
    }
}

// Caller side: sends requests, reads responses.
pub struct RpcClientCodec;

impl Encoder<Request> for RpcClientCodec {

    type Error = WireError;

    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<()> {
        encode_frame(dst, |dst| req.encode(dst));
        Ok(())
    }
}

impl Decoder for RpcClientCodec {

    type Item = Response;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>> {
        decode_with(src, Response::decode)
    }
}

// Serving side: reads requests, sends responses.
pub struct RpcServerCodec;

impl Encoder<Response> for RpcServerCodec {

    type Error = WireError;

    fn encode(&mut self, resp: Response, dst: &mut BytesMut) -> Result<()> {
        encode_frame(dst, |dst| resp.encode(dst));
        Ok(())
    }
}

impl Decoder for RpcServerCodec {

    type Item = Request;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>> {
        decode_with(src, Request::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_LEN;

    #[test]
    fn test_request_round_trip() {

        let requests = [
            Request::Ping,
            Request::Heartbeat { epoch: 7 },
            Request::RequestVote { candidate: 3, epoch: 8 },
            Request::RegisterFiles {
                peer: 2,
                files: vec!["a.bin".into(), "b.txt".into()],
            },
            Request::RegisterFiles { peer: 9, files: vec![] },
            Request::SearchFile { filename: "x.bin".into() },
            Request::GetFileIndex,
            Request::DownloadFile { filename: "dup.txt".into() },
        ];

        let mut buf = BytesMut::new();
        for req in &requests {
            RpcClientCodec.encode(req.clone(), &mut buf).unwrap();
        }
        for req in &requests {
            let decoded = RpcServerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, req);
        }
        assert!(RpcServerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_response_round_trip() {

        let responses = [
            Response::Pong,
            Response::Heartbeat { accepted: true },
            Response::Vote { granted: false },
            Response::Registered { ok: true },
            Response::Holders { peers: vec![2, 3] },
            Response::Holders { peers: vec![] },
            Response::FileIndex {
                entries: vec![(1, vec!["x.bin".into()]), (2, vec![])],
            },
            Response::FileData { data: vec![0xde, 0xad, 0xbe, 0xef] },
            Response::FileData { data: vec![] },
        ];

        let mut buf = BytesMut::new();
        for resp in &responses {
            RpcServerCodec.encode(resp.clone(), &mut buf).unwrap();
        }
        for resp in &responses {
            let decoded = RpcClientCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, resp);
        }
    }

    #[test]
    fn test_decode_chunked() {

        let mut full = BytesMut::new();
        RpcClientCodec
            .encode(Request::SearchFile { filename: "x.bin".into() }, &mut full)
            .unwrap();

        // Feed the frame one byte short, then the rest.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..full.len() - 1]);
        assert!(RpcServerCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        let decoded = RpcServerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Request::SearchFile { filename: "x.bin".into() });
    }

    #[test]
    fn test_decode_invalid_tag() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0xff][..]);
        match RpcServerCodec.decode(&mut buf) {
            Err(WireError::InvalidTag(0xff)) => {},
            other => panic!("expected invalid tag error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        buf.extend_from_slice(&[6, 0, 0]);
        match RpcServerCodec.decode(&mut buf) {
            Err(WireError::FrameTooLarge(_)) => {},
            other => panic!("expected frame too large error, got {:?}", other),
        }
    }
}
