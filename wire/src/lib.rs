mod util;
mod rpc;
mod directory;

pub use rpc::{Request, Response, RpcClientCodec, RpcServerCodec};
pub use directory::{
    DirectoryClientCodec, DirectoryRequest, DirectoryResponse, DirectoryServerCodec,
};

// Peer ids are positive and assigned at startup; epochs only ever grow.
pub type PeerId = u32;
pub type Epoch = u64;

// Hard cap on a single frame. File bodies travel inline in one frame, so
// this is also the largest file the overlay will serve.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message tag: {0}")]
    InvalidTag(u8),

    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    #[error("truncated frame")]
    Truncated,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

}

pub type Result<T> = std::result::Result<T, WireError>;
