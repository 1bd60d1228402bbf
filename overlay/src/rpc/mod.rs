mod client;
pub(crate) mod server;

pub use client::RpcClient;

#[derive(thiserror::Error, Debug)]
pub enum RpcError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("call timed out")]
    Timeout,

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("unexpected response type")]
    UnexpectedResponse,

}

pub type Result<T> = std::result::Result<T, RpcError>;
