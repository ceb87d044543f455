use thiserror::Error;

use crate::memory::RemotePointer;

/// Errors raised by the compute-side remote memory allocator.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AllocError {
    /// Zero-sized allocations are a caller bug
    #[error("refusing a zero-sized allocation")]
    SizeZero,
    /// Nothing larger than a page can be served from a page group
    #[error("allocation of {0} bytes is larger than a page")]
    TooLarge(usize),
    /// The current segment can't refill a page group; a fresh segment is
    /// needed before retrying
    #[error("current segment is exhausted, a new segment is required")]
    SegmentExhausted,
    /// Every memory node declined a segment request
    #[error("no remote memory left on any memory node")]
    OutOfMemory,
}

/// Errors on the wire: one-sided reads/writes, the allocation RPC, and the
/// bootstrap handshake. Fatal for the operation that hit them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("i/o failure talking to a memory node")]
    Io(#[from] std::io::Error),
    #[error("memory node {0} is not connected")]
    UnknownNode(u8),
    #[error("access beyond the registered region: address {addr:#x}, length {len}")]
    OutOfRange { addr: u64, len: usize },
    #[error("malformed frame from peer: {0}")]
    BadResponse(&'static str),
    #[error("all memory nodes are out of segments")]
    NoRemoteMemory,
}

/// Errors parsing the line-oriented cluster config files. Fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to open config file")]
    Io(#[from] std::io::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unparseable uri in line: {0}")]
    BadUri(String),
}

/// Top-level error for user-visible store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("remote pointer {0:?} does not belong to any connected node")]
    DanglingPointer(RemotePointer),
}
