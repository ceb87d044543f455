//! DiStore: an ordered key-value store for disaggregated memory clusters.
//!
//! Compute nodes run the client operations (put/get/update/scan); memory
//! nodes expose raw byte pools that compute nodes read and write through a
//! one-sided [`transport::Transport`]. Every record lives in remote memory;
//! lookups go through a local skip-list search layer that maps anchor keys
//! to remote pointers, and a linked data layer of fixed-layout record nodes.

pub mod cluster;
pub mod compute;
pub mod concurrency;
pub mod data;
mod error;
pub mod memory;
pub mod memory_node;
pub mod search;
pub mod stats;
pub mod transport;
pub mod workload;

pub use compute::{Client, ComputeNode};
pub use error::{AllocError, ConfigError, StoreError, TransportError};
pub use memory::RemotePointer;

/// Coarse-grained unit of remote memory leased from a memory node - 1 GiB
pub const SEGMENT_SIZE: usize = 1 << 30;

/// A single remote page - always 4 kiB
pub const PAGE_SIZE: usize = 1 << 12;

/// Number of page mirrors bound to one compute thread
pub const PAGE_GROUP_SIZE: usize = 8;

/// Fixed key length in bytes
pub const KEY_SIZE: usize = 16;

/// Fixed value length in bytes
pub const VALUE_SIZE: usize = 16;

/// Maximum number of nodes addressable by a remote pointer (6-bit node id)
pub const MAX_NODES: usize = 64;

/// A key as stored in a data node
pub type KeyBuf = [u8; KEY_SIZE];

/// A value as stored in a data node
pub type ValueBuf = [u8; VALUE_SIZE];
