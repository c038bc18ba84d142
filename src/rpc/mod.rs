//! RPC layer: correlated request/response over the worker transport

mod client;
pub mod pending;

pub use client::{CallStream, RpcClient};
pub use pending::{PendingRequest, PendingTable, StreamItem};
