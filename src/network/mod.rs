//! Network Module Implementation
//!
//! TCP plumbing of the relay: length-prefixed framing over the byte stream,
//! one `Connection` per socket, and the `ConnectionRegistry` that accepts,
//! tracks and addresses them.
//!
//! # Architecture
//!
//! - `Connection`: owns one socket; a read task feeds decoded frames into the
//!   registry's ingest queue, a write task drains a bounded outbound queue
//! - `ConnectionRegistry`: peer address to connection table, accept loop,
//!   targeted send, broadcast and the single fan-in stream
//! - `FrameDecoder` / `FrameCodec`: incremental frame parsing with a size cap
//! - `Client`: the dialing side, used by tools and tests

pub use client::Client;
pub use connection::{
    Connection, ConnectionId, ConnectionSettings, ConnectionState, InboundFrame,
};
pub use frame::{Frame, FrameCodec, FrameDecoder};
pub use registry::{ConnectionRegistry, DisconnectListener};

mod client;
mod connection;
mod frame;
mod registry;
