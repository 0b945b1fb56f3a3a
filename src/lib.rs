//! Spacedrop: peer-to-peer file transfer over WebRTC data channels.
//!
//! [`core::connection::ConnectionManager`] negotiates one channel per remote
//! device; [`core::engine::TransferEngine`] runs any number of transfers
//! over it, receiver-side buffering included.

pub mod core;
pub mod utils;
