//! Peer-connection lifecycle management for full-mesh video calls.
//!
//! Every participant in a room holds one direct connection to every other
//! participant. [`mesh::MeshController`] keeps that mesh in shape: it pulls
//! room membership on a timer, opens connections to newcomers, answers
//! connections opened by others, swaps the outgoing video source between
//! camera and screen share, and tears everything down on leave.
//!
//! Media capture, rendering, the brokering transport and the membership
//! endpoint are capabilities supplied by the embedder through the traits in
//! [`mesh`].

pub mod sync {
    pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
    pub use std::sync::Arc;
}

pub mod config;
pub mod error;
pub mod mesh;
