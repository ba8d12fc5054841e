//! Wire formats for the peer session layer
//!
//! Two records travel over a freshly dialed peer stream:
//!
//! - a [`Handshake`] line declaring what the stream is for (tunnel forwarding or
//!   mesh messaging), sent exactly once before any payload byte;
//! - for mesh links only, a sequence of length-delimited frames carrying opaque
//!   application payloads.

pub mod codec;
pub mod handshake;

pub use codec::{encode_mesh_frame, mesh_codec, MAX_MESH_FRAME};
pub use handshake::{Handshake, HandshakeError, MAX_HANDSHAKE_LEN};
