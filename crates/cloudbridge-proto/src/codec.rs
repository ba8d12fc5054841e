//! Mesh payload framing
//!
//! Frames are a 4-byte big-endian length followed by the payload, i.e. the
//! default layout of [`LengthDelimitedCodec`].

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

/// Maximum mesh payload size (1MB)
pub const MAX_MESH_FRAME: usize = 1024 * 1024;

/// Codec used to read mesh frames off a peer stream
pub fn mesh_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_MESH_FRAME)
        .new_codec()
}

/// Encode one mesh frame into a single buffer so it can be written atomically
pub fn encode_mesh_frame(payload: &[u8]) -> Option<Bytes> {
    if payload.len() > MAX_MESH_FRAME {
        return None;
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    Some(frame.freeze())
}
