//! Scene payload serialization.
//!
//! The container format treats its scene section as an opaque blob, so the
//! encoder sits behind a trait and the rest of the pipeline never knows the
//! format. `FlatSceneWriter` is the built-in implementation: a little
//! endian sectioned binary carrying the tile's materials (with inline RGBA
//! pixels) and its merged batches.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! [0..4)   magic "MSB1"
//! [4..8)   version (u32)
//! [8..12)  material count (u32)
//! [12..16) batch count (u32)
//! then per material:
//!   diffuse rgba (4 x f32), flags (u32, bit0 = repeat),
//!   tex width (u32), tex height (u32), width*height*4 pixel bytes
//! then per batch:
//!   material id (u32), vertex count (u32), index count (u32),
//!   positions (3 x f32 each), normals (3 x f32 each),
//!   colors (4 x u8 each), uvs (2 x f32 each),
//!   batch ids (u16 each), indices (u16 each)
//! ```
//!
//! Every variable-length run is padded with zeros to a 4-byte boundary so
//! the fixed-width fields that follow stay aligned.

use crate::error::SerializationError;
use crate::types::TileContent;

pub const SCENE_MAGIC: [u8; 4] = *b"MSB1";
pub const SCENE_VERSION: u32 = 1;

/// Encoder from assembled tile content to the scene blob embedded in a
/// container.
pub trait SceneSerializer: Sync {
    fn serialize(&self, content: &TileContent) -> Result<Vec<u8>, SerializationError>;
}

/// Built-in sectioned-binary scene encoder. Stateless; output depends only
/// on the input content.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatSceneWriter;

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f32s(buf: &mut Vec<u8>, vals: &[[f32; 3]]) {
    // Free cast on little endian targets, per-component encode elsewhere.
    #[cfg(target_endian = "little")]
    {
        buf.extend_from_slice(bytemuck::cast_slice(vals));
    }
    #[cfg(target_endian = "big")]
    {
        for v in vals {
            for c in v {
                buf.extend_from_slice(&c.to_le_bytes());
            }
        }
    }
}

impl SceneSerializer for FlatSceneWriter {
    fn serialize(&self, content: &TileContent) -> Result<Vec<u8>, SerializationError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SCENE_MAGIC);
        push_u32(&mut buf, SCENE_VERSION);
        push_u32(&mut buf, content.materials.len() as u32);
        push_u32(&mut buf, content.batches.len() as u32);

        for mat in &content.materials {
            for c in mat.diffuse {
                buf.extend_from_slice(&c.to_le_bytes());
            }
            push_u32(&mut buf, mat.repeat as u32);
            match &mat.texture {
                Some(img) => {
                    push_u32(&mut buf, img.width());
                    push_u32(&mut buf, img.height());
                    buf.extend_from_slice(img.as_raw());
                }
                None => {
                    push_u32(&mut buf, 0);
                    push_u32(&mut buf, 0);
                }
            }
            pad4(&mut buf);
        }

        for batch in &content.batches {
            push_u32(&mut buf, batch.material_id);
            push_u32(&mut buf, batch.positions.len() as u32);
            push_u32(&mut buf, batch.indices.len() as u32);
            push_f32s(&mut buf, &batch.positions);
            push_f32s(&mut buf, &batch.normals);
            for c in &batch.colors {
                buf.extend_from_slice(c);
            }
            pad4(&mut buf);
            for uv in &batch.uvs {
                buf.extend_from_slice(&uv[0].to_le_bytes());
                buf.extend_from_slice(&uv[1].to_le_bytes());
            }
            for id in &batch.batch_ids {
                buf.extend_from_slice(&id.to_le_bytes());
            }
            pad4(&mut buf);
            for idx in &batch.indices {
                buf.extend_from_slice(&idx.to_le_bytes());
            }
            pad4(&mut buf);
        }

        Ok(buf)
    }
}
