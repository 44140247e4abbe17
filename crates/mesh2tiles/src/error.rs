//! Error taxonomy for the tiling pipeline.
//!
//! Each stage owns its error enum; `TilerError` is the umbrella the
//! orchestrator logs per node. A failing node never aborts its siblings.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("grid coordinate ({x},{y},{z}) out of range for depth {depth}")]
    CoordOutOfRange { depth: u8, x: u32, y: u32, z: u32 },

    #[error("node at depth {child_depth} is not a child of the node at depth {parent_depth}")]
    NotAChild { parent_depth: u8, child_depth: u8 },

    #[error("bounding volume has min > max on axis {axis}")]
    InvalidVolume { axis: usize },

    #[error("duplicate node code '{0}'")]
    DuplicateCode(String),
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("attribute buffer '{attribute}' has {got} entries, expected {expected}")]
    AttributeMismatch {
        attribute: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("model '{0}' has an index but no vertices")]
    IndexWithoutVertices(String),

    #[error("model '{0}' exceeds the distinct-index ceiling on its own")]
    ModelTooLarge(String),

    #[error("node holds {0} models, more than the batch-id range allows")]
    TooManyModels(usize),

    #[error("node '{0}' produced no batches or materials")]
    EmptyTile(String),

    #[error(transparent)]
    Atlas(#[from] AtlasError),
}

#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("atlas {width}x{height} exceeds the configured maximum of {max}")]
    Oversize { width: u32, height: u32, max: u32 },

    #[error("failed to load texture {path}: {source}")]
    MissingImage {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("no images supplied to the atlas packer")]
    NoInputs,
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("written tile length {written} disagrees with header length {header}")]
    LengthMismatch { header: u32, written: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Umbrella error for one node's assemble-and-serialize job.
#[derive(Debug, Error)]
pub enum TilerError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Atlas(#[from] AtlasError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
