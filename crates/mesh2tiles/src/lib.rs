//! Octree tiling and batching engine for 3D model sets.
//!
//! The pipeline turns a flat collection of source models into a spatial
//! hierarchy of streamable tile containers:
//!
//! - [`partition`] splits the world into an octree and assigns models to
//!   leaves,
//! - [`assemble`] merges each leaf's models into indexed geometry batches,
//!   deduplicating materials and packing clamp textures into an atlas,
//! - [`atlas`] holds the greedy rectangle packer and UV remapping,
//! - [`scene`] encodes batches and materials into the scene blob a
//!   container embeds,
//! - [`serialize`] maps assembled content onto b3dm/i3dm/pnts containers
//!   (via the `tile3d` crate) and writes them to disk.
//!
//! [`provider`] supplies the input models and [`config`] carries the one
//! immutable configuration value the whole run shares.

pub mod assemble;
pub mod atlas;
pub mod config;
pub mod error;
pub mod partition;
pub mod provider;
pub mod scene;
pub mod serialize;
pub mod types;
