//! Run configuration. One `TilerConfig` value is built from the CLI args
//! and passed by reference into the partitioner, assembler, atlas packer
//! and serializer; there is no process-wide mutable state.

use clap::ValueEnum;

/// How source models are distributed into octree children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionMode {
    /// Each item goes to exactly one child chosen by its representative
    /// point. Fast, single-owner; used for point data.
    Center,
    /// An item is placed into every child whose volume overlaps its
    /// bounding box (or only the first such child when `unique`). Used for
    /// face data to avoid cracks at tile boundaries.
    BoundingBox { unique: bool },
}

/// Octree recursion policy.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    pub max_depth: u8,
    /// A node whose volume is thinner than this on any axis becomes a leaf.
    pub min_box_size: f64,
    /// A node with fewer items than this becomes a leaf.
    pub min_item_count: usize,
    pub mode: DistributionMode,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            max_depth: 8,
            min_box_size: 2.0,
            min_item_count: 2,
            mode: DistributionMode::BoundingBox { unique: true },
        }
    }
}

/// Texture atlas behavior.
#[derive(Debug, Clone, Copy)]
pub struct AtlasConfig {
    /// Hard ceiling; an atlas larger than this on either axis is an error,
    /// never silently truncated.
    pub max_atlas_size: u32,
    /// UV clamp margin in pixels, applied per axis before remapping so
    /// samples stay inside their assigned cell. Kept configurable; the
    /// observed default is half a pixel.
    pub uv_clamp_margin_px: f32,
    /// Tolerance for the rectangle intersection test during placement.
    pub overlap_tolerance: f32,
    /// Edge length of the placeholder synthesized for a material whose
    /// texture is declared but not loadable as an image by itself.
    pub placeholder_size: u32,
    /// Photogrammetric post-process: sentinel border replacement and
    /// LOD-dependent resizing.
    pub photogrammetric: bool,
    pub sentinel_color: [u8; 4],
    pub neutral_fill: [u8; 4],
    /// Size caps for the photogrammetric resize step. LOD 0 may use a
    /// larger cap than higher LODs.
    pub lod0_max_size: u32,
    pub lod_max_size: u32,
    pub min_size: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            max_atlas_size: 16384,
            uv_clamp_margin_px: 0.5,
            overlap_tolerance: 0.01,
            placeholder_size: 64,
            photogrammetric: false,
            sentinel_color: [255, 0, 255, 255],
            neutral_fill: [128, 128, 128, 255],
            lod0_max_size: 4096,
            lod_max_size: 2048,
            min_size: 64,
        }
    }
}

/// Which container kind a run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputKind {
    Batched,
    Instanced,
    Points,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = ValueEnum::to_possible_value(self).ok_or(std::fmt::Error)?;
        f.write_str(v.get_name())
    }
}

/// Per-run instanced rotation encoding (one format-version flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RotationFormat {
    /// Up/right normal triples plus uniform scale.
    Legacy,
    /// Quaternion plus non-uniform scale.
    Quaternion,
}

impl std::fmt::Display for RotationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = ValueEnum::to_possible_value(self).ok_or(std::fmt::Error)?;
        f.write_str(v.get_name())
    }
}

/// Whole-run configuration.
#[derive(Debug, Clone)]
pub struct TilerConfig {
    pub partition: PartitionPolicy,
    pub atlas: AtlasConfig,
    /// A material whose UV bounding rectangle exceeds `1 + repeat_eps` on
    /// either axis is treated as repeating. The observed value is 0.1; no
    /// stricter semantics are inferred.
    pub repeat_eps: f32,
    /// Per-component tolerance for diffuse color equality in dedup.
    pub color_tolerance: f32,
    /// Number of LOD tiers to emit (LOD 0 is the finest).
    pub lod_count: u32,
    pub output_kind: OutputKind,
    pub rotation_format: RotationFormat,
    /// Whether point positions are quantized to u16 in pnts output.
    pub quantize_points: bool,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            partition: PartitionPolicy::default(),
            atlas: AtlasConfig::default(),
            repeat_eps: 0.1,
            color_tolerance: 1.0 / 255.0,
            lod_count: 1,
            output_kind: OutputKind::Batched,
            rotation_format: RotationFormat::Quaternion,
            quantize_points: true,
        }
    }
}

impl TilerConfig {
    /// Texture pre-scale for a LOD tier: halved per tier above LOD 0.
    pub fn texture_scale(&self, lod: u32) -> f32 {
        1.0 / (1u32 << lod.min(16)) as f32
    }
}
