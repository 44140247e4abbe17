//! Core data model: bounding volumes, source models, materials, merged
//! geometry batches and assembled tile content.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;

use crate::error::AssemblyError;

/// Axis-aligned bounding box, `min <= max` per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        debug_assert!((0..3).all(|a| min[a] <= max[a]));
        Self { min, max }
    }

    /// Smallest box containing every point; `None` for an empty slice.
    pub fn from_points(points: &[[f64; 3]]) -> Option<Self> {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        let mut any = false;
        for p in points {
            if p.iter().any(|v| !v.is_finite()) {
                continue;
            }
            any = true;
            for a in 0..3 {
                min[a] = min[a].min(p[a]);
                max[a] = max[a].max(p[a]);
            }
        }
        any.then_some(Self { min, max })
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for a in 0..3 {
            min[a] = self.min[a].min(other.min[a]);
            max[a] = self.max[a].max(other.max[a]);
        }
        Aabb { min, max }
    }

    /// Closed-interval overlap test, so boxes sharing only a face still
    /// count as overlapping. Boundary items land in every touching child.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..3).all(|a| self.min[a] <= other.max[a] && self.max[a] >= other.min[a])
    }

    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    pub fn extent(&self, axis: usize) -> f64 {
        self.max[axis] - self.min[axis]
    }

    pub fn longest_extent(&self) -> f64 {
        (0..3).map(|a| self.extent(a)).fold(0.0, f64::max)
    }
}

/// Where a material's diffuse texture comes from. Identity for
/// deduplication is the path when both sides have one, otherwise the pixel
/// content.
#[derive(Debug, Clone)]
pub enum TextureSource {
    Path(PathBuf),
    Image(Arc<RgbaImage>),
}

impl TextureSource {
    pub fn same_as(&self, other: &TextureSource) -> bool {
        match (self, other) {
            (TextureSource::Path(a), TextureSource::Path(b)) => a == b,
            (TextureSource::Image(a), TextureSource::Image(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.dimensions() == b.dimensions() && a.as_raw() == b.as_raw())
            }
            _ => false,
        }
    }
}

/// One source model's material.
#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    pub id: u32,
    /// RGBA diffuse color, components in [0,1].
    pub diffuse: [f32; 4],
    pub texture: Option<TextureSource>,
    /// Set when the model's UV range exceeds the unit square; such a
    /// material keeps its own texture and is never atlas-packed.
    pub repeat: bool,
}

impl MaterialDescriptor {
    pub fn colored(id: u32, diffuse: [f32; 4]) -> Self {
        Self {
            id,
            diffuse,
            texture: None,
            repeat: false,
        }
    }
}

/// Triangle mesh buffers. `positions` is authoritative for the vertex
/// count; the other attribute arrays are either empty or the same length.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub positions: Vec<[f64; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 4]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn check_attributes(&self) -> Result<(), AssemblyError> {
        let n = self.positions.len();
        let check = |attribute: &'static str, got: usize| {
            if got != 0 && got != n {
                Err(AssemblyError::AttributeMismatch {
                    attribute,
                    expected: n,
                    got,
                })
            } else {
                Ok(())
            }
        };
        check("normals", self.normals.len())?;
        check("colors", self.colors.len())?;
        check("uvs", self.uvs.len())?;
        Ok(())
    }

    /// Largest index referenced, `None` when the index buffer is empty.
    pub fn max_index(&self) -> Option<u32> {
        self.indices.iter().copied().max()
    }

    /// UV bounding rectangle as ((min_u, min_v), (max_u, max_v)).
    pub fn uv_bounds(&self) -> Option<([f32; 2], [f32; 2])> {
        if self.uvs.is_empty() {
            return None;
        }
        let mut min = [f32::INFINITY; 2];
        let mut max = [f32::NEG_INFINITY; 2];
        for uv in &self.uvs {
            for a in 0..2 {
                min[a] = min[a].min(uv[a]);
                max[a] = max[a].max(uv[a]);
            }
        }
        Some((min, max))
    }

    /// Replace degenerate values with safe defaults: NaN/infinite
    /// coordinates become 0, zero-length or non-finite normals become +Z.
    pub fn sanitize(&mut self) {
        for p in &mut self.positions {
            for v in p.iter_mut() {
                if !v.is_finite() {
                    *v = 0.0;
                }
            }
        }
        for n in &mut self.normals {
            let len_sq = n[0] * n[0] + n[1] * n[1] + n[2] * n[2];
            if !len_sq.is_finite() || len_sq < 1e-12 {
                *n = [0.0, 0.0, 1.0];
            }
        }
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(&self.positions)
    }
}

/// Decomposed baked world transform of one source model. Geometry arrives
/// already transformed; this is retained for instanced output.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    pub translation: [f64; 3],
    /// Unit quaternion (x, y, z, w).
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

/// Immutable handle to one externally supplied model, assigned to exactly
/// one octree leaf.
#[derive(Debug, Clone)]
pub struct SourceModel {
    /// Stable identifier carried into the batch table.
    pub id: String,
    pub file_name: String,
    pub node_name: String,
    pub mesh: MeshData,
    pub material: MaterialDescriptor,
    pub transform: Transform,
    /// Passthrough metadata columns for the batch table.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SourceModel {
    pub fn bounds(&self) -> Option<Aabb> {
        self.mesh.bounds()
    }

    /// Representative point for center-based distribution.
    pub fn representative_point(&self) -> [f64; 3] {
        self.bounds()
            .map(|b| b.center())
            .unwrap_or(self.transform.translation)
    }
}

/// Merged geometry for one material. The `u16` index type enforces the
/// 65,536 distinct-index ceiling.
#[derive(Debug, Clone, Default)]
pub struct GeometryBatch {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 4]>,
    pub uvs: Vec<[f32; 2]>,
    /// Per-vertex sequential batch id, correlating vertices with batch
    /// table rows.
    pub batch_ids: Vec<u16>,
    pub indices: Vec<u16>,
    pub material_id: u32,
}

impl GeometryBatch {
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn max_index(&self) -> Option<u16> {
        self.indices.iter().copied().max()
    }
}

/// Final per-tile material after dedup, atlas packing and re-numbering.
#[derive(Debug, Clone)]
pub struct TileMaterial {
    pub diffuse: [f32; 4],
    /// Composited atlas for the clamp category, or the unshared texture of
    /// a repeat material.
    pub texture: Option<Arc<RgbaImage>>,
    pub repeat: bool,
}

/// One node's assembled output, consumed immediately by the serializer.
#[derive(Debug, Clone)]
pub struct TileContent {
    pub node_code: String,
    pub lod: u32,
    /// Local origin subtracted from all positions during merge.
    pub rtc_center: [f64; 3],
    pub batches: Vec<GeometryBatch>,
    pub materials: Vec<TileMaterial>,
    /// Baked world transform per batch table row, in row order. Consumed
    /// by instanced output.
    pub transforms: Vec<Transform>,
    pub table: tile3d::BatchTable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_union_and_overlap() {
        let a = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = Aabb::new([0.5, 0.5, 0.5], [2.0, 2.0, 2.0]);
        let u = a.union(&b);
        assert_eq!(u.min, [0.0, 0.0, 0.0]);
        assert_eq!(u.max, [2.0, 2.0, 2.0]);
        assert!(a.overlaps(&b));

        let c = Aabb::new([3.0, 0.0, 0.0], [4.0, 1.0, 1.0]);
        assert!(!a.overlaps(&c));

        // Face-touching boxes overlap under the closed-interval test.
        let d = Aabb::new([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]);
        assert!(a.overlaps(&d));
    }

    #[test]
    fn aabb_from_points_skips_non_finite() {
        let pts = [[0.0, 0.0, 0.0], [f64::NAN, 1.0, 1.0], [2.0, 3.0, 4.0]];
        let b = Aabb::from_points(&pts).unwrap();
        assert_eq!(b.max, [2.0, 3.0, 4.0]);
        assert!(Aabb::from_points(&[]).is_none());
    }

    #[test]
    fn sanitize_fixes_degenerate_values() {
        let mut mesh = MeshData {
            positions: vec![[f64::NAN, 1.0, 2.0]],
            normals: vec![[0.0, 0.0, 0.0]],
            ..Default::default()
        };
        mesh.sanitize();
        assert_eq!(mesh.positions[0], [0.0, 1.0, 2.0]);
        assert_eq!(mesh.normals[0], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn attribute_mismatch_detected() {
        let mesh = MeshData {
            positions: vec![[0.0; 3]; 4],
            uvs: vec![[0.0; 2]; 3],
            ..Default::default()
        };
        assert!(matches!(
            mesh.check_attributes(),
            Err(AssemblyError::AttributeMismatch {
                attribute: "uvs",
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn texture_identity_by_path_and_content() {
        let a = TextureSource::Path("tex/wall.png".into());
        let b = TextureSource::Path("tex/wall.png".into());
        let c = TextureSource::Path("tex/roof.png".into());
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));

        let img1 = Arc::new(RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255])));
        let img2 = Arc::new(RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255])));
        assert!(TextureSource::Image(img1).same_as(&TextureSource::Image(img2)));
    }
}
