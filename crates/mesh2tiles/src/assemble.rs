//! Per-node content assembly: material deduplication, texture atlas
//! construction and geometry batching under the 16-bit index ceiling.
//!
//! The pipeline for one leaf runs in a fixed order:
//!
//! 1. tag every model with a sequential batch id,
//! 2. give each model's material a node-unique id,
//! 3. deduplicate materials structurally (diffuse within tolerance,
//!    texture identity, repeat flag),
//! 4. categorize the survivors into color / clamp / repeat,
//! 5. pack the clamp textures into one atlas and remap affected UVs,
//! 6. merge geometry per final material, splitting batches so no index
//!    ever exceeds `u16::MAX`,
//! 7. renumber materials atlas-first, then repeats, then colors.
//!
//! Everything here is pure computation over owned buffers; leaves are
//! assembled in parallel without shared mutable state. A malformed model
//! is logged and skipped, not propagated; the leaf fails only when no
//! model survives.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;

use crate::atlas::{self, PackedAtlas};
use crate::config::TilerConfig;
use crate::error::AssemblyError;
use crate::types::{
    GeometryBatch, MaterialDescriptor, MeshData, SourceModel, TileContent, TileMaterial,
};

/// Material category after dedup. Ordering of the variants is the final
/// renumbering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Atlas,
    Repeat,
    Color,
}

struct WorkModel<'a> {
    source: &'a SourceModel,
    batch_id: u16,
    mesh: MeshData,
    material: MaterialDescriptor,
    /// Index of the canonical material after dedup.
    canonical: usize,
}

pub struct Assembler<'a> {
    cfg: &'a TilerConfig,
    /// Directory texture paths are resolved against.
    base_dir: &'a Path,
}

impl<'a> Assembler<'a> {
    pub fn new(cfg: &'a TilerConfig, base_dir: &'a Path) -> Self {
        Self { cfg, base_dir }
    }

    /// Assemble one leaf's models into tile content.
    pub fn assemble<'m>(
        &self,
        node_code: &str,
        lod: u32,
        models: &[&'m SourceModel],
    ) -> Result<TileContent, AssemblyError> {
        if models.is_empty() {
            return Err(AssemblyError::EmptyTile(node_code.to_string()));
        }
        if models.len() > u16::MAX as usize + 1 {
            return Err(AssemblyError::TooManyModels(models.len()));
        }

        let mut work = self.prepare(models);
        if work.is_empty() {
            return Err(AssemblyError::EmptyTile(node_code.to_string()));
        }
        dedup_materials(&mut work, self.cfg.color_tolerance);

        let canon: BTreeSet<usize> = work.iter().map(|w| w.canonical).collect();
        let categories: BTreeMap<usize, Category> = canon
            .iter()
            .map(|&c| (c, categorize(&work[c].material)))
            .collect();

        let atlas = self.build_atlas(&mut work, &categories, lod)?;
        let (materials, final_of_canonical) =
            self.finalize_materials(&work, &categories, atlas, lod)?;

        let rtc_center = tile_center(&work, node_code)?;
        let batches = merge_batches(&work, &final_of_canonical, rtc_center);
        if batches.is_empty() {
            return Err(AssemblyError::EmptyTile(node_code.to_string()));
        }

        let table = batch_table(&work);
        let transforms = work.iter().map(|w| w.source.transform).collect();
        Ok(TileContent {
            node_code: node_code.to_string(),
            lod,
            rtc_center,
            batches,
            materials,
            transforms,
            table,
        })
    }

    /// Steps 1 and 2: owned sanitized meshes, sequential batch ids,
    /// node-unique material ids, repeat detection from UV extents.
    ///
    /// A model that fails validation is logged and dropped; survivors get
    /// contiguous batch ids in input order.
    fn prepare<'m>(&self, models: &[&'m SourceModel]) -> Vec<WorkModel<'m>> {
        let mut work: Vec<WorkModel<'m>> = Vec::with_capacity(models.len());
        for &source in models {
            match self.prepare_one(source, work.len()) {
                Ok(w) => work.push(w),
                Err(e) => log::warn!("skipping model '{}': {e}", source.id),
            }
        }
        work
    }

    fn prepare_one<'m>(
        &self,
        source: &'m SourceModel,
        slot: usize,
    ) -> Result<WorkModel<'m>, AssemblyError> {
        source.mesh.check_attributes()?;
        if source.mesh.positions.is_empty() && !source.mesh.indices.is_empty() {
            return Err(AssemblyError::IndexWithoutVertices(source.id.clone()));
        }
        if source.mesh.max_index().unwrap_or(0) > u16::MAX as u32 {
            return Err(AssemblyError::ModelTooLarge(source.id.clone()));
        }
        let mut mesh = source.mesh.clone();
        mesh.sanitize();
        if mesh.indices.is_empty() && !mesh.positions.is_empty() {
            // Non-indexed soup: synthesize a sequential index.
            mesh.indices = (0..mesh.positions.len() as u32).collect();
        }

        let mut material = source.material.clone();
        material.id = slot as u32;
        if material.texture.is_some() && !material.repeat {
            material.repeat = self.uv_repeats(&mesh);
        }

        Ok(WorkModel {
            source,
            batch_id: slot as u16,
            mesh,
            material,
            canonical: slot,
        })
    }

    /// A UV span wider than one tile period on either axis means the
    /// texture genuinely wraps and cannot be atlas-packed.
    fn uv_repeats(&self, mesh: &MeshData) -> bool {
        let Some((min, max)) = mesh.uv_bounds() else {
            return false;
        };
        let eps = self.cfg.repeat_eps;
        (0..2).any(|a| max[a] - min[a] > 1.0 + eps)
    }

    /// Step 5: load every clamp texture, pack them and remap the UVs of
    /// each model whose canonical material ended up in the atlas.
    fn build_atlas(
        &self,
        work: &mut [WorkModel<'_>],
        categories: &BTreeMap<usize, Category>,
        lod: u32,
    ) -> Result<Option<PackedAtlas>, AssemblyError> {
        let clamp: Vec<usize> = categories
            .iter()
            .filter(|(_, &cat)| cat == Category::Atlas)
            .map(|(&c, _)| c)
            .collect();
        if clamp.is_empty() {
            return Ok(None);
        }

        let scale = self.cfg.texture_scale(lod);
        let mut inputs = Vec::with_capacity(clamp.len());
        for &c in &clamp {
            let texture = work[c]
                .material
                .texture
                .as_ref()
                .map(|t| atlas::load_texture(t, self.base_dir))
                .transpose()?
                .unwrap_or_else(|| {
                    let d = work[c].material.diffuse;
                    atlas::solid_placeholder(
                        [
                            (d[0] * 255.0) as u8,
                            (d[1] * 255.0) as u8,
                            (d[2] * 255.0) as u8,
                            (d[3] * 255.0) as u8,
                        ],
                        self.cfg.atlas.placeholder_size,
                    )
                });
            let texture = prescale(texture, scale);
            inputs.push((c, texture));
        }

        let packed = atlas::pack(&inputs, &self.cfg.atlas)?;
        let (aw, ah) = packed.image.dimensions();
        for w in work.iter_mut() {
            let Some(&rect) = packed.rect_for(w.canonical) else {
                continue;
            };
            for uv in &mut w.mesh.uvs {
                *uv = atlas::remap_uv(*uv, &rect, aw, ah, self.cfg.atlas.uv_clamp_margin_px);
            }
        }
        Ok(Some(packed))
    }

    /// Step 7: the final material list is the atlas material (when any
    /// clamp textures existed), then each repeat material, then each plain
    /// color. Returns the list and the canonical-id to final-id mapping.
    fn finalize_materials(
        &self,
        work: &[WorkModel<'_>],
        categories: &BTreeMap<usize, Category>,
        atlas: Option<PackedAtlas>,
        lod: u32,
    ) -> Result<(Vec<TileMaterial>, BTreeMap<usize, u32>), AssemblyError> {
        let mut materials = Vec::new();
        let mut final_of_canonical = BTreeMap::new();

        if let Some(packed) = atlas {
            let image = if self.cfg.atlas.photogrammetric {
                atlas::finalize_photogrammetric(packed.image, lod, &self.cfg.atlas)
            } else {
                packed.image
            };
            let id = materials.len() as u32;
            materials.push(TileMaterial {
                diffuse: [1.0; 4],
                texture: Some(Arc::new(image)),
                repeat: false,
            });
            for (&c, &cat) in categories {
                if cat == Category::Atlas {
                    final_of_canonical.insert(c, id);
                }
            }
        }

        for (&c, &cat) in categories {
            if cat != Category::Repeat {
                continue;
            }
            let mat = &work[c].material;
            let texture = mat
                .texture
                .as_ref()
                .map(|t| atlas::load_texture(t, self.base_dir))
                .transpose()?;
            final_of_canonical.insert(c, materials.len() as u32);
            materials.push(TileMaterial {
                diffuse: mat.diffuse,
                texture,
                repeat: true,
            });
        }

        for (&c, &cat) in categories {
            if cat != Category::Color {
                continue;
            }
            final_of_canonical.insert(c, materials.len() as u32);
            materials.push(TileMaterial {
                diffuse: work[c].material.diffuse,
                texture: None,
                repeat: false,
            });
        }

        Ok((materials, final_of_canonical))
    }
}

fn categorize(mat: &MaterialDescriptor) -> Category {
    match (&mat.texture, mat.repeat) {
        (None, _) => Category::Color,
        (Some(_), true) => Category::Repeat,
        (Some(_), false) => Category::Atlas,
    }
}

/// Step 3: quadratic structural dedup. Each material points at the first
/// earlier material it matches; order independence is not required, first
/// occurrence wins.
fn dedup_materials(work: &mut [WorkModel<'_>], tol: f32) {
    for i in 0..work.len() {
        for j in 0..i {
            if work[j].canonical == j && same_material(&work[i].material, &work[j].material, tol) {
                work[i].canonical = j;
                break;
            }
        }
    }
}

fn same_material(a: &MaterialDescriptor, b: &MaterialDescriptor, tol: f32) -> bool {
    if a.repeat != b.repeat {
        return false;
    }
    if (0..4).any(|i| (a.diffuse[i] - b.diffuse[i]).abs() > tol) {
        return false;
    }
    match (&a.texture, &b.texture) {
        (None, None) => true,
        (Some(x), Some(y)) => x.same_as(y),
        _ => false,
    }
}

fn prescale(img: Arc<RgbaImage>, scale: f32) -> Arc<RgbaImage> {
    if scale >= 1.0 {
        return img;
    }
    let (w, h) = img.dimensions();
    let nw = ((w as f32 * scale) as u32).max(1);
    let nh = ((h as f32 * scale) as u32).max(1);
    Arc::new(image::imageops::resize(
        img.as_ref(),
        nw,
        nh,
        image::imageops::FilterType::Triangle,
    ))
}

/// Local tile origin: center of the union bounds of all merged geometry.
fn tile_center(work: &[WorkModel<'_>], node_code: &str) -> Result<[f64; 3], AssemblyError> {
    let mut bounds: Option<crate::types::Aabb> = None;
    for w in work {
        if let Some(b) = w.mesh.bounds() {
            bounds = Some(match bounds {
                Some(prev) => prev.union(&b),
                None => b,
            });
        }
    }
    bounds
        .map(|b| b.center())
        .ok_or_else(|| AssemblyError::EmptyTile(node_code.to_string()))
}

/// Step 6: merge models grouped by final material into 16-bit indexed
/// batches.
///
/// The append offset is one past the highest index used so far, not the
/// vertex count, so sparse index encodings do not inflate the base. Vertex
/// arrays are truncated to that base before appending; unreferenced
/// trailing vertices from the previous model are dropped rather than
/// carried.
fn merge_batches(
    work: &[WorkModel<'_>],
    final_of_canonical: &BTreeMap<usize, u32>,
    rtc_center: [f64; 3],
) -> Vec<GeometryBatch> {
    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (i, w) in work.iter().enumerate() {
        if w.mesh.positions.is_empty() {
            continue;
        }
        let Some(&mat) = final_of_canonical.get(&w.canonical) else {
            continue;
        };
        groups.entry(mat).or_default().push(i);
    }

    let mut batches = Vec::new();
    for (material_id, members) in groups {
        let mut batch = new_batch(material_id);
        for &m in &members {
            let w = &work[m];
            // Index range was validated during prepare.
            let model_max = w.mesh.max_index().unwrap_or(0);

            let base = match batch.max_index() {
                Some(max) => max as u32 + 1,
                None => 0,
            };
            let base = if base + model_max > u16::MAX as u32 {
                batches.push(std::mem::replace(&mut batch, new_batch(material_id)));
                0
            } else {
                base
            };

            append_model(&mut batch, w, base as usize, rtc_center);
        }
        if !batch.indices.is_empty() {
            batches.push(batch);
        }
    }
    batches
}

fn new_batch(material_id: u32) -> GeometryBatch {
    GeometryBatch {
        material_id,
        ..GeometryBatch::default()
    }
}

fn append_model(batch: &mut GeometryBatch, w: &WorkModel<'_>, base: usize, rtc: [f64; 3]) {
    batch.positions.truncate(base);
    batch.normals.truncate(base);
    batch.colors.truncate(base);
    batch.uvs.truncate(base);
    batch.batch_ids.truncate(base);

    let mesh = &w.mesh;
    for (vi, p) in mesh.positions.iter().enumerate() {
        batch.positions.push([
            (p[0] - rtc[0]) as f32,
            (p[1] - rtc[1]) as f32,
            (p[2] - rtc[2]) as f32,
        ]);
        batch
            .normals
            .push(mesh.normals.get(vi).copied().unwrap_or([0.0, 0.0, 1.0]));
        batch
            .colors
            .push(mesh.colors.get(vi).copied().unwrap_or([255; 4]));
        batch.uvs.push(mesh.uvs.get(vi).copied().unwrap_or([0.0; 2]));
        batch.batch_ids.push(w.batch_id);
    }
    for &idx in &mesh.indices {
        batch.indices.push((idx as usize + base) as u16);
    }
}

/// One row per model, ordered by batch id, plus a column per metadata key
/// seen anywhere in the node. Models without a value get JSON null so
/// every column stays row-aligned.
fn batch_table(work: &[WorkModel<'_>]) -> tile3d::BatchTable {
    let mut keys = BTreeSet::new();
    for w in work {
        keys.extend(w.source.metadata.keys().cloned());
    }
    let mut extra: BTreeMap<String, Vec<serde_json::Value>> = keys
        .into_iter()
        .map(|k| (k, Vec::with_capacity(work.len())))
        .collect();
    for w in work {
        for (key, column) in extra.iter_mut() {
            column.push(
                w.source
                    .metadata
                    .get(key)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            );
        }
    }
    tile3d::BatchTable {
        ids: work.iter().map(|w| w.source.id.clone()).collect(),
        files: work.iter().map(|w| w.source.file_name.clone()).collect(),
        nodes: work.iter().map(|w| w.source.node_name.clone()).collect(),
        batch_ids: work.iter().map(|w| w.batch_id as u32).collect(),
        extra,
    }
}
