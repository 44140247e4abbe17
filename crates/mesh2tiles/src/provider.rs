//! Source model acquisition.
//!
//! `SourceModelProvider` is the seam between the tiling pipeline and
//! whatever produces input geometry. The built-in `ObjDirProvider` walks a
//! directory for Wavefront OBJ files and yields one `SourceModel` per
//! object-and-material group, with vertices already in world space.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::types::{MaterialDescriptor, MeshData, SourceModel, TextureSource, Transform};

pub trait SourceModelProvider {
    /// Load every source model. Called once, before partitioning.
    fn load(&self) -> Result<Vec<SourceModel>>;
}

/// Recursively scans a directory for `.obj` files.
pub struct ObjDirProvider {
    root: PathBuf,
}

impl ObjDirProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SourceModelProvider for ObjDirProvider {
    fn load(&self) -> Result<Vec<SourceModel>> {
        let mut models = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("obj"))
                != Some(true)
            {
                continue;
            }
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed = parse_obj(&text, path)
                .with_context(|| format!("parsing {}", path.display()))?;
            models.extend(parsed);
        }
        Ok(models)
    }
}

#[derive(Debug, Clone, Default)]
struct ObjMaterial {
    diffuse: [f32; 4],
    map_kd: Option<PathBuf>,
}

/// Minimal MTL reader: `newmtl`, `Kd`, `d`/`Tr`, `map_Kd`. Unknown
/// statements are skipped.
fn parse_mtl(text: &str, dir: &Path) -> HashMap<String, ObjMaterial> {
    let mut out = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        let mut it = line.split_whitespace();
        match it.next() {
            Some("newmtl") => {
                if let Some(name) = it.next() {
                    out.insert(
                        name.to_string(),
                        ObjMaterial {
                            diffuse: [1.0, 1.0, 1.0, 1.0],
                            map_kd: None,
                        },
                    );
                    current = Some(name.to_string());
                }
            }
            Some("Kd") => {
                if let Some(mat) = current.as_ref().and_then(|n| out.get_mut(n)) {
                    for (i, tok) in it.take(3).enumerate() {
                        if let Ok(v) = tok.parse::<f32>() {
                            mat.diffuse[i] = v;
                        }
                    }
                }
            }
            Some("d") => {
                if let Some(mat) = current.as_ref().and_then(|n| out.get_mut(n)) {
                    if let Some(v) = it.next().and_then(|t| t.parse::<f32>().ok()) {
                        mat.diffuse[3] = v;
                    }
                }
            }
            Some("Tr") => {
                if let Some(mat) = current.as_ref().and_then(|n| out.get_mut(n)) {
                    if let Some(v) = it.next().and_then(|t| t.parse::<f32>().ok()) {
                        mat.diffuse[3] = 1.0 - v;
                    }
                }
            }
            Some("map_Kd") => {
                if let Some(mat) = current.as_ref().and_then(|n| out.get_mut(n)) {
                    // The texture path is the rest of the line; it may
                    // contain spaces.
                    let rest = line["map_Kd".len()..].trim();
                    if !rest.is_empty() {
                        mat.map_kd = Some(dir.join(rest));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn parse_index(tok: &str, len: usize) -> Option<usize> {
    let v: i64 = tok.parse().ok()?;
    // OBJ indices are 1-based; negative counts from the end.
    let idx = if v < 0 { len as i64 + v } else { v - 1 };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}

#[derive(Default)]
struct GroupBuilder {
    mesh: MeshData,
    // (position, uv, normal) source triple to local vertex.
    local: HashMap<(usize, usize, usize), u32>,
}

impl GroupBuilder {
    fn vertex(
        &mut self,
        key: (usize, usize, usize),
        positions: &[[f64; 3]],
        uvs: &[[f32; 2]],
        normals: &[[f32; 3]],
    ) -> u32 {
        if let Some(&v) = self.local.get(&key) {
            return v;
        }
        let v = self.mesh.positions.len() as u32;
        self.mesh.positions.push(positions[key.0]);
        if key.1 != usize::MAX {
            self.mesh.uvs.push(uvs[key.1]);
        }
        if key.2 != usize::MAX {
            self.mesh.normals.push(normals[key.2]);
        }
        self.local.insert(key, v);
        v
    }
}

/// Parse one OBJ file into per-(object, material) source models.
fn parse_obj(text: &str, path: &Path) -> Result<Vec<SourceModel>> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed.obj")
        .to_string();

    let mut positions: Vec<[f64; 3]> = Vec::new();
    let mut uvs: Vec<[f32; 2]> = Vec::new();
    let mut normals: Vec<[f32; 3]> = Vec::new();
    let mut materials: HashMap<String, ObjMaterial> = HashMap::new();

    let mut object = "default".to_string();
    let mut material = String::new();
    // Keyed by (object, material) so interleaved usemtl statements reopen
    // the same group instead of splitting it.
    let mut groups: BTreeMap<(String, String), GroupBuilder> = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        let mut it = line.split_whitespace();
        match it.next() {
            Some("v") => {
                let mut p = [0.0f64; 3];
                for (i, tok) in it.take(3).enumerate() {
                    p[i] = tok.parse().with_context(|| format!("bad vertex: {line}"))?;
                }
                positions.push(p);
            }
            Some("vt") => {
                let mut t = [0.0f32; 2];
                for (i, tok) in it.take(2).enumerate() {
                    t[i] = tok.parse().with_context(|| format!("bad uv: {line}"))?;
                }
                // OBJ v runs bottom-up, image rows top-down.
                t[1] = 1.0 - t[1];
                uvs.push(t);
            }
            Some("vn") => {
                let mut n = [0.0f32; 3];
                for (i, tok) in it.take(3).enumerate() {
                    n[i] = tok.parse().with_context(|| format!("bad normal: {line}"))?;
                }
                normals.push(n);
            }
            Some("o") | Some("g") => {
                object = it.next().unwrap_or("default").to_string();
            }
            Some("usemtl") => {
                material = it.next().unwrap_or("").to_string();
            }
            Some("mtllib") => {
                let rest = line["mtllib".len()..].trim();
                if !rest.is_empty() {
                    let mtl_path = dir.join(rest);
                    if let Ok(mtl_text) = fs::read_to_string(&mtl_path) {
                        materials.extend(parse_mtl(&mtl_text, dir));
                    } else {
                        log::warn!("material library not found: {}", mtl_path.display());
                    }
                }
            }
            Some("f") => {
                let mut corners: Vec<(usize, usize, usize)> = Vec::new();
                for tok in it {
                    let mut parts = tok.split('/');
                    let Some(p) = parts.next().and_then(|t| parse_index(t, positions.len()))
                    else {
                        anyhow::bail!("face references missing vertex: {line}");
                    };
                    let t = parts
                        .next()
                        .filter(|t| !t.is_empty())
                        .and_then(|t| parse_index(t, uvs.len()))
                        .unwrap_or(usize::MAX);
                    let n = parts
                        .next()
                        .filter(|t| !t.is_empty())
                        .and_then(|t| parse_index(t, normals.len()))
                        .unwrap_or(usize::MAX);
                    corners.push((p, t, n));
                }
                if corners.len() < 3 {
                    continue;
                }
                let group = groups
                    .entry((object.clone(), material.clone()))
                    .or_default();
                // Fan triangulation of polygons.
                for i in 1..corners.len() - 1 {
                    for &key in &[corners[0], corners[i], corners[i + 1]] {
                        let v = group.vertex(key, &positions, &uvs, &normals);
                        group.mesh.indices.push(v);
                    }
                }
            }
            _ => {}
        }
    }

    let mut models = Vec::new();
    for ((object, mat_name), group) in groups {
        if group.mesh.positions.is_empty() {
            continue;
        }
        let obj_mat = materials.get(&mat_name).cloned().unwrap_or(ObjMaterial {
            diffuse: [1.0, 1.0, 1.0, 1.0],
            map_kd: None,
        });
        let descriptor = MaterialDescriptor {
            id: 0,
            diffuse: obj_mat.diffuse,
            texture: obj_mat.map_kd.map(TextureSource::Path),
            repeat: false,
        };
        models.push(SourceModel {
            id: format!("{file_name}#{object}#{mat_name}"),
            file_name: file_name.clone(),
            node_name: object,
            mesh: group.mesh,
            material: descriptor,
            transform: Transform::default(),
            metadata: Default::default(),
        });
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CUBE_FACE: &str = "\
mtllib cube.mtl
o cube
usemtl stone
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

    const CUBE_MTL: &str = "\
newmtl stone
Kd 0.6 0.5 0.4
map_Kd stone.png
";

    #[test]
    fn quad_is_fan_triangulated_with_shared_vertices() {
        let models = parse_obj(CUBE_FACE, Path::new("cube.obj")).unwrap();
        assert_eq!(models.len(), 1);
        let m = &models[0];
        assert_eq!(m.node_name, "cube");
        assert_eq!(m.mesh.positions.len(), 4);
        assert_eq!(m.mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(m.mesh.uvs.len(), 4);
        // vt is flipped vertically.
        assert_eq!(m.mesh.uvs[0], [0.0, 1.0]);
    }

    #[test]
    fn negative_indices_resolve_from_the_end() {
        let obj = "\
v 0 0 0
v 1 0 0
v 0 1 0
f -3 -2 -1
";
        let models = parse_obj(obj, Path::new("t.obj")).unwrap();
        assert_eq!(models[0].mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn face_with_missing_vertex_is_an_error() {
        let obj = "v 0 0 0\nf 1 2 3\n";
        assert!(parse_obj(obj, Path::new("t.obj")).is_err());
    }

    #[test]
    fn materials_split_objects_into_separate_models() {
        let obj = "\
o walls
usemtl a
v 0 0 0
v 1 0 0
v 0 1 0
f 1 2 3
usemtl b
v 2 0 0
v 3 0 0
v 2 1 0
f 4 5 6
";
        let models = parse_obj(obj, Path::new("t.obj")).unwrap();
        assert_eq!(models.len(), 2);
        assert!(models.iter().any(|m| m.id.ends_with("#walls#a")));
        assert!(models.iter().any(|m| m.id.ends_with("#walls#b")));
    }

    #[test]
    fn mtl_diffuse_and_texture_are_attached() {
        let dir = tempfile::tempdir().unwrap();
        let obj_path = dir.path().join("cube.obj");
        std::fs::File::create(&obj_path)
            .unwrap()
            .write_all(CUBE_FACE.as_bytes())
            .unwrap();
        std::fs::File::create(dir.path().join("cube.mtl"))
            .unwrap()
            .write_all(CUBE_MTL.as_bytes())
            .unwrap();

        let models = ObjDirProvider::new(dir.path()).load().unwrap();
        assert_eq!(models.len(), 1);
        let mat = &models[0].material;
        assert!((mat.diffuse[0] - 0.6).abs() < 1e-6);
        match &mat.texture {
            Some(TextureSource::Path(p)) => {
                assert!(p.ends_with("stone.png"));
            }
            other => panic!("expected texture path, got {other:?}"),
        }
    }
}
