//! Tile container output.
//!
//! Maps assembled tile content onto the configured container kind and
//! writes it under a deterministic path: `<out>/<node code>/<lod>.<ext>`,
//! with the root node's empty code spelled `root`. Directories are created
//! on demand and the encoded length is verified against the header before
//! the write is accepted.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{OutputKind, RotationFormat, TilerConfig};
use crate::error::SerializationError;
use crate::scene::SceneSerializer;
use crate::types::{TileContent, Transform};

pub struct TileWriter<'a> {
    out_dir: &'a Path,
    cfg: &'a TilerConfig,
}

impl<'a> TileWriter<'a> {
    pub fn new(out_dir: &'a Path, cfg: &'a TilerConfig) -> Self {
        Self { out_dir, cfg }
    }

    fn kind(&self) -> tile3d::ContainerKind {
        match self.cfg.output_kind {
            OutputKind::Batched => tile3d::ContainerKind::Batched,
            OutputKind::Instanced => tile3d::ContainerKind::Instanced,
            OutputKind::Points => tile3d::ContainerKind::PointCloud,
        }
    }

    /// Output path for one tile. Deterministic: a given (code, lod, kind)
    /// always maps to the same file.
    pub fn tile_path(&self, node_code: &str, lod: u32) -> PathBuf {
        let dir = if node_code.is_empty() { "root" } else { node_code };
        self.out_dir
            .join(dir)
            .join(format!("{lod}.{}", self.kind().extension()))
    }

    /// Encode `content` and write it to its tile path.
    pub fn write(
        &self,
        content: &TileContent,
        scene: &dyn SceneSerializer,
    ) -> Result<PathBuf, SerializationError> {
        let bytes = self.encode(content, scene)?;
        verify_length(&bytes)?;

        let path = self.tile_path(&content.node_code, content.lod);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tile3d::write_file(&path, &bytes)?;
        Ok(path)
    }

    fn encode(
        &self,
        content: &TileContent,
        scene: &dyn SceneSerializer,
    ) -> Result<Vec<u8>, SerializationError> {
        let bytes = match self.cfg.output_kind {
            OutputKind::Batched => {
                let tile = tile3d::BatchedTile {
                    batch_length: content.table.len() as u32,
                    rtc_center: Some(content.rtc_center),
                    batch_table: content.table.clone(),
                    scene: tile3d::ScenePayload::Embedded(scene.serialize(content)?),
                };
                tile3d::encode_batched(&tile)?
            }
            OutputKind::Instanced => {
                let tile = self.instanced(content, scene)?;
                tile3d::encode_instanced(&tile)?
            }
            OutputKind::Points => {
                let tile = self.points(content);
                tile3d::encode_points(&tile)?
            }
        };
        Ok(bytes)
    }

    /// One instance per batch table row, positioned by its baked transform
    /// relative to the tile center.
    fn instanced(
        &self,
        content: &TileContent,
        scene: &dyn SceneSerializer,
    ) -> Result<tile3d::InstancedTile, SerializationError> {
        let rtc = content.rtc_center;
        let positions: Vec<[f32; 3]> = content
            .transforms
            .iter()
            .map(|t| {
                [
                    (t.translation[0] - rtc[0]) as f32,
                    (t.translation[1] - rtc[1]) as f32,
                    (t.translation[2] - rtc[2]) as f32,
                ]
            })
            .collect();

        let rotations = match self.cfg.rotation_format {
            RotationFormat::Quaternion => tile3d::InstanceRotations::Quaternion {
                rotations: content.transforms.iter().map(|t| t.rotation).collect(),
                scales: content.transforms.iter().map(|t| t.scale).collect(),
            },
            RotationFormat::Legacy => tile3d::InstanceRotations::Legacy {
                normals_up: content
                    .transforms
                    .iter()
                    .map(|t| rotate(t, [0.0, 1.0, 0.0]))
                    .collect(),
                normals_right: content
                    .transforms
                    .iter()
                    .map(|t| rotate(t, [1.0, 0.0, 0.0]))
                    .collect(),
                scales: content.transforms.iter().map(|t| t.scale[0]).collect(),
            },
        };

        Ok(tile3d::InstancedTile {
            rtc_center: Some(rtc),
            positions,
            rotations,
            batch_table: content.table.clone(),
            scene: tile3d::ScenePayload::Embedded(scene.serialize(content)?),
        })
    }

    /// Every merged vertex becomes one point; positions stay relative to
    /// the tile center, which the container carries as RTC_CENTER.
    fn points(&self, content: &TileContent) -> tile3d::PointCloudTile {
        let mut points: Vec<[f32; 3]> = Vec::new();
        let mut colors: Vec<[u8; 3]> = Vec::new();
        for batch in &content.batches {
            points.extend_from_slice(&batch.positions);
            colors.extend(batch.colors.iter().map(|c| [c[0], c[1], c[2]]));
        }

        let positions = if self.cfg.quantize_points && !points.is_empty() {
            let (quantized, scale, offset) = tile3d::quantize_positions(&points);
            tile3d::PointPositions::Quantized {
                positions: quantized,
                scale,
                offset,
            }
        } else {
            tile3d::PointPositions::Float(points)
        };

        tile3d::PointCloudTile {
            rtc_center: Some(content.rtc_center),
            positions,
            colors: Some(colors),
            batch_table: content.table.clone(),
        }
    }
}

/// Quaternion rotation of a unit axis, for the legacy instance encoding.
fn rotate(t: &Transform, v: [f32; 3]) -> [f32; 3] {
    let [qx, qy, qz, qw] = t.rotation;
    // v' = v + 2q x (q x v + w v)
    let cross = |a: [f32; 3], b: [f32; 3]| {
        [
            a[1] * b[2] - a[2] * b[1],
            a[2] * b[0] - a[0] * b[2],
            a[0] * b[1] - a[1] * b[0],
        ]
    };
    let q = [qx, qy, qz];
    let t1 = cross(q, v);
    let t1 = [t1[0] + qw * v[0], t1[1] + qw * v[1], t1[2] + qw * v[2]];
    let t2 = cross(q, t1);
    [
        v[0] + 2.0 * t2[0],
        v[1] + 2.0 * t2[1],
        v[2] + 2.0 * t2[2],
    ]
}

/// The byte length stamped into the header must equal the buffer length.
fn verify_length(bytes: &[u8]) -> Result<(), SerializationError> {
    if bytes.len() < 12 {
        return Err(SerializationError::LengthMismatch {
            header: 0,
            written: bytes.len() as u64,
        });
    }
    let header = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if header as usize != bytes.len() {
        return Err(SerializationError::LengthMismatch {
            header,
            written: bytes.len() as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::FlatSceneWriter;
    use crate::types::{GeometryBatch, TileMaterial};

    fn content(code: &str) -> TileContent {
        TileContent {
            node_code: code.into(),
            lod: 0,
            rtc_center: [100.0, 200.0, 300.0],
            batches: vec![GeometryBatch {
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                normals: vec![[0.0, 0.0, 1.0]; 3],
                colors: vec![[10, 20, 30, 255]; 3],
                uvs: vec![[0.0; 2]; 3],
                batch_ids: vec![0; 3],
                indices: vec![0, 1, 2],
                material_id: 0,
            }],
            materials: vec![TileMaterial {
                diffuse: [1.0; 4],
                texture: None,
                repeat: false,
            }],
            transforms: vec![Transform {
                translation: [101.0, 200.0, 300.0],
                ..Transform::default()
            }],
            table: tile3d::BatchTable {
                ids: vec!["m0".into()],
                files: vec!["m0.obj".into()],
                nodes: vec!["m0".into()],
                batch_ids: vec![0],
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn batched_tile_lands_at_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TilerConfig::default();
        let writer = TileWriter::new(dir.path(), &cfg);
        let path = writer.write(&content("012"), &FlatSceneWriter).unwrap();
        assert_eq!(path, dir.path().join("012").join("0.b3dm"));
        let parsed = tile3d::read_file(&path).unwrap();
        assert_eq!(parsed.kind, tile3d::ContainerKind::Batched);
    }

    #[test]
    fn root_code_is_spelled_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TilerConfig::default();
        let writer = TileWriter::new(dir.path(), &cfg);
        let path = writer.write(&content(""), &FlatSceneWriter).unwrap();
        assert_eq!(path, dir.path().join("root").join("0.b3dm"));
    }

    #[test]
    fn instanced_positions_are_rtc_relative() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TilerConfig {
            output_kind: OutputKind::Instanced,
            ..TilerConfig::default()
        };
        let writer = TileWriter::new(dir.path(), &cfg);
        let tile = writer.instanced(&content("0"), &FlatSceneWriter).unwrap();
        assert_eq!(tile.positions, vec![[1.0, 0.0, 0.0]]);

        let path = writer.write(&content("0"), &FlatSceneWriter).unwrap();
        assert!(path.ends_with("0/0.i3dm"));
    }

    #[test]
    fn legacy_rotation_encodes_axis_normals() {
        let cfg = TilerConfig {
            output_kind: OutputKind::Instanced,
            rotation_format: RotationFormat::Legacy,
            ..TilerConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let writer = TileWriter::new(dir.path(), &cfg);
        let tile = writer.instanced(&content("0"), &FlatSceneWriter).unwrap();
        match tile.rotations {
            tile3d::InstanceRotations::Legacy {
                normals_up,
                normals_right,
                scales,
            } => {
                // Identity rotation keeps the world axes.
                assert_eq!(normals_up, vec![[0.0, 1.0, 0.0]]);
                assert_eq!(normals_right, vec![[1.0, 0.0, 0.0]]);
                assert_eq!(scales, vec![1.0]);
            }
            other => panic!("expected legacy rotations, got {other:?}"),
        }
    }

    #[test]
    fn point_output_quantizes_all_vertices() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TilerConfig {
            output_kind: OutputKind::Points,
            ..TilerConfig::default()
        };
        let writer = TileWriter::new(dir.path(), &cfg);
        let tile = writer.points(&content("7"));
        assert_eq!(tile.positions.len(), 3);
        assert!(matches!(
            tile.positions,
            tile3d::PointPositions::Quantized { .. }
        ));
        assert_eq!(tile.colors.as_ref().map(Vec::len), Some(3));

        let path = writer.write(&content("7"), &FlatSceneWriter).unwrap();
        let parsed = tile3d::read_file(&path).unwrap();
        assert_eq!(parsed.kind, tile3d::ContainerKind::PointCloud);
    }

    #[test]
    fn full_pipeline_from_obj_directory() {
        use crate::assemble::Assembler;
        use crate::partition;
        use crate::provider::{ObjDirProvider, SourceModelProvider};
        use crate::types::Aabb;
        use std::io::Write as _;

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        // Two well-separated colored triangles so the octree splits.
        let obj = "\
o near
v 0 0 0
v 1 0 0
v 0 1 0
f 1 2 3
o far
v 100 100 100
v 101 100 100
v 100 101 100
f 4 5 6
";
        std::fs::File::create(input.path().join("scene.obj"))
            .unwrap()
            .write_all(obj.as_bytes())
            .unwrap();

        let cfg = TilerConfig::default();
        let models = ObjDirProvider::new(input.path()).load().unwrap();
        assert_eq!(models.len(), 2);

        let bounds = models
            .iter()
            .filter_map(|m| m.bounds())
            .reduce(|a, b| a.union(&b))
            .unwrap();
        let volume = Aabb::new(bounds.min, bounds.max);
        let tree = partition::build(volume, &models, &cfg.partition).unwrap();

        let assembler = Assembler::new(&cfg, input.path());
        let writer = TileWriter::new(output.path(), &cfg);
        let mut written = 0;
        for (id, code) in tree.leaf_codes().unwrap() {
            let node_models: Vec<_> =
                tree.node(id).items().iter().map(|&i| &models[i]).collect();
            if node_models.is_empty() {
                continue;
            }
            let content = assembler.assemble(&code, 0, &node_models).unwrap();
            let path = writer.write(&content, &FlatSceneWriter).unwrap();

            let bytes = std::fs::read(&path).unwrap();
            let parsed = tile3d::parse_container_bytes(&bytes).unwrap();
            assert_eq!(parsed.kind, tile3d::ContainerKind::Batched);
            assert_eq!(parsed.byte_length as usize, bytes.len());
            let table = parsed.batch_table.unwrap();
            assert_eq!(
                table["id"].as_array().unwrap().len(),
                node_models.len()
            );
            written += 1;
        }
        assert!(written >= 1);
    }

    #[test]
    fn header_length_mismatch_is_detected() {
        assert!(verify_length(&[0u8; 4]).is_err());
        let mut bytes = vec![0u8; 28];
        bytes[8..12].copy_from_slice(&28u32.to_le_bytes());
        assert!(verify_length(&bytes).is_ok());
        bytes[8..12].copy_from_slice(&27u32.to_le_bytes());
        assert!(matches!(
            verify_length(&bytes),
            Err(SerializationError::LengthMismatch {
                header: 27,
                written: 28
            })
        ));
    }
}
