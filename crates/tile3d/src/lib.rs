//! tile3d: writer/reader for streamable 3D tile containers.
//!
//! Three container kinds share one little-endian layout:
//!
//!   00  : [u8;4] magic = b"b3dm" | b"i3dm" | b"pnts"
//!   04  : u32    version = 1
//!   08  : u32    byte_length (whole file)
//!   0C  : u32    feature_table_json_byte_length
//!   10  : u32    feature_table_binary_byte_length
//!   14  : u32    batch_table_json_byte_length
//!   18  : u32    batch_table_binary_byte_length
//!   1C  : u32    gltf_format (i3dm only: 0 = external uri, 1 = embedded)
//!   ..  : feature-table JSON (UTF-8, space-padded to an 8-byte multiple)
//!   ..  : feature-table binary (zero-padded to an 8-byte multiple)
//!   ..  : batch-table JSON (space-padded to an 8-byte multiple)
//!   ..  : batch-table binary (zero-padded to an 8-byte multiple)
//!   ..  : embedded scene blob, or the UTF-8 bytes of a scene uri
//!
//! Every header length field equals the actual byte length of its section;
//! each section length is a multiple of 8 so binary sections stay aligned
//! relative to the end of the header. Writes go through a `.part` sibling
//! and a rename, so a file at the final path is always complete.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

pub const CONTAINER_VERSION: u32 = 1;

pub const BATCHED_MAGIC: [u8; 4] = *b"b3dm";
pub const INSTANCED_MAGIC: [u8; 4] = *b"i3dm";
pub const POINTS_MAGIC: [u8; 4] = *b"pnts";

/// The three container kinds. The instanced kind carries one extra header
/// field (`gltf_format`) selecting embedded vs. referenced scene payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Batched,
    Instanced,
    PointCloud,
}

impl ContainerKind {
    #[inline]
    pub fn magic(self) -> [u8; 4] {
        match self {
            ContainerKind::Batched => BATCHED_MAGIC,
            ContainerKind::Instanced => INSTANCED_MAGIC,
            ContainerKind::PointCloud => POINTS_MAGIC,
        }
    }

    #[inline]
    pub fn header_len(self) -> usize {
        match self {
            ContainerKind::Instanced => 32,
            _ => 28,
        }
    }

    #[inline]
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::Batched => "b3dm",
            ContainerKind::Instanced => "i3dm",
            ContainerKind::PointCloud => "pnts",
        }
    }
}

/// Per-model metadata rows: one entry per source model, stored column-wise
/// the way batch tables are laid out. `extra` carries passthrough columns
/// supplied by the source data.
#[derive(Debug, Clone, Default)]
pub struct BatchTable {
    pub ids: Vec<String>,
    pub files: Vec<String>,
    pub nodes: Vec<String>,
    pub batch_ids: Vec<u32>,
    pub extra: BTreeMap<String, Vec<serde_json::Value>>,
}

impl BatchTable {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All columns must agree on the row count.
    pub fn check_columns(&self) -> io::Result<()> {
        let n = self.ids.len();
        if self.files.len() != n || self.nodes.len() != n || self.batch_ids.len() != n {
            return Err(bad("batch table columns disagree on row count"));
        }
        for (name, col) in &self.extra {
            if col.len() != n {
                return Err(bad(&format!("batch table column '{name}' has wrong length")));
            }
        }
        Ok(())
    }

    fn to_json(&self) -> io::Result<serde_json::Value> {
        self.check_columns()?;
        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), serde_json::json!(self.ids));
        obj.insert("file".into(), serde_json::json!(self.files));
        obj.insert("node".into(), serde_json::json!(self.nodes));
        obj.insert("batchId".into(), serde_json::json!(self.batch_ids));
        for (name, col) in &self.extra {
            obj.insert(name.clone(), serde_json::Value::Array(col.clone()));
        }
        Ok(serde_json::Value::Object(obj))
    }
}

/// The trailing payload: an embedded serialized scene, or a reference to a
/// shared scene file.
#[derive(Debug, Clone)]
pub enum ScenePayload {
    Embedded(Vec<u8>),
    External(String),
}

impl ScenePayload {
    fn bytes(&self) -> &[u8] {
        match self {
            ScenePayload::Embedded(b) => b,
            ScenePayload::External(uri) => uri.as_bytes(),
        }
    }

    #[inline]
    fn format_flag(&self) -> u32 {
        match self {
            ScenePayload::External(_) => 0,
            ScenePayload::Embedded(_) => 1,
        }
    }
}

/// Batched tile: merged geometry for many source models plus one metadata
/// row per model.
#[derive(Debug, Clone)]
pub struct BatchedTile {
    pub batch_length: u32,
    /// Local origin subtracted from all positions at assembly time, so the
    /// stored float32 values stay in a precision-safe range.
    pub rtc_center: Option<[f64; 3]>,
    pub batch_table: BatchTable,
    pub scene: ScenePayload,
}

/// Per-instance orientation/scale arrays, one variant per run-level
/// rotation format.
#[derive(Debug, Clone)]
pub enum InstanceRotations {
    /// Legacy encoding: up/right normal triples plus a uniform scale.
    Legacy {
        normals_up: Vec<[f32; 3]>,
        normals_right: Vec<[f32; 3]>,
        scales: Vec<f32>,
    },
    /// Quaternion rotation plus per-axis scale.
    Quaternion {
        rotations: Vec<[f32; 4]>,
        scales: Vec<[f32; 3]>,
    },
}

impl InstanceRotations {
    fn len(&self) -> usize {
        match self {
            InstanceRotations::Legacy { normals_up, .. } => normals_up.len(),
            InstanceRotations::Quaternion { rotations, .. } => rotations.len(),
        }
    }

    fn check(&self, instances: usize) -> io::Result<()> {
        let ok = match self {
            InstanceRotations::Legacy {
                normals_up,
                normals_right,
                scales,
            } => {
                normals_up.len() == instances
                    && normals_right.len() == instances
                    && scales.len() == instances
            }
            InstanceRotations::Quaternion { rotations, scales } => {
                rotations.len() == instances && scales.len() == instances
            }
        };
        if ok {
            Ok(())
        } else {
            Err(bad("instance attribute arrays disagree on instance count"))
        }
    }
}

/// Instanced tile: one shared scene stamped at many transforms.
#[derive(Debug, Clone)]
pub struct InstancedTile {
    pub rtc_center: Option<[f64; 3]>,
    /// Instance positions relative to `rtc_center`.
    pub positions: Vec<[f32; 3]>,
    pub rotations: InstanceRotations,
    pub batch_table: BatchTable,
    pub scene: ScenePayload,
}

/// Point positions, raw or quantized to the tile volume.
///
/// Quantized decode contract: `world = q * scale / 65535 + offset`.
#[derive(Debug, Clone)]
pub enum PointPositions {
    Float(Vec<[f32; 3]>),
    Quantized {
        positions: Vec<[u16; 3]>,
        scale: [f32; 3],
        offset: [f32; 3],
    },
}

impl PointPositions {
    pub fn len(&self) -> usize {
        match self {
            PointPositions::Float(p) => p.len(),
            PointPositions::Quantized { positions, .. } => positions.len(),
        }
    }
}

/// Point-cloud tile.
#[derive(Debug, Clone)]
pub struct PointCloudTile {
    pub rtc_center: Option<[f64; 3]>,
    pub positions: PointPositions,
    pub colors: Option<Vec<[u8; 3]>>,
    pub batch_table: BatchTable,
}

// ---------- slice cursor helpers ----------

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated tile container"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

// ---------- encoding ----------

#[inline]
fn pad_json(mut json: Vec<u8>) -> Vec<u8> {
    while json.len() % 8 != 0 {
        json.push(b' ');
    }
    json
}

#[inline]
fn pad_bin(mut bin: Vec<u8>) -> Vec<u8> {
    while bin.len() % 8 != 0 {
        bin.push(0);
    }
    bin
}

fn json_bytes(value: &serde_json::Value) -> io::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| bad(&format!("feature/batch table JSON: {e}")))
}

/// Assemble header + padded sections + payload into the final byte vector.
fn assemble(
    kind: ContainerKind,
    gltf_format: Option<u32>,
    ft_json: Vec<u8>,
    ft_bin: Vec<u8>,
    bt_json: Vec<u8>,
    bt_bin: Vec<u8>,
    payload: &[u8],
) -> Vec<u8> {
    let ft_json = pad_json(ft_json);
    let ft_bin = pad_bin(ft_bin);
    let bt_json = if bt_json.is_empty() { bt_json } else { pad_json(bt_json) };
    let bt_bin = pad_bin(bt_bin);

    let total = kind.header_len()
        + ft_json.len()
        + ft_bin.len()
        + bt_json.len()
        + bt_bin.len()
        + payload.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&kind.magic());
    out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(ft_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&(ft_bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&(bt_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&(bt_bin.len() as u32).to_le_bytes());
    if let Some(flag) = gltf_format {
        out.extend_from_slice(&flag.to_le_bytes());
    }
    out.extend_from_slice(&ft_json);
    out.extend_from_slice(&ft_bin);
    out.extend_from_slice(&bt_json);
    out.extend_from_slice(&bt_bin);
    out.extend_from_slice(payload);

    debug_assert_eq!(out.len(), total);
    out
}

fn rtc_json(rtc: &Option<[f64; 3]>, obj: &mut serde_json::Map<String, serde_json::Value>) {
    if let Some(c) = rtc {
        obj.insert("RTC_CENTER".into(), serde_json::json!([c[0], c[1], c[2]]));
    }
}

fn batch_table_sections(table: &BatchTable) -> io::Result<Vec<u8>> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    json_bytes(&table.to_json()?)
}

/// Encode a batched tile to its container bytes.
pub fn encode_batched(tile: &BatchedTile) -> io::Result<Vec<u8>> {
    if tile.batch_length as usize != tile.batch_table.len() && !tile.batch_table.is_empty() {
        return Err(bad("BATCH_LENGTH disagrees with batch table row count"));
    }

    let mut ft = serde_json::Map::new();
    ft.insert("BATCH_LENGTH".into(), serde_json::json!(tile.batch_length));
    rtc_json(&tile.rtc_center, &mut ft);

    let ft_json = json_bytes(&serde_json::Value::Object(ft))?;
    let bt_json = batch_table_sections(&tile.batch_table)?;

    Ok(assemble(
        ContainerKind::Batched,
        None,
        ft_json,
        Vec::new(),
        bt_json,
        Vec::new(),
        tile.scene.bytes(),
    ))
}

/// Encode an instanced tile. Instance arrays are packed contiguously in
/// fixed field order: POSITION, then NORMAL_UP/NORMAL_RIGHT/SCALE (legacy)
/// or ROTATION/SCALE_NON_UNIFORM (quaternion).
pub fn encode_instanced(tile: &InstancedTile) -> io::Result<Vec<u8>> {
    let instances = tile.positions.len();
    tile.rotations.check(instances)?;
    if tile.rotations.len() != instances {
        return Err(bad("instance rotation count disagrees with position count"));
    }

    let mut ft = serde_json::Map::new();
    ft.insert("INSTANCES_LENGTH".into(), serde_json::json!(instances as u32));
    rtc_json(&tile.rtc_center, &mut ft);

    let mut bin = Vec::new();
    let mut offset = 0usize;
    let mut field = |name: &str, bytes: &[u8], ft: &mut serde_json::Map<String, serde_json::Value>| {
        ft.insert(name.into(), serde_json::json!({ "byteOffset": offset as u32 }));
        offset += bytes.len();
    };

    let pos_bytes: Vec<u8> = tile
        .positions
        .iter()
        .flat_map(|p| p.iter().flat_map(|v| v.to_le_bytes()))
        .collect();
    field("POSITION", &pos_bytes, &mut ft);
    bin.extend_from_slice(&pos_bytes);

    match &tile.rotations {
        InstanceRotations::Legacy {
            normals_up,
            normals_right,
            scales,
        } => {
            let up: Vec<u8> = normals_up
                .iter()
                .flat_map(|n| n.iter().flat_map(|v| v.to_le_bytes()))
                .collect();
            field("NORMAL_UP", &up, &mut ft);
            bin.extend_from_slice(&up);

            let right: Vec<u8> = normals_right
                .iter()
                .flat_map(|n| n.iter().flat_map(|v| v.to_le_bytes()))
                .collect();
            field("NORMAL_RIGHT", &right, &mut ft);
            bin.extend_from_slice(&right);

            let sc: Vec<u8> = scales.iter().flat_map(|v| v.to_le_bytes()).collect();
            field("SCALE", &sc, &mut ft);
            bin.extend_from_slice(&sc);
        }
        InstanceRotations::Quaternion { rotations, scales } => {
            let rot: Vec<u8> = rotations
                .iter()
                .flat_map(|q| q.iter().flat_map(|v| v.to_le_bytes()))
                .collect();
            field("ROTATION", &rot, &mut ft);
            bin.extend_from_slice(&rot);

            let sc: Vec<u8> = scales
                .iter()
                .flat_map(|s| s.iter().flat_map(|v| v.to_le_bytes()))
                .collect();
            field("SCALE_NON_UNIFORM", &sc, &mut ft);
            bin.extend_from_slice(&sc);
        }
    }

    let ft_json = json_bytes(&serde_json::Value::Object(ft))?;
    let bt_json = batch_table_sections(&tile.batch_table)?;

    Ok(assemble(
        ContainerKind::Instanced,
        Some(tile.scene.format_flag()),
        ft_json,
        bin,
        bt_json,
        Vec::new(),
        tile.scene.bytes(),
    ))
}

/// Encode a point-cloud tile.
pub fn encode_points(tile: &PointCloudTile) -> io::Result<Vec<u8>> {
    let count = tile.positions.len();
    if let Some(colors) = &tile.colors {
        if colors.len() != count {
            return Err(bad("RGB color count disagrees with point count"));
        }
    }

    let mut ft = serde_json::Map::new();
    ft.insert("POINTS_LENGTH".into(), serde_json::json!(count as u32));
    rtc_json(&tile.rtc_center, &mut ft);

    let mut bin = Vec::new();
    let mut offset = 0usize;

    match &tile.positions {
        PointPositions::Float(points) => {
            ft.insert("POSITION".into(), serde_json::json!({ "byteOffset": 0 }));

            #[cfg(target_endian = "little")]
            {
                // [f32; 3] is 12 tightly packed bytes; reinterpret in one go.
                bin.extend_from_slice(bytemuck::cast_slice(points));
            }

            #[cfg(not(target_endian = "little"))]
            for p in points {
                for v in p {
                    bin.extend_from_slice(&v.to_le_bytes());
                }
            }
            offset += count * 12;
        }
        PointPositions::Quantized {
            positions,
            scale,
            offset: vol_offset,
        } => {
            ft.insert("POSITION_QUANTIZED".into(), serde_json::json!({ "byteOffset": 0 }));
            ft.insert(
                "QUANTIZED_VOLUME_SCALE".into(),
                serde_json::json!([scale[0], scale[1], scale[2]]),
            );
            ft.insert(
                "QUANTIZED_VOLUME_OFFSET".into(),
                serde_json::json!([vol_offset[0], vol_offset[1], vol_offset[2]]),
            );
            for p in positions {
                for v in p {
                    bin.extend_from_slice(&v.to_le_bytes());
                }
            }
            offset += count * 6;
        }
    }

    if let Some(colors) = &tile.colors {
        ft.insert("RGB".into(), serde_json::json!({ "byteOffset": offset as u32 }));
        for c in colors {
            bin.extend_from_slice(c);
        }
    }

    let ft_json = json_bytes(&serde_json::Value::Object(ft))?;
    let bt_json = batch_table_sections(&tile.batch_table)?;

    Ok(assemble(
        ContainerKind::PointCloud,
        None,
        ft_json,
        bin,
        bt_json,
        Vec::new(),
        &[],
    ))
}

/// Quantize world positions into the u16 lattice of their bounding volume.
///
/// Returns (quantized triples, scale, offset) such that
/// `world = q * scale / 65535 + offset` recovers each coordinate to within
/// half a lattice step.
pub fn quantize_positions(points: &[[f32; 3]]) -> (Vec<[u16; 3]>, [f32; 3], [f32; 3]) {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for p in points {
        for a in 0..3 {
            min[a] = min[a].min(p[a]);
            max[a] = max[a].max(p[a]);
        }
    }
    if points.is_empty() {
        return (Vec::new(), [1.0; 3], [0.0; 3]);
    }

    let mut scale = [0.0f32; 3];
    for a in 0..3 {
        scale[a] = (max[a] - min[a]).max(f32::EPSILON);
    }

    let quantized = points
        .iter()
        .map(|p| {
            let mut q = [0u16; 3];
            for a in 0..3 {
                let t = ((p[a] - min[a]) / scale[a] * 65535.0).round();
                q[a] = t.clamp(0.0, 65535.0) as u16;
            }
            q
        })
        .collect();

    (quantized, scale, min)
}

// ---------- parsing ----------

/// A parsed container, sections split but otherwise uninterpreted.
#[derive(Debug)]
pub struct ParsedContainer {
    pub kind: ContainerKind,
    pub version: u32,
    pub byte_length: u32,
    pub feature_table: serde_json::Value,
    pub feature_bin: Vec<u8>,
    pub batch_table: Option<serde_json::Value>,
    pub batch_bin: Vec<u8>,
    /// Present only for instanced containers.
    pub gltf_format: Option<u32>,
    pub payload: Vec<u8>,
}

/// Parse a container from a contiguous byte slice. This is the single
/// source of truth for the layout; encoders are tested against it.
pub fn parse_container_bytes(data: &[u8]) -> io::Result<ParsedContainer> {
    let mut p = data;

    let magic = take(&mut p, 4)?;
    let kind = match magic {
        m if m == BATCHED_MAGIC => ContainerKind::Batched,
        m if m == INSTANCED_MAGIC => ContainerKind::Instanced,
        m if m == POINTS_MAGIC => ContainerKind::PointCloud,
        _ => return Err(bad("unrecognized container magic")),
    };

    let version = le_u32(&mut p)?;
    if version != CONTAINER_VERSION {
        return Err(bad("unsupported container version"));
    }

    let byte_length = le_u32(&mut p)?;
    if byte_length as usize != data.len() {
        return Err(bad("header byte_length disagrees with actual length"));
    }

    let ft_json_len = le_u32(&mut p)? as usize;
    let ft_bin_len = le_u32(&mut p)? as usize;
    let bt_json_len = le_u32(&mut p)? as usize;
    let bt_bin_len = le_u32(&mut p)? as usize;

    let gltf_format = if kind == ContainerKind::Instanced {
        Some(le_u32(&mut p)?)
    } else {
        None
    };

    let feature_table = if ft_json_len > 0 {
        let raw = take(&mut p, ft_json_len)?;
        let text = std::str::from_utf8(raw).map_err(|_| bad("feature table JSON is not UTF-8"))?;
        serde_json::from_str(text.trim_end())
            .map_err(|e| bad(&format!("feature table JSON: {e}")))?
    } else {
        serde_json::Value::Object(serde_json::Map::new())
    };

    let feature_bin = take(&mut p, ft_bin_len)?.to_vec();

    let batch_table = if bt_json_len > 0 {
        let raw = take(&mut p, bt_json_len)?;
        let text = std::str::from_utf8(raw).map_err(|_| bad("batch table JSON is not UTF-8"))?;
        Some(
            serde_json::from_str(text.trim_end())
                .map_err(|e| bad(&format!("batch table JSON: {e}")))?,
        )
    } else {
        None
    };

    let batch_bin = take(&mut p, bt_bin_len)?.to_vec();
    let payload = p.to_vec();

    Ok(ParsedContainer {
        kind,
        version,
        byte_length,
        feature_table,
        feature_bin,
        batch_table,
        batch_bin,
        gltf_format,
        payload,
    })
}

pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<ParsedContainer> {
    let bytes = fs::read(path)?;
    parse_container_bytes(&bytes)
}

/// Write container bytes atomically: serialize to a `.part` sibling in the
/// same directory, then rename into place.
pub fn write_file<P: AsRef<Path>>(path: P, bytes: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| bad("tile path has no file name"))?;

    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".part");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, bytes)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch_table(rows: usize) -> BatchTable {
        let mut table = BatchTable::default();
        for i in 0..rows {
            table.ids.push(format!("model-{i}"));
            table.files.push(format!("model_{i}.obj"));
            table.nodes.push(format!("node_{i}"));
            table.batch_ids.push(i as u32);
        }
        table
            .extra
            .insert("height".into(), (0..rows).map(|i| serde_json::json!(i * 10)).collect());
        table
    }

    #[test]
    fn batched_round_trip() {
        let tile = BatchedTile {
            batch_length: 3,
            rtc_center: Some([1.5, -2.5, 1000.25]),
            batch_table: sample_batch_table(3),
            scene: ScenePayload::Embedded(vec![0xAB; 37]),
        };

        let bytes = encode_batched(&tile).unwrap();
        let parsed = parse_container_bytes(&bytes).unwrap();

        assert_eq!(parsed.kind, ContainerKind::Batched);
        assert_eq!(parsed.byte_length as usize, bytes.len());
        assert_eq!(parsed.feature_table["BATCH_LENGTH"], 3);
        assert_eq!(parsed.feature_table["RTC_CENTER"][2], 1000.25);
        assert_eq!(parsed.payload, vec![0xAB; 37]);

        let bt = parsed.batch_table.unwrap();
        assert_eq!(bt["id"].as_array().unwrap().len(), 3);
        assert_eq!(bt["batchId"][1], 1);
        assert_eq!(bt["height"][2], 20);
    }

    #[test]
    fn header_lengths_match_sections() {
        let tile = BatchedTile {
            batch_length: 1,
            rtc_center: None,
            batch_table: sample_batch_table(1),
            scene: ScenePayload::Embedded(vec![1, 2, 3]),
        };
        let bytes = encode_batched(&tile).unwrap();

        let ft_json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let ft_bin_len = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        let bt_json_len = u32::from_le_bytes(bytes[20..24].try_into().unwrap()) as usize;
        let bt_bin_len = u32::from_le_bytes(bytes[24..28].try_into().unwrap()) as usize;

        assert_eq!(ft_json_len % 8, 0);
        assert_eq!(bt_json_len % 8, 0);

        let payload_start = 28 + ft_json_len + ft_bin_len + bt_json_len + bt_bin_len;
        assert_eq!(&bytes[payload_start..], &[1, 2, 3]);

        // JSON padding is spaces, so the section still parses after trim.
        let json = std::str::from_utf8(&bytes[28..28 + ft_json_len]).unwrap();
        assert!(json.ends_with(' ') || json.len() % 8 == 0);
        let _: serde_json::Value = serde_json::from_str(json.trim_end()).unwrap();
    }

    #[test]
    fn instanced_quaternion_layout() {
        let tile = InstancedTile {
            rtc_center: Some([0.0, 0.0, 0.0]),
            positions: vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            rotations: InstanceRotations::Quaternion {
                rotations: vec![[0.0, 0.0, 0.0, 1.0]; 2],
                scales: vec![[1.0, 1.0, 2.0]; 2],
            },
            batch_table: BatchTable::default(),
            scene: ScenePayload::Embedded(vec![9; 8]),
        };

        let bytes = encode_instanced(&tile).unwrap();
        let parsed = parse_container_bytes(&bytes).unwrap();

        assert_eq!(parsed.kind, ContainerKind::Instanced);
        assert_eq!(parsed.gltf_format, Some(1));
        assert_eq!(parsed.feature_table["INSTANCES_LENGTH"], 2);
        assert_eq!(parsed.feature_table["POSITION"]["byteOffset"], 0);
        assert_eq!(parsed.feature_table["ROTATION"]["byteOffset"], 24);
        assert_eq!(parsed.feature_table["SCALE_NON_UNIFORM"]["byteOffset"], 24 + 32);

        // 2 * (12 + 16 + 12) = 80 bytes, already 8-aligned.
        assert_eq!(parsed.feature_bin.len(), 80);

        let x0 = f32::from_le_bytes(parsed.feature_bin[0..4].try_into().unwrap());
        assert_eq!(x0, 1.0);
    }

    #[test]
    fn instanced_legacy_layout() {
        let tile = InstancedTile {
            rtc_center: None,
            positions: vec![[0.0; 3]],
            rotations: InstanceRotations::Legacy {
                normals_up: vec![[0.0, 0.0, 1.0]],
                normals_right: vec![[1.0, 0.0, 0.0]],
                scales: vec![2.0],
            },
            batch_table: BatchTable::default(),
            scene: ScenePayload::External("shared/model.scene".into()),
        };

        let bytes = encode_instanced(&tile).unwrap();
        let parsed = parse_container_bytes(&bytes).unwrap();

        assert_eq!(parsed.gltf_format, Some(0));
        assert_eq!(parsed.feature_table["NORMAL_UP"]["byteOffset"], 12);
        assert_eq!(parsed.feature_table["NORMAL_RIGHT"]["byteOffset"], 24);
        assert_eq!(parsed.feature_table["SCALE"]["byteOffset"], 36);
        assert_eq!(parsed.payload, b"shared/model.scene");
    }

    #[test]
    fn instanced_mismatched_arrays_rejected() {
        let tile = InstancedTile {
            rtc_center: None,
            positions: vec![[0.0; 3]; 2],
            rotations: InstanceRotations::Quaternion {
                rotations: vec![[0.0, 0.0, 0.0, 1.0]],
                scales: vec![[1.0; 3]],
            },
            batch_table: BatchTable::default(),
            scene: ScenePayload::Embedded(Vec::new()),
        };
        assert!(encode_instanced(&tile).is_err());
    }

    #[test]
    fn points_quantized_round_trip() {
        let world = vec![[0.0f32, 0.0, 0.0], [10.0, 20.0, 30.0], [5.0, 5.0, 5.0]];
        let (q, scale, offset) = quantize_positions(&world);

        for (orig, quant) in world.iter().zip(&q) {
            for a in 0..3 {
                let back = quant[a] as f32 * scale[a] / 65535.0 + offset[a];
                let step = scale[a] / 65535.0;
                assert!(
                    (back - orig[a]).abs() <= step,
                    "axis {a}: {back} vs {}",
                    orig[a]
                );
            }
        }

        let tile = PointCloudTile {
            rtc_center: None,
            positions: PointPositions::Quantized {
                positions: q,
                scale,
                offset,
            },
            colors: Some(vec![[255, 0, 0]; 3]),
            batch_table: BatchTable::default(),
        };

        let bytes = encode_points(&tile).unwrap();
        let parsed = parse_container_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, ContainerKind::PointCloud);
        assert_eq!(parsed.feature_table["POINTS_LENGTH"], 3);
        assert_eq!(parsed.feature_table["RGB"]["byteOffset"], 18);
        assert!(parsed.feature_table.get("QUANTIZED_VOLUME_SCALE").is_some());
    }

    #[test]
    fn points_float_layout() {
        let tile = PointCloudTile {
            rtc_center: Some([100.0, 200.0, 300.0]),
            positions: PointPositions::Float(vec![[1.0, 2.0, 3.0]]),
            colors: None,
            batch_table: BatchTable::default(),
        };
        let bytes = encode_points(&tile).unwrap();
        let parsed = parse_container_bytes(&bytes).unwrap();
        assert_eq!(parsed.feature_table["POSITION"]["byteOffset"], 0);
        assert_eq!(parsed.feature_bin.len(), 16); // 12 bytes + zero pad to 8
    }

    #[test]
    fn bad_magic_and_truncation_rejected() {
        assert!(parse_container_bytes(b"nope").is_err());

        let tile = BatchedTile {
            batch_length: 0,
            rtc_center: None,
            batch_table: BatchTable::default(),
            scene: ScenePayload::Embedded(Vec::new()),
        };
        let mut bytes = encode_batched(&tile).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(parse_container_bytes(&bytes).is_err());
    }

    #[test]
    fn write_file_is_atomic_at_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0/2.b3dm");
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        let tile = BatchedTile {
            batch_length: 1,
            rtc_center: None,
            batch_table: sample_batch_table(1),
            scene: ScenePayload::Embedded(vec![7; 16]),
        };
        let bytes = encode_batched(&tile).unwrap();
        write_file(&path, &bytes).unwrap();

        assert_eq!(fs::read(&path).unwrap(), bytes);
        assert!(!path.with_file_name("2.b3dm.part").exists());

        let parsed = read_file(&path).unwrap();
        assert_eq!(parsed.byte_length as usize, bytes.len());
    }
}
