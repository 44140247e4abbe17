//! mesh2tiles: partition a directory of models into an octree and emit one
//! streamable tile container per populated leaf.
//!
//! The run is two-phase. Partitioning is single threaded and cheap; it
//! only moves item indices around. Per-leaf assembly and serialization is
//! the expensive part and runs on the rayon pool, one job per leaf, with
//! no shared mutable state beyond two counters. A failing leaf is logged
//! and skipped so one bad model cannot sink the whole run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;

use mesh2tiles::assemble::Assembler;
use mesh2tiles::config::{
    AtlasConfig, DistributionMode, OutputKind, PartitionPolicy, RotationFormat, TilerConfig,
};
use mesh2tiles::provider::{ObjDirProvider, SourceModelProvider};
use mesh2tiles::scene::FlatSceneWriter;
use mesh2tiles::serialize::TileWriter;
use mesh2tiles::types::{Aabb, SourceModel};
use mesh2tiles::{error, partition};

#[derive(Parser, Debug)]
#[command(
    name = "mesh2tiles",
    about = "Octree-partition a model directory into streamable 3D tile containers"
)]
struct Args {
    /// Input directory, scanned recursively for OBJ models.
    #[arg(long)]
    input: PathBuf,

    /// Output directory for the tile hierarchy.
    #[arg(long)]
    output: PathBuf,

    /// Container kind to emit.
    #[arg(long, value_enum, default_value_t = OutputKind::Batched)]
    kind: OutputKind,

    /// Maximum octree depth.
    #[arg(long, default_value_t = 8)]
    max_depth: u8,

    /// Stop splitting once a node is thinner than this on any axis.
    #[arg(long, default_value_t = 2.0)]
    min_box_size: f64,

    /// Stop splitting nodes holding fewer items than this.
    #[arg(long, default_value_t = 2)]
    min_items: usize,

    /// Distribute items by representative point instead of bounding box.
    #[arg(long)]
    center_split: bool,

    /// With bounding-box distribution, copy a straddling item into every
    /// overlapping child instead of only the first.
    #[arg(long)]
    shared_items: bool,

    /// Number of LOD tiers to emit per leaf.
    #[arg(long, default_value_t = 1)]
    lods: u32,

    /// Hard atlas size ceiling in pixels.
    #[arg(long, default_value_t = 16384)]
    max_atlas_size: u32,

    /// Enable the photogrammetric atlas post-process.
    #[arg(long)]
    photogrammetric: bool,

    /// UV span slack before a texture counts as repeating.
    #[arg(long, default_value_t = 0.1)]
    repeat_eps: f32,

    /// Instance rotation encoding for i3dm output.
    #[arg(long, value_enum, default_value_t = RotationFormat::Quaternion)]
    rotation_format: RotationFormat,

    /// Store raw float point positions instead of quantized ones.
    #[arg(long)]
    no_quantize: bool,
}

impl Args {
    fn to_config(&self) -> TilerConfig {
        let mode = if self.center_split {
            DistributionMode::Center
        } else {
            DistributionMode::BoundingBox {
                unique: !self.shared_items,
            }
        };
        TilerConfig {
            partition: PartitionPolicy {
                max_depth: self.max_depth,
                min_box_size: self.min_box_size,
                min_item_count: self.min_items,
                mode,
            },
            atlas: AtlasConfig {
                max_atlas_size: self.max_atlas_size,
                photogrammetric: self.photogrammetric,
                ..AtlasConfig::default()
            },
            repeat_eps: self.repeat_eps,
            lod_count: self.lods.max(1),
            output_kind: self.kind,
            rotation_format: self.rotation_format,
            quantize_points: !self.no_quantize,
            ..TilerConfig::default()
        }
    }
}

fn world_bounds(models: &[SourceModel]) -> Option<Aabb> {
    let mut bounds: Option<Aabb> = None;
    for m in models {
        if let Some(b) = m.bounds() {
            bounds = Some(match bounds {
                Some(prev) => prev.union(&b),
                None => b,
            });
        }
    }
    bounds
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let cfg = args.to_config();
    let started = Instant::now();

    let models = ObjDirProvider::new(&args.input)
        .load()
        .with_context(|| format!("loading models from {}", args.input.display()))?;
    if models.is_empty() {
        bail!("no source models found under {}", args.input.display());
    }
    log::info!("loaded {} source models", models.len());

    let volume = world_bounds(&models)
        .ok_or_else(|| anyhow::anyhow!("no model contributed finite geometry"))?;
    let tree = partition::build(volume, &models, &cfg.partition)?;
    let leaves: Vec<(partition::NodeId, String)> = tree
        .leaf_codes()?
        .into_iter()
        .filter(|(id, _)| !tree.node(*id).items().is_empty())
        .collect();
    log::info!(
        "octree: {} nodes, {} populated leaves, depth limit {}",
        tree.len(),
        leaves.len(),
        cfg.partition.max_depth
    );

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating output directory {}", args.output.display()))?;

    let assembler = Assembler::new(&cfg, &args.input);
    let writer = TileWriter::new(&args.output, &cfg);
    let scene = FlatSceneWriter;

    // Fixed before the parallel phase; the workers only increment.
    let written = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    leaves.par_iter().for_each(|(id, code)| {
        let node_models: Vec<&SourceModel> =
            tree.node(*id).items().iter().map(|&i| &models[i]).collect();
        for lod in 0..cfg.lod_count {
            match assembler
                .assemble(code, lod, &node_models)
                .map_err(error::TilerError::from)
                .and_then(|content| {
                    writer
                        .write(&content, &scene)
                        .map_err(error::TilerError::from)
                }) {
                Ok(path) => {
                    written.fetch_add(1, Ordering::Relaxed);
                    log::debug!("wrote {}", path.display());
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("skipping node '{code}' lod {lod}: {e}");
                }
            }
        }
    });

    let written = written.load(Ordering::Relaxed);
    let failed = failed.load(Ordering::Relaxed);
    if written == 0 {
        bail!("all {} populated leaves failed to produce tiles", leaves.len());
    }
    log::info!(
        "wrote {written} tiles ({failed} failed) in {:.2?}",
        started.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_onto_config() {
        let args = Args::parse_from([
            "mesh2tiles",
            "--input",
            "in",
            "--output",
            "out",
            "--kind",
            "points",
            "--max-depth",
            "5",
            "--center-split",
            "--no-quantize",
        ]);
        let cfg = args.to_config();
        assert_eq!(cfg.partition.max_depth, 5);
        assert_eq!(cfg.partition.mode, DistributionMode::Center);
        assert_eq!(cfg.output_kind, OutputKind::Points);
        assert!(!cfg.quantize_points);
    }

    #[test]
    fn bbox_split_defaults_to_unique_ownership() {
        let args = Args::parse_from(["mesh2tiles", "--input", "in", "--output", "out"]);
        let cfg = args.to_config();
        assert_eq!(
            cfg.partition.mode,
            DistributionMode::BoundingBox { unique: true }
        );
    }
}
