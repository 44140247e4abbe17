//! Greedy texture atlas packing and UV remapping.
//!
//! Rectangles are placed largest-first. The first goes to the origin; each
//! later one is tried at two candidate anchors per already-placed rectangle
//! (its lower-right and upper-left corners), and the anchor that keeps the
//! running union bounding box smallest, by perimeter, wins. Simple and
//! deterministic; near-square results in practice.

use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};

use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::types::TextureSource;

/// Placement of one input image inside the atlas, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl AtlasRect {
    fn right(&self) -> u32 {
        self.x + self.w
    }

    fn top(&self) -> u32 {
        self.y + self.h
    }

    fn overlaps(&self, other: &AtlasRect, tol: f32) -> bool {
        (self.x as f32) < other.right() as f32 - tol
            && self.right() as f32 > other.x as f32 + tol
            && (self.y as f32) < other.top() as f32 - tol
            && self.top() as f32 > other.y as f32 + tol
    }
}

/// Finished atlas: composited image plus one rectangle per input, keyed by
/// the caller's index.
#[derive(Debug)]
pub struct PackedAtlas {
    pub image: RgbaImage,
    pub rects: Vec<(usize, AtlasRect)>,
}

impl PackedAtlas {
    pub fn rect_for(&self, key: usize) -> Option<&AtlasRect> {
        self.rects.iter().find(|(k, _)| *k == key).map(|(_, r)| r)
    }
}

fn union_perimeter(placed: &[AtlasRect], candidate: &AtlasRect) -> u64 {
    let mut w = candidate.right() as u64;
    let mut h = candidate.top() as u64;
    for r in placed {
        w = w.max(r.right() as u64);
        h = h.max(r.top() as u64);
    }
    2 * (w + h)
}

/// Pack `inputs` into one atlas. Keys are returned untouched so the caller
/// can map rectangles back to materials.
pub fn pack(
    inputs: &[(usize, Arc<RgbaImage>)],
    cfg: &AtlasConfig,
) -> Result<PackedAtlas, AtlasError> {
    if inputs.is_empty() {
        return Err(AtlasError::NoInputs);
    }

    let mut order: Vec<usize> = (0..inputs.len()).collect();
    order.sort_by_key(|&i| {
        let (w, h) = inputs[i].1.dimensions();
        std::cmp::Reverse(w as u64 * h as u64)
    });

    let mut placed: Vec<AtlasRect> = Vec::with_capacity(inputs.len());
    let mut rects: Vec<(usize, AtlasRect)> = Vec::with_capacity(inputs.len());
    for &i in &order {
        let (key, img) = &inputs[i];
        let (w, h) = img.dimensions();
        let rect = if placed.is_empty() {
            AtlasRect { x: 0, y: 0, w, h }
        } else {
            place(&placed, w, h, cfg.overlap_tolerance)
        };
        placed.push(rect);
        rects.push((*key, rect));
    }

    let atlas_w = placed.iter().map(AtlasRect::right).max().unwrap_or(0);
    let atlas_h = placed.iter().map(AtlasRect::top).max().unwrap_or(0);
    if atlas_w > cfg.max_atlas_size || atlas_h > cfg.max_atlas_size {
        return Err(AtlasError::Oversize {
            width: atlas_w,
            height: atlas_h,
            max: cfg.max_atlas_size,
        });
    }

    let mut image = RgbaImage::new(atlas_w, atlas_h);
    for (slot, &input_i) in order.iter().enumerate() {
        let rect = rects[slot].1;
        image::imageops::overlay(
            &mut image,
            inputs[input_i].1.as_ref(),
            rect.x as i64,
            rect.y as i64,
        );
    }

    Ok(PackedAtlas { image, rects })
}

fn place(placed: &[AtlasRect], w: u32, h: u32, tol: f32) -> AtlasRect {
    let mut best: Option<(u64, AtlasRect)> = None;
    for anchor_of in placed {
        // Lower-right and upper-left corners of each placed rectangle.
        let anchors = [(anchor_of.right(), anchor_of.y), (anchor_of.x, anchor_of.top())];
        for (x, y) in anchors {
            let cand = AtlasRect { x, y, w, h };
            if placed.iter().any(|r| cand.overlaps(r, tol)) {
                continue;
            }
            let score = union_perimeter(placed, &cand);
            let better = match best {
                Some((s, _)) => score < s,
                None => true,
            };
            if better {
                best = Some((score, cand));
            }
        }
    }
    match best {
        Some((_, rect)) => rect,
        // All anchors collide; open a fresh column to the right.
        None => {
            let x = placed.iter().map(AtlasRect::right).max().unwrap_or(0);
            AtlasRect { x, y: 0, w, h }
        }
    }
}

/// Wrap a UV coordinate into the unit interval, keeping an exact 1.0 as
/// 1.0 rather than collapsing it to 0.
fn wrap_unit(v: f32) -> f32 {
    if v == 1.0 {
        return 1.0;
    }
    v - v.floor()
}

/// Remap one UV pair from a packed image's own space into atlas space.
///
/// The coordinate is wrapped into [0,1], clamped in by `margin_px` pixels
/// per axis so bilinear samples stay inside the cell, then scaled and
/// offset by the rectangle.
pub fn remap_uv(
    uv: [f32; 2],
    rect: &AtlasRect,
    atlas_w: u32,
    atlas_h: u32,
    margin_px: f32,
) -> [f32; 2] {
    let remap = |v: f32, cell: u32, atlas: u32, origin: u32| -> f32 {
        // A cell narrower than two margins would invert the clamp range.
        let margin = if cell > 0 {
            (margin_px / cell as f32).min(0.5)
        } else {
            0.0
        };
        let v = wrap_unit(v).clamp(margin, 1.0 - margin);
        (origin as f32 + v * cell as f32) / atlas as f32
    };
    [
        remap(uv[0], rect.w, atlas_w, rect.x),
        remap(uv[1], rect.h, atlas_h, rect.y),
    ]
}

/// Resolve a texture source to pixels. Path sources are decoded from disk
/// relative to `base`; in-memory sources are passed through.
pub fn load_texture(source: &TextureSource, base: &Path) -> Result<Arc<RgbaImage>, AtlasError> {
    match source {
        TextureSource::Image(img) => Ok(Arc::clone(img)),
        TextureSource::Path(path) => {
            let full = if path.is_absolute() {
                path.clone()
            } else {
                base.join(path)
            };
            let img = image::open(&full)
                .map_err(|source| AtlasError::MissingImage {
                    path: full,
                    source,
                })?
                .to_rgba8();
            Ok(Arc::new(img))
        }
    }
}

/// Uniform stand-in texture for a material that should carry pixels but
/// whose image could not be used directly.
pub fn solid_placeholder(color: [u8; 4], size: u32) -> Arc<RgbaImage> {
    Arc::new(RgbaImage::from_pixel(size, size, Rgba(color)))
}

/// Photogrammetric cleanup: replace sentinel-colored pixels (capture
/// artifacts at mesh borders) with a neutral fill, then cap the atlas size
/// for the given LOD tier, never shrinking below `min_size`.
pub fn finalize_photogrammetric(image: RgbaImage, lod: u32, cfg: &AtlasConfig) -> RgbaImage {
    let sentinel = Rgba(cfg.sentinel_color);
    let neutral = Rgba(cfg.neutral_fill);
    let mut image = image;
    for px in image.pixels_mut() {
        if *px == sentinel {
            *px = neutral;
        }
    }

    let cap = if lod == 0 { cfg.lod0_max_size } else { cfg.lod_max_size };
    let cap = cap.max(cfg.min_size);
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest > cap {
        let scale = cap as f64 / longest as f64;
        let nw = ((w as f64 * scale).round() as u32).max(cfg.min_size.min(w));
        let nh = ((h as f64 * scale).round() as u32).max(cfg.min_size.min(h));
        image = image::imageops::resize(&image, nw, nh, FilterType::Triangle);
    }
    image
}
