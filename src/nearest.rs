//! Accelerated histogram-color → palette-entry lookup.

use crate::color::{color_difference, FPixel};
use crate::palette::Colormap;

pub(crate) type PalIndex = u8;

/// Nearest-palette-entry search under the weighted perceptual metric.
///
/// `search` returns the index minimizing `color_difference(px, entry)` and
/// that squared distance. Nearly-transparent queries short-circuit to the
/// transparent slot (the entry with the smallest alpha); `min_opaque` scales
/// the boundary of that decision.
pub(crate) trait NearestLookup: Send + Sync {
    fn search(&self, px: FPixel, min_opaque: f32) -> (PalIndex, f32);
}

/// Pick a backend for the palette: brute force below 16 entries, a
/// vantage-point tree above.
pub(crate) fn nearest_for(map: &Colormap) -> Box<dyn NearestLookup> {
    if map.len() < 16 {
        Box::new(LinearNearest::new(map))
    } else {
        Box::new(VpTree::new(map))
    }
}

fn palette_colors(map: &Colormap) -> Vec<FPixel> {
    map.entries().iter().map(|e| e.color).collect()
}

/// Index of the entry with minimum alpha; first entry wins ties.
fn transparent_slot(colors: &[FPixel]) -> PalIndex {
    let mut best = 0usize;
    for (i, c) in colors.iter().enumerate() {
        if c.a < colors[best].a {
            best = i;
        }
    }
    best as PalIndex
}

struct LinearNearest {
    colors: Vec<FPixel>,
    transparent: PalIndex,
}

impl LinearNearest {
    fn new(map: &Colormap) -> Self {
        let colors = palette_colors(map);
        let transparent = transparent_slot(&colors);
        Self {
            colors,
            transparent,
        }
    }
}

impl NearestLookup for LinearNearest {
    fn search(&self, px: FPixel, min_opaque: f32) -> (PalIndex, f32) {
        if px.a < min_opaque / 256.0 {
            let t = self.transparent as usize;
            return (self.transparent, color_difference(px, self.colors[t]));
        }

        let mut best = 0;
        let mut best_diff = f32::MAX;
        for (i, &c) in self.colors.iter().enumerate() {
            let d = color_difference(px, c);
            if d < best_diff {
                best_diff = d;
                best = i;
            }
        }
        (best as PalIndex, best_diff)
    }
}

/// Vantage-point tree over the palette.
///
/// Built on the symmetric distance `E = sqrt(ΔRGB² + 4Δa²)`, while queries
/// are answered under the asymmetric weighted metric
/// `d² = a_p·ΔRGB² + 4Δa²`. Pruning stays exact through two subtree bounds
/// (`m` = minimum alpha in the subtree, `lb` = triangle-inequality bound on E):
///
/// * `d² ≥ a_p·E² ≥ m·lb²`
/// * `d² = E² − (1−a_p)·ΔRGB² ≥ lb² − 3·(1−m)`
struct VpTree {
    colors: Vec<FPixel>,
    transparent: PalIndex,
    root: Option<Box<Node>>,
}

struct Node {
    index: PalIndex,
    color: FPixel,
    /// Symmetric distance separating the inner subtree from the outer one.
    radius: f32,
    /// Minimum alpha over this node and all descendants.
    min_alpha: f32,
    inner: Option<Box<Node>>,
    outer: Option<Box<Node>>,
}

fn sym_distance(p1: FPixel, p2: FPixel) -> f32 {
    let dr = p1.r - p2.r;
    let dg = p1.g - p2.g;
    let db = p1.b - p2.b;
    let da = p1.a - p2.a;
    (dr * dr + dg * dg + db * db + 4.0 * da * da).sqrt()
}

impl VpTree {
    fn new(map: &Colormap) -> Self {
        let colors = palette_colors(map);
        let transparent = transparent_slot(&colors);
        let entries: Vec<(PalIndex, FPixel)> = colors
            .iter()
            .enumerate()
            .map(|(i, &c)| (i as PalIndex, c))
            .collect();
        Self {
            root: build(entries),
            colors,
            transparent,
        }
    }
}

fn build(mut entries: Vec<(PalIndex, FPixel)>) -> Option<Box<Node>> {
    let (index, color) = match entries.len() {
        0 => return None,
        _ => entries.swap_remove(0),
    };

    let (radius, inner, outer) = if entries.is_empty() {
        (0.0, None, None)
    } else {
        let mid = (entries.len() - 1) / 2;
        entries.select_nth_unstable_by(mid, |a, b| {
            sym_distance(color, a.1).total_cmp(&sym_distance(color, b.1))
        });
        let radius = sym_distance(color, entries[mid].1);
        let outer_part = entries.split_off(mid + 1);
        (radius, build(entries), build(outer_part))
    };

    let mut min_alpha = color.a;
    if let Some(n) = &inner {
        min_alpha = min_alpha.min(n.min_alpha);
    }
    if let Some(n) = &outer {
        min_alpha = min_alpha.min(n.min_alpha);
    }

    Some(Box::new(Node {
        index,
        color,
        radius,
        min_alpha,
        inner,
        outer,
    }))
}

fn visit(node: &Node, px: FPixel, best: &mut (PalIndex, f32)) {
    let d = color_difference(px, node.color);
    if d < best.1 {
        *best = (node.index, d);
    }

    let ev = sym_distance(px, node.color);
    let inner_bound = (ev - node.radius).max(0.0);
    let outer_bound = (node.radius - ev).max(0.0);

    let children = if ev <= node.radius {
        [(&node.inner, inner_bound), (&node.outer, outer_bound)]
    } else {
        [(&node.outer, outer_bound), (&node.inner, inner_bound)]
    };

    for (child, bound) in children {
        if let Some(child) = child {
            let m = child.min_alpha;
            let lb2 = bound * bound;
            let lower = (m * lb2).max(lb2 - 3.0 * (1.0 - m));
            if lower < best.1 {
                visit(child, px, best);
            }
        }
    }
}

impl NearestLookup for VpTree {
    fn search(&self, px: FPixel, min_opaque: f32) -> (PalIndex, f32) {
        if px.a < min_opaque / 256.0 {
            let t = self.transparent as usize;
            return (self.transparent, color_difference(px, self.colors[t]));
        }

        let mut best = (0, f32::MAX);
        if let Some(root) = &self.root {
            visit(root, px, &mut best);
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::MapEntry;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn map_of(colors: Vec<FPixel>) -> Colormap {
        let mut map = Colormap::new();
        for color in colors {
            map.push(MapEntry {
                color,
                popularity: 1.0,
                fixed: false,
            });
        }
        map
    }

    fn random_palette(rng: &mut SmallRng, n: usize, with_alpha: bool) -> Colormap {
        map_of(
            (0..n)
                .map(|_| {
                    let a = if with_alpha && rng.gen_bool(0.3) {
                        rng.gen::<f32>()
                    } else {
                        1.0
                    };
                    FPixel::new(rng.gen(), rng.gen(), rng.gen(), a)
                })
                .collect(),
        )
    }

    #[test]
    fn tree_matches_linear_scan() {
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        for &with_alpha in &[false, true] {
            let map = random_palette(&mut rng, 64, with_alpha);
            let linear = LinearNearest::new(&map);
            let tree = VpTree::new(&map);

            for _ in 0..500 {
                let q = FPixel::new(rng.gen(), rng.gen(), rng.gen(), rng.gen());
                let (_, d_lin) = linear.search(q, 1.0);
                let (ti, d_tree) = tree.search(q, 1.0);
                assert!(
                    (d_lin - d_tree).abs() < 1e-6,
                    "tree {d_tree} vs linear {d_lin} for {q:?}"
                );
                assert!((color_difference(q, map.entries()[ti as usize].color) - d_tree).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn transparent_query_takes_minimum_alpha_slot() {
        let map = map_of(vec![
            FPixel::new(0.5, 0.5, 0.5, 1.0),
            FPixel::new(0.0, 0.0, 0.0, 0.0),
            FPixel::new(1.0, 1.0, 1.0, 0.5),
        ]);
        let n = nearest_for(&map);
        let (idx, _) = n.search(FPixel::new(0.9, 0.9, 0.9, 0.0), 1.0);
        assert_eq!(idx, 1);
    }

    #[test]
    fn opaque_query_finds_closest_entry() {
        let map = map_of(vec![
            FPixel::new(0.1, 0.1, 0.1, 1.0),
            FPixel::new(0.5, 0.5, 0.5, 1.0),
            FPixel::new(0.9, 0.9, 0.9, 1.0),
        ]);
        let n = nearest_for(&map);
        let (idx, d) = n.search(FPixel::new(0.48, 0.5, 0.52, 1.0), 1.0);
        assert_eq!(idx, 1);
        assert!(d < 0.01);
    }

    #[test]
    fn backend_switches_at_sixteen_entries(){
        let mut rng = SmallRng::seed_from_u64(7);
        let small = random_palette(&mut rng, 15, true);
        let large = random_palette(&mut rng, 16, true);
        // Both backends must agree with brute force regardless of size.
        for map in [small, large] {
            let n = nearest_for(&map);
            let linear = LinearNearest::new(&map);
            for _ in 0..100 {
                let q = FPixel::new(rng.gen(), rng.gen(), rng.gen(), 1.0);
                assert!((n.search(q, 1.0).1 - linear.search(q, 1.0).1).abs() < 1e-6);
            }
        }
    }
}
