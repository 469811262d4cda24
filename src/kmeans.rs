//! Voronoi (k-means) palette refinement over histogram entries.

use rayon::prelude::*;

use crate::color::FPixel;
use crate::histogram::Histogram;
use crate::nearest::{nearest_for, PalIndex};
use crate::palette::Colormap;

/// Entries per parallel work unit. Fixed so the merge order (and therefore
/// every floating-point sum) is identical at any thread-pool width.
const CHUNK: usize = 1024;

/// Whether a refinement pass feeds per-entry error back into the histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeightFeedback {
    None,
    /// Grow `adjusted_weight` of poorly matched entries so the next
    /// median-cut trial spends more of the palette on them.
    EmphasizeErrors,
}

/// Weighted color sums for one palette entry.
#[derive(Debug, Clone, Copy, Default)]
struct ClusterAccum {
    r: f64,
    g: f64,
    b: f64,
    a: f64,
    weight: f64,
}

/// Per-worker accumulator set, merged once the parallel section ends.
pub(crate) struct ClusterState {
    clusters: Vec<ClusterAccum>,
}

impl ClusterState {
    pub fn new(colors: usize) -> Self {
        Self {
            clusters: vec![ClusterAccum::default(); colors],
        }
    }

    #[inline]
    pub fn update(&mut self, px: FPixel, weight: f32, index: PalIndex) {
        let c = &mut self.clusters[index as usize];
        let w = weight as f64;
        c.r += px.r as f64 * w;
        c.g += px.g as f64 * w;
        c.b += px.b as f64 * w;
        c.a += px.a as f64 * w;
        c.weight += w;
    }

    pub fn merge(&mut self, other: &ClusterState) {
        for (c, o) in self.clusters.iter_mut().zip(&other.clusters) {
            c.r += o.r;
            c.g += o.g;
            c.b += o.b;
            c.a += o.a;
            c.weight += o.weight;
        }
    }

    /// Move every non-fixed palette entry to its cluster centroid.
    /// Entries that attracted no weight are left where they are.
    pub fn finalize_into(&self, map: &mut Colormap) {
        for (entry, c) in map.entries_mut().iter_mut().zip(&self.clusters) {
            if entry.fixed || c.weight <= 0.0 {
                continue;
            }
            entry.color = FPixel::new(
                (c.r / c.weight) as f32,
                (c.g / c.weight) as f32,
                (c.b / c.weight) as f32,
                (c.a / c.weight) as f32,
            );
            entry.popularity = c.weight as f32;
        }
    }
}

/// One k-means step: assign histogram entries to their nearest palette color,
/// then move each color to the weighted centroid of what it attracted.
///
/// Returns the weighted mean squared error of the assignment (before the
/// centroid move). Assignment runs in parallel; accumulators merge in chunk
/// order so results are reproducible.
pub(crate) fn do_iteration(
    hist: &mut Histogram,
    map: &mut Colormap,
    min_opaque: f32,
    feedback: WeightFeedback,
) -> f64 {
    let nearest = nearest_for(map);
    let colors = map.len();

    let partials: Vec<(ClusterState, f64, f64)> = hist
        .items
        .par_chunks_mut(CHUNK)
        .map(|chunk| {
            let mut state = ClusterState::new(colors);
            let mut error = 0.0f64;
            let mut weight = 0.0f64;
            for item in chunk {
                let (index, diff) = nearest.search(item.color, min_opaque);
                state.update(item.color, item.perceptual_weight, index);
                error += diff as f64 * item.perceptual_weight as f64;
                weight += item.perceptual_weight as f64;

                if feedback == WeightFeedback::EmphasizeErrors {
                    item.adjusted_weight =
                        (item.perceptual_weight + item.adjusted_weight) * (1.0 + diff).sqrt();
                }
            }
            (state, error, weight)
        })
        .collect();

    let mut state = ClusterState::new(colors);
    let mut total_error = 0.0f64;
    let mut total_weight = 0.0f64;
    for (partial, error, weight) in &partials {
        state.merge(partial);
        total_error += error;
        total_weight += weight;
    }

    state.finalize_into(map);
    total_error / total_weight.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::HistItem;
    use crate::palette::MapEntry;

    fn hist_of(colors: &[(f32, f32, f32)]) -> Histogram {
        Histogram {
            items: colors
                .iter()
                .map(|&(r, g, b)| HistItem {
                    color: FPixel::new(r, g, b, 1.0),
                    perceptual_weight: 1.0,
                    adjusted_weight: 1.0,
                })
                .collect(),
        }
    }

    fn map_of(colors: &[(f32, f32, f32)]) -> Colormap {
        let mut map = Colormap::new();
        for &(r, g, b) in colors {
            map.push(MapEntry {
                color: FPixel::new(r, g, b, 1.0),
                popularity: 0.0,
                fixed: false,
            });
        }
        map
    }

    #[test]
    fn entry_moves_to_cluster_centroid() {
        let mut hist = hist_of(&[(0.2, 0.2, 0.2), (0.4, 0.4, 0.4)]);
        let mut map = map_of(&[(0.0, 0.0, 0.0), (0.9, 0.9, 0.9)]);
        do_iteration(&mut hist, &mut map, 1.0, WeightFeedback::None);
        // Both histogram entries assign to the dark palette color, which
        // should land on their mean; the light one keeps its place.
        assert!((map.entries()[0].color.r - 0.3).abs() < 1e-6);
        assert!((map.entries()[1].color.r - 0.9).abs() < 1e-6);
    }

    #[test]
    fn error_shrinks_across_iterations() {
        let mut hist = hist_of(&[
            (0.1, 0.1, 0.1),
            (0.2, 0.2, 0.2),
            (0.7, 0.7, 0.7),
            (0.9, 0.9, 0.9),
        ]);
        let mut map = map_of(&[(0.0, 0.0, 0.0), (1.0, 1.0, 1.0)]);
        let first = do_iteration(&mut hist, &mut map, 1.0, WeightFeedback::None);
        let second = do_iteration(&mut hist, &mut map, 1.0, WeightFeedback::None);
        assert!(second <= first, "second {second} vs first {first}");
    }

    #[test]
    fn feedback_raises_weight_of_poor_matches() {
        let mut hist = hist_of(&[(0.0, 0.0, 0.0), (0.5, 0.5, 0.5)]);
        let mut map = map_of(&[(0.0, 0.0, 0.0)]);
        do_iteration(&mut hist, &mut map, 1.0, WeightFeedback::EmphasizeErrors);
        // The well-matched entry grows by the minimum factor only.
        assert!(hist.items[1].adjusted_weight > hist.items[0].adjusted_weight);
    }

    #[test]
    fn fixed_entries_do_not_move() {
        let mut hist = hist_of(&[(0.4, 0.4, 0.4)]);
        let mut map = map_of(&[(0.0, 0.0, 0.0)]);
        map.entries_mut()[0].fixed = true;
        do_iteration(&mut hist, &mut map, 1.0, WeightFeedback::None);
        assert_eq!(map.entries()[0].color, FPixel::new(0.0, 0.0, 0.0, 1.0));
    }
}
