//! Initial palette construction by recursive variance splitting.

use crate::color::{color_difference, FPixel};
use crate::histogram::{HistItem, Histogram};
use crate::palette::{Colormap, MapEntry};

/// A contiguous range of histogram entries forming one candidate palette color.
struct CutBox {
    begin: usize,
    end: usize,
    /// Sum of adjusted weights in the range.
    weight: f64,
    centroid: FPixel,
    /// Sum of `adjusted_weight * distance(color, centroid)` over the range.
    weighted_error: f64,
}

impl CutBox {
    fn from_range(items: &[HistItem], begin: usize, end: usize) -> Self {
        let slice = &items[begin..end];
        let (centroid, weight) = weighted_centroid(slice);
        let weighted_error = slice
            .iter()
            .map(|it| it.adjusted_weight as f64 * color_difference(it.color, centroid) as f64)
            .sum();
        Self {
            begin,
            end,
            weight,
            centroid,
            weighted_error,
        }
    }

    fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Mean squared error of the box members against its centroid.
    fn mse(&self) -> f64 {
        if self.weight > 0.0 {
            self.weighted_error / self.weight
        } else {
            0.0
        }
    }
}

/// Build a palette of up to `max_colors` entries from the histogram.
///
/// Boxes whose internal MSE exceeds `box_accept_mse` are split first, largest
/// weighted variance breaking ties. Splitting stops when the color budget is
/// reached, no box exceeds the acceptance threshold, or (for a non-zero
/// `target_mse`) the total error falls below the target.
///
/// Consumes `adjusted_weight`s; sorts histogram ranges in place.
pub(crate) fn mediancut(
    hist: &mut Histogram,
    max_colors: usize,
    target_mse: f64,
    box_accept_mse: f64,
) -> Colormap {
    let items = &mut hist.items[..];
    if items.is_empty() {
        return Colormap::new();
    }

    let first = CutBox::from_range(items, 0, items.len());
    let total_weight = first.weight;
    let mut total_error = first.weighted_error;
    let mut boxes = vec![first];

    while boxes.len() < max_colors {
        if target_mse > 0.0 && total_error <= target_mse * total_weight {
            break;
        }

        // Only boxes still above the acceptance MSE are worth splitting;
        // among those, the largest weighted variance goes first.
        let mut best: Option<usize> = None;
        let mut best_error = 0.0f64;
        for (i, b) in boxes.iter().enumerate() {
            if b.len() < 2 || b.mse() <= box_accept_mse {
                continue;
            }
            if b.weighted_error > best_error {
                best_error = b.weighted_error;
                best = Some(i);
            }
        }
        let Some(bi) = best else {
            break;
        };

        let (begin, end) = (boxes[bi].begin, boxes[bi].end);
        let split = split_range(items, begin, end, boxes[bi].centroid);

        let left = CutBox::from_range(items, begin, split);
        let right = CutBox::from_range(items, split, end);
        total_error += left.weighted_error + right.weighted_error - boxes[bi].weighted_error;
        boxes[bi] = left;
        boxes.push(right);
    }

    let mut map = Colormap::new();
    for b in &boxes {
        let popularity: f64 = items[b.begin..b.end]
            .iter()
            .map(|it| it.perceptual_weight as f64)
            .sum();
        map.push(MapEntry {
            color: b.centroid,
            popularity: popularity as f32,
            fixed: false,
        });
    }
    map
}

/// Sort the range along its highest-variance channel and cut it at the
/// weighted median. Returns the split index (both halves non-empty).
fn split_range(items: &mut [HistItem], begin: usize, end: usize, centroid: FPixel) -> usize {
    let slice = &mut items[begin..end];

    // Channel of largest weighted variance; ties resolve in R, G, B, A order.
    let variances = channel_variances(slice, centroid);
    let mut channel = 0;
    for (c, &v) in variances.iter().enumerate() {
        if v > variances[channel] {
            channel = c;
        }
    }

    slice.sort_unstable_by(|x, y| {
        x.color.channels()[channel].total_cmp(&y.color.channels()[channel])
    });

    let half_weight: f64 = slice.iter().map(|it| it.adjusted_weight as f64).sum::<f64>() / 2.0;
    let mut accumulated = 0.0f64;
    let mut split = 1;
    for (i, it) in slice.iter().enumerate() {
        accumulated += it.adjusted_weight as f64;
        if accumulated >= half_weight {
            split = i + 1;
            break;
        }
    }

    begin + split.clamp(1, slice.len() - 1)
}

fn weighted_centroid(items: &[HistItem]) -> (FPixel, f64) {
    let mut r = 0.0f64;
    let mut g = 0.0f64;
    let mut b = 0.0f64;
    let mut a = 0.0f64;
    let mut weight = 0.0f64;

    for it in items {
        let w = it.adjusted_weight as f64;
        r += it.color.r as f64 * w;
        g += it.color.g as f64 * w;
        b += it.color.b as f64 * w;
        a += it.color.a as f64 * w;
        weight += w;
    }

    if weight <= 0.0 {
        return (FPixel::default(), 0.0);
    }
    (
        FPixel::new(
            (r / weight) as f32,
            (g / weight) as f32,
            (b / weight) as f32,
            (a / weight) as f32,
        ),
        weight,
    )
}

fn channel_variances(items: &[HistItem], centroid: FPixel) -> [f64; 4] {
    let mean = centroid.channels();
    let mut var = [0.0f64; 4];
    for it in items {
        let w = it.adjusted_weight as f64;
        let ch = it.color.channels();
        for c in 0..4 {
            let d = (ch[c] - mean[c]) as f64;
            var[c] += w * d * d;
        }
    }
    var
}
