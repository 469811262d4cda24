//! Pixel → palette-index assignment, plain and error-diffused.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::color::{color_difference, FPixel, GammaLut, MAX_DIFF};
use crate::image::Image;
use crate::kmeans::ClusterState;
use crate::nearest::{nearest_for, PalIndex};
use crate::palette::Colormap;

/// Rows per parallel work unit. Fixed so per-chunk accumulators merge in the
/// same order at any thread-pool width.
const ROW_CHUNK: usize = 64;

/// Seed for the error-row noise; a fixed seed keeps dithered output
/// byte-identical across runs.
const DITHER_SEED: u64 = 12345;

/// Assign every pixel to its nearest palette entry.
///
/// Each pixel also feeds a per-worker cluster accumulator, and the palette is
/// moved to the resulting centroids afterwards, so it ends up capturing the
/// image's actual color means rather than the histogram's. Returns the
/// average squared error per remapped (non-transparent) pixel.
pub(crate) fn remap_to_palette(
    image: &Image<'_>,
    output: &mut [u8],
    map: &mut Colormap,
    min_opaque: f32,
) -> f64 {
    let width = image.width();
    let lut = GammaLut::new(image.gamma());
    let nearest = nearest_for(map);
    let transparent = nearest.search(FPixel::default(), min_opaque).0;
    let colors = map.len();

    let partials: Vec<(ClusterState, f64, u64)> = output
        .par_chunks_mut(width * ROW_CHUNK)
        .enumerate()
        .map(|(chunk, out_chunk)| {
            let mut state = ClusterState::new(colors);
            let mut error = 0.0f64;
            let mut remapped = 0u64;

            for (local, out_row) in out_chunk.chunks_mut(width).enumerate() {
                let in_row = image.row(chunk * ROW_CHUNK + local);
                for (out_px, &px) in out_row.iter_mut().zip(in_row) {
                    let px = lut.to_f(px);
                    let index = if px.a < 1.0 / 256.0 {
                        transparent
                    } else {
                        let (index, diff) = nearest.search(px, min_opaque);
                        error += diff as f64;
                        remapped += 1;
                        index
                    };
                    *out_px = index;
                    state.update(px, 1.0, index);
                }
            }
            (state, error, remapped)
        })
        .collect();

    let mut state = ClusterState::new(colors);
    let mut error = 0.0f64;
    let mut remapped = 0u64;
    for (partial, err, count) in &partials {
        state.merge(partial);
        error += err;
        remapped += count;
    }
    state.finalize_into(map);

    error / remapped.max(1) as f64
}

/// Squared distance from palette entry `i` to its closest other entry.
fn distance_from_closest_other_color(colors: &[FPixel], i: usize) -> f32 {
    let mut second_best = MAX_DIFF as f32;
    for (j, &other) in colors.iter().enumerate() {
        if i == j {
            continue;
        }
        let diff = color_difference(colors[i], other);
        if diff <= second_best {
            second_best = diff;
        }
    }
    second_best
}

/// Add accumulated error to a pixel, at most up to the channel limits.
///
/// The error scale is constrained so no channel leaves [0, 1]; wildly large
/// accumulated error is damped by 20%, and error too small to be visible
/// skips dithering entirely, which also helps compression.
fn get_dithered_pixel(
    dither_level: f32,
    max_dither_error: f32,
    err: FPixel,
    px: FPixel,
) -> FPixel {
    let sr = err.r * dither_level;
    let sg = err.g * dither_level;
    let sb = err.b * dither_level;
    let sa = err.a * dither_level;

    let limit = |s: f32, v: f32| -> f32 {
        if s < 0.0 {
            v / -s
        } else if s > 0.0 {
            (1.0 - v) / s
        } else {
            1.0
        }
    };
    let mut ratio = limit(sr, px.r)
        .min(limit(sg, px.g))
        .min(limit(sb, px.b))
        .min(limit(sa, px.a));

    let dither_error = sr * sr + sg * sg + sb * sb + sa * sa;
    if dither_error > max_dither_error {
        ratio *= 0.8;
    } else if dither_error < 2.0 / 256.0 / 256.0 {
        return px;
    }

    ratio = ratio.clamp(0.0, 1.0);

    FPixel::new(
        px.r + sr * ratio,
        px.g + sg * ratio,
        px.b + sb * ratio,
        px.a + sa * ratio,
    )
}

/// Serpentine Floyd-Steinberg remap.
///
/// The dither map (when in use) confines dithering to flat areas: dithering
/// on edges creates jagged lines, and noisy areas are naturally dithered
/// already. With `output_is_remapped`, pixels whose current index is already
/// within a per-entry tolerance keep it, so only pixels noticeably changed
/// by error diffusion are rewritten.
#[allow(clippy::too_many_arguments)]
pub(crate) fn remap_to_palette_floyd(
    image: &Image<'_>,
    output: &mut [u8],
    map: &Colormap,
    min_opaque: f32,
    dither_level: f32,
    use_dither_map: bool,
    output_is_remapped: bool,
    max_dither_error: f32,
) {
    let cols = image.width();
    let rows = image.height();
    let lut = GammaLut::new(image.gamma());
    let colors: Vec<FPixel> = map.entries().iter().map(|e| e.color).collect();

    let dither_map: Option<&[f32]> = if use_dither_map {
        image.dither_map().or_else(|| image.edges())
    } else {
        None
    };

    let nearest = nearest_for(map);
    let transparent = nearest.search(FPixel::default(), min_opaque).0;

    let tolerance: Vec<f32> = if output_is_remapped {
        (0..colors.len())
            .map(|i| distance_from_closest_other_color(&colors, i) / 4.0)
            .collect()
    } else {
        Vec::new()
    };

    let mut thiserr = vec![FPixel::default(); cols + 2];
    let mut nexterr = vec![FPixel::default(); cols + 2];

    // Seed the first error row with low-amplitude noise so flat gradients
    // don't all round the same way on the first scanline.
    let mut rng = SmallRng::seed_from_u64(DITHER_SEED);
    for e in thiserr.iter_mut() {
        *e = FPixel::new(
            (rng.gen::<f32>() - 0.5) / 255.0,
            (rng.gen::<f32>() - 0.5) / 255.0,
            (rng.gen::<f32>() - 0.5) / 255.0,
            (rng.gen::<f32>() - 0.5) / 255.0,
        );
    }

    let mut forward = true;
    for row in 0..rows {
        nexterr.fill(FPixel::default());

        let in_row = image.row(row);
        let out_row = &mut output[row * cols..(row + 1) * cols];
        let mut col = if forward { 0 } else { cols - 1 };

        loop {
            let base = dither_map.map_or(15.0 / 16.0, |m| m[row * cols + col]);
            let mut level = dither_level * base;

            let spx =
                get_dithered_pixel(level, max_dither_error, thiserr[col + 1], lut.to_f(in_row[col]));

            let index = if spx.a < 1.0 / 256.0 {
                transparent
            } else {
                let current = out_row[col] as usize;
                if output_is_remapped
                    && color_difference(colors[current], spx) < tolerance[current]
                {
                    current as PalIndex
                } else {
                    nearest.search(spx, min_opaque).0
                }
            };
            out_row[col] = index;

            let xp = colors[index as usize];
            let mut err = FPixel::new(spx.r - xp.r, spx.g - xp.g, spx.b - xp.b, spx.a - xp.a);

            // Don't propagate crazy-high error in full; it would pop pixels
            // of a completely foreign color out of flat areas.
            if err.r * err.r + err.g * err.g + err.b * err.b + err.a * err.a > max_dither_error {
                level *= 0.75;
            }

            let colorimp = (3.0 + xp.a) / 4.0 * level;
            err.r *= colorimp;
            err.g *= colorimp;
            err.b *= colorimp;
            err.a *= level;

            let spread =
                |buf: &mut [FPixel], at: usize, err: FPixel, numerator: f32| {
                    let e = &mut buf[at];
                    e.r += err.r * numerator / 16.0;
                    e.g += err.g * numerator / 16.0;
                    e.b += err.b * numerator / 16.0;
                    e.a += err.a * numerator / 16.0;
                };

            if forward {
                spread(&mut thiserr, col + 2, err, 7.0);
                spread(&mut nexterr, col, err, 3.0);
                spread(&mut nexterr, col + 1, err, 5.0);
                spread(&mut nexterr, col + 2, err, 1.0);
                col += 1;
                if col >= cols {
                    break;
                }
            } else {
                spread(&mut thiserr, col, err, 7.0);
                spread(&mut nexterr, col, err, 1.0);
                spread(&mut nexterr, col + 1, err, 5.0);
                spread(&mut nexterr, col + 2, err, 3.0);
                if col == 0 {
                    break;
                }
                col -= 1;
            }
        }

        std::mem::swap(&mut thiserr, &mut nexterr);
        forward = !forward;
    }
}
