//! Visual-importance maps driving histogram weighting and dither strength.
//!
//! `contrast_maps` produces two planes from the input image:
//! * `noise` — 1.0 on flat areas, near 0.0 on high-frequency texture,
//!   with straight edges removed so anti-aliasing is not penalized;
//! * `edges` — like noise but including all edges.
//!
//! The exact morphological shaping sequence matters: downstream weights
//! depend on how smooth these planes are.

use crate::color::{FPixel, GammaLut};
use crate::image::Image;

pub(crate) fn contrast_maps(image: &Image<'_>) -> (Vec<f32>, Vec<f32>) {
    let cols = image.width();
    let rows = image.height();
    let lut = GammaLut::new(image.gamma());

    let mut noise = vec![0.0f32; cols * rows];
    let mut edges = vec![0.0f32; cols * rows];
    let mut tmp = vec![0.0f32; cols * rows];

    for j in 0..rows {
        let row = image.row(j);
        let row_above = image.row(j.saturating_sub(1));
        let row_below = image.row((j + 1).min(rows - 1));

        let mut curr = lut.to_f(row[0]);
        let mut next = curr;
        for i in 0..cols {
            let prev = curr;
            curr = next;
            next = lut.to_f(row[(i + 1).min(cols - 1)]);

            // Contrast is the second difference between horizontal and
            // vertical neighbors, taken over all four channels.
            let horiz = second_difference(prev, next, curr);
            let above = lut.to_f(row_above[i]);
            let below = lut.to_f(row_below[i]);
            let vert = second_difference(above, below, curr);

            let edge = horiz.max(vert);
            let mut z = edge - (horiz - vert).abs() * 0.5;
            z = 1.0 - z.max(horiz.min(vert));
            z = z.clamp(0.0, 1.0);
            z *= z; // amplify flatness
            z *= z;

            noise[j * cols + i] = z;
            edges[j * cols + i] = (1.0 - edge).clamp(0.0, 1.0);
        }
    }

    // Noise areas are shrunk and then expanded to remove thin edges from the map.
    dilate3(&noise, &mut tmp, cols, rows);
    dilate3(&tmp, &mut noise, cols, rows);

    blur3(&mut noise, &mut tmp, cols, rows);

    dilate3(&noise, &mut tmp, cols, rows);
    erode3(&tmp, &mut noise, cols, rows);
    erode3(&noise, &mut tmp, cols, rows);
    erode3(&tmp, &mut noise, cols, rows);

    erode3(&edges, &mut tmp, cols, rows);
    dilate3(&tmp, &mut edges, cols, rows);
    for (e, n) in edges.iter_mut().zip(noise.iter()) {
        *e = e.min(*n);
    }

    (noise, edges)
}

fn second_difference(prev: FPixel, next: FPixel, curr: FPixel) -> f32 {
    let r = (prev.r + next.r - curr.r * 2.0).abs();
    let g = (prev.g + next.g - curr.g * 2.0).abs();
    let b = (prev.b + next.b - curr.b * 2.0).abs();
    let a = (prev.a + next.a - curr.a * 2.0).abs();
    r.max(g).max(b).max(a)
}

/// 3x3 maximum (dilation) with clamped borders.
fn dilate3(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
    morph3(src, dst, width, height, f32::max);
}

/// 3x3 minimum (erosion) with clamped borders.
fn erode3(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
    morph3(src, dst, width, height, f32::min);
}

fn morph3(src: &[f32], dst: &mut [f32], width: usize, height: usize, pick: fn(f32, f32) -> f32) {
    for y in 0..height {
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(height - 1);
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let mut v = src[y0 * width + x0];
            for yy in y0..=y1 {
                for xx in x0..=x1 {
                    v = pick(v, src[yy * width + xx]);
                }
            }
            dst[y * width + x] = v;
        }
    }
}

/// 3-tap separable box blur with clamped borders, in place via `tmp`.
fn blur3(plane: &mut [f32], tmp: &mut [f32], width: usize, height: usize) {
    for y in 0..height {
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let row = y * width;
            tmp[row + x] = (plane[row + x0] + plane[row + x] + plane[row + x1]) / 3.0;
        }
    }
    for y in 0..height {
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(height - 1);
        for x in 0..width {
            plane[y * width + x] =
                (tmp[y0 * width + x] + tmp[y * width + x] + tmp[y1 * width + x]) / 3.0;
        }
    }
}

/// Damp dithering over uniform plateaus of the remapped index plane.
///
/// Scans each row for runs of the same palette index, counting same-index
/// neighbors one pixel above and below. Long well-supported runs mean a flat
/// region where dithering would only add grain, so the edges plane is scaled
/// down across the run. The caller promotes the shaped plane to the image's
/// dither map.
pub(crate) fn update_dither_map(index_plane: &[u8], edges: &mut [f32], width: usize, height: usize) {
    for row in 0..height {
        let this_row = &index_plane[row * width..(row + 1) * width];
        let mut lastpixel = this_row[0];
        let mut lastcol = 0usize;

        for col in 1..width {
            let px = this_row[col];

            if px != lastpixel || col == width - 1 {
                let mut neighbor_count = 2.5f32 + (col - lastcol) as f32;

                for i in lastcol..col {
                    if row > 0 && index_plane[(row - 1) * width + i] == lastpixel {
                        neighbor_count += 1.0;
                    }
                    if row + 1 < height && index_plane[(row + 1) * width + i] == lastpixel {
                        neighbor_count += 1.0;
                    }
                }

                while lastcol <= col {
                    edges[row * width + lastcol] *= 1.0 - 2.5 / neighbor_count;
                    lastcol += 1;
                }
                lastpixel = px;
            }
        }
    }
}
