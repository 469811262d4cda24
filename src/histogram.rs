use std::collections::BTreeMap;

use rgb::RGBA8;

use crate::color::{FPixel, GammaLut};
use crate::error::Error;
use crate::image::Image;
use crate::Attributes;

/// One unique (posterized) color with its accumulated importance.
///
/// `perceptual_weight` is fixed at construction; `adjusted_weight` is what
/// median cut and the k-means refinement consume, and the palette search
/// driver reshapes it between trials.
#[derive(Debug, Clone)]
pub(crate) struct HistItem {
    pub color: FPixel,
    pub perceptual_weight: f32,
    pub adjusted_weight: f32,
}

/// Weighted unique-color table of an image.
///
/// Colors are immutable after construction; weights are not.
pub(crate) struct Histogram {
    pub(crate) items: Vec<HistItem>,
}

impl Histogram {
    /// Count every pixel into a posterization-keyed table, weighted by the
    /// image's noise map when one exists (flat areas count up to 16x).
    ///
    /// If the table outgrows the attribute's entry budget, posterization is
    /// made coarser and counting restarts.
    pub fn build(image: &Image<'_>, attr: &Attributes) -> Result<Self, Error> {
        let max_entries = attr.max_histogram_entries as usize;
        let mut ignorebits = attr.min_posterization;

        let counts = loop {
            match count_colors(image, ignorebits, max_entries) {
                Some(counts) => break counts,
                None => {
                    ignorebits += 1;
                    debug_assert!(ignorebits < 8);
                    attr.verbose(|| {
                        "  too many colors! Scaling colors to improve clustering...".into()
                    });
                }
            }
        };

        let lut = GammaLut::new(image.gamma());
        let mut items = Vec::new();
        items
            .try_reserve_exact(counts.len())
            .map_err(|_| Error::OutOfMemory)?;

        for (key, weight) in counts {
            let weight = (weight as f32).max(1.0 / 256.0);
            items.push(HistItem {
                color: lut.to_f(unpack(key)),
                perceptual_weight: weight,
                adjusted_weight: weight,
            });
        }

        attr.verbose(|| format!("  made histogram...{} colors found", items.len()));
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// One counting pass. Returns `None` when the table exceeds `max_entries`.
///
/// A BTreeMap keeps the export order a pure function of the pixel data, which
/// the output contract (byte-identical reruns) depends on.
fn count_colors(
    image: &Image<'_>,
    ignorebits: u32,
    max_entries: usize,
) -> Option<BTreeMap<u32, f64>> {
    let mut counts: BTreeMap<u32, f64> = BTreeMap::new();
    let noise = image.noise();
    let width = image.width();

    for row in 0..image.height() {
        for (col, px) in image.row(row).iter().enumerate() {
            // Color accuracy in noisy areas is not very important, so the
            // noise map (1.0 = flat) boosts flat-area pixels instead.
            let weight = match noise {
                Some(map) => 1.0 + 15.0 * map[row * width + col] as f64,
                None => 1.0,
            };

            // Fully transparent pixels are indistinguishable; collapsing
            // them keeps their RGB garbage from spending palette entries.
            let px = if px.a == 0 {
                RGBA8::new(0, 0, 0, 0)
            } else {
                *px
            };

            *counts.entry(pack(px, ignorebits)).or_insert(0.0) += weight;
            if counts.len() > max_entries {
                return None;
            }
        }
    }

    Some(counts)
}

fn pack(px: RGBA8, ignorebits: u32) -> u32 {
    let mask = (0xFFu32 << ignorebits) as u8;
    u32::from_be_bytes([px.r & mask, px.g & mask, px.b & mask, px.a & mask])
}

fn unpack(key: u32) -> RGBA8 {
    let [r, g, b, a] = key.to_be_bytes();
    RGBA8::new(r, g, b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Attributes;

    fn image_of(pixels: Vec<RGBA8>, width: usize, height: usize) -> Image<'static> {
        Image::new(&Attributes::new(), pixels, width, height, 0.0).unwrap()
    }

    #[test]
    fn distinct_colors_distinct_entries() {
        let img = image_of(
            vec![
                RGBA8::new(255, 0, 0, 255),
                RGBA8::new(0, 255, 0, 255),
                RGBA8::new(0, 0, 255, 255),
                RGBA8::new(255, 255, 255, 255),
            ],
            2,
            2,
        );
        let hist = Histogram::build(&img, &Attributes::new()).unwrap();
        assert_eq!(hist.len(), 4);
    }

    #[test]
    fn repeated_color_accumulates_weight() {
        let img = image_of(vec![RGBA8::new(10, 20, 30, 255); 16], 4, 4);
        let hist = Histogram::build(&img, &Attributes::new()).unwrap();
        assert_eq!(hist.len(), 1);
        // 16 pixels, each weighted at least 1.0.
        assert!(hist.items[0].perceptual_weight >= 16.0);
        assert_eq!(
            hist.items[0].perceptual_weight,
            hist.items[0].adjusted_weight
        );
    }

    #[test]
    fn posterization_coalesces_near_identical_colors() {
        let mut attr = Attributes::new();
        attr.set_speed(9).unwrap(); // starts with one ignored bit
        let img = image_of(
            vec![
                RGBA8::new(100, 100, 100, 255),
                RGBA8::new(101, 101, 101, 255),
                RGBA8::new(100, 100, 100, 255),
                RGBA8::new(101, 101, 101, 255),
            ],
            2,
            2,
        );
        let hist = Histogram::build(&img, &attr).unwrap();
        assert_eq!(hist.len(), 1);
    }

    #[test]
    fn key_roundtrip_preserves_posterized_color() {
        let px = RGBA8::new(0b1010_1010, 0b0101_0101, 0xFF, 0x00);
        assert_eq!(unpack(pack(px, 0)), px);
        let coarse = unpack(pack(px, 2));
        assert_eq!(coarse.r, 0b1010_1000);
        assert_eq!(coarse.g, 0b0101_0100);
    }
}
