#![forbid(unsafe_code)]

//! Palette quantization and dithering engine for 32-bit RGBA images.
//!
//! The pipeline: per-pixel importance maps weight a posterized color
//! histogram; median cut builds an initial palette which a feedback loop of
//! k-means refinements improves until it hits the configured error budget;
//! remapping assigns every pixel its palette index, optionally through
//! serpentine Floyd-Steinberg error diffusion whose strength follows an
//! edge/noise map.
//!
//! Decoding, encoding and I/O are out of scope: input is an [`Image`] view
//! over caller-provided RGBA rows, output is a palette plus one index byte
//! per pixel.

mod color;
mod contrast;
mod error;
mod histogram;
mod image;
mod kmeans;
mod log;
mod mediancut;
mod nearest;
mod palette;
mod remap;

pub use crate::error::Error;
pub use crate::image::Image;
pub use crate::log::{BufferedLog, DebugLogger, LogSink};
pub use rgb::RGBA8;

use std::sync::Arc;

use crate::color::MAX_DIFF;
use crate::histogram::Histogram;
use crate::kmeans::WeightFeedback;
use crate::palette::{rounded_palette, sort_palette, Colormap, MapEntry};

/// Map a user-facing quality (0..=100) to a mean-squared-error budget.
/// The curve is fudged to roughly match libjpeg's quality scale.
fn quality_to_mse(quality: u8) -> f64 {
    if quality == 0 {
        return MAX_DIFF;
    }
    2.5 / (210.0 + f64::from(quality)).powf(1.2) * (100.1 - f64::from(quality)) / 100.0
}

/// Per-box splitting budget for median cut, derived from the (overshot)
/// target. The floor keeps splitting alive when no target is set.
fn box_acceptance(target_mse: f64) -> f64 {
    target_mse.max(90.0 / 65536.0) * 1.2
}

/// Quantization settings plus the speed-derived tuning shared by every image
/// and result created from it.
#[derive(Clone)]
pub struct Attributes {
    max_colors: u32,
    target_mse: f64,
    max_mse: f64,
    min_opaque_val: f32,
    last_index_transparent: bool,
    kmeans_iterations: u32,
    kmeans_iteration_limit: f64,
    feedback_loop_trials: u32,
    pub(crate) max_histogram_entries: u32,
    pub(crate) min_posterization: u32,
    use_contrast_maps: bool,
    use_dither_map: bool,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

impl Attributes {
    pub fn new() -> Self {
        let mut attr = Self {
            max_colors: 256,
            target_mse: 0.0,
            max_mse: MAX_DIFF,
            min_opaque_val: 1.0,
            last_index_transparent: false,
            kmeans_iterations: 0,
            kmeans_iteration_limit: 0.0,
            feedback_loop_trials: 0,
            max_histogram_entries: 0,
            min_posterization: 0,
            use_contrast_maps: false,
            use_dither_map: false,
            log_sink: None,
        };
        attr.apply_speed(3);
        attr
    }

    /// Upper bound on palette size, 2..=256.
    pub fn set_max_colors(&mut self, colors: u32) -> Result<(), Error> {
        if !(2..=256).contains(&colors) {
            return Err(Error::ValueOutOfRange("max_colors"));
        }
        self.max_colors = colors;
        Ok(())
    }

    /// Speed/quality dial, 1 (slow, best) ..= 10 (fast, rough).
    ///
    /// Low speeds enable the contrast maps and the dither map, allow more
    /// palette-search trials and more refinement iterations, and keep the
    /// histogram finer-grained.
    pub fn set_speed(&mut self, speed: u8) -> Result<(), Error> {
        if !(1..=10).contains(&speed) {
            return Err(Error::ValueOutOfRange("speed"));
        }
        self.apply_speed(speed);
        Ok(())
    }

    fn apply_speed(&mut self, speed: u8) {
        let speed = u32::from(speed);
        let iterations = 8u32.saturating_sub(speed);
        self.kmeans_iterations = iterations + iterations * iterations / 2;
        self.kmeans_iteration_limit = 1.0 / f64::from(1u32 << (23 - speed));
        self.feedback_loop_trials = 56u32.saturating_sub(9 * speed);
        self.max_histogram_entries = (1 << 17) + (1 << 18) * (10 - speed);
        self.min_posterization = if speed >= 8 { 1 } else { 0 };
        self.use_contrast_maps = speed <= 7;
        self.use_dither_map = speed <= 5;
    }

    /// Quality budget as (target, minimum), both 0..=100 with minimum ≤
    /// target. Quantization aims for the target and fails with
    /// [`Error::QualityTooLow`] if it cannot reach the minimum.
    pub fn set_quality(&mut self, target: u8, minimum: u8) -> Result<(), Error> {
        if target > 100 || minimum > target {
            return Err(Error::ValueOutOfRange("quality"));
        }
        self.target_mse = quality_to_mse(target);
        self.max_mse = quality_to_mse(minimum);
        Ok(())
    }

    /// Alphas at or above this value are pushed toward full opacity, for
    /// clients that render any slight transparency as a hole.
    pub fn set_min_opacity(&mut self, min: u8) {
        self.min_opaque_val = f32::from(min) / 255.0;
    }

    /// Put the transparent color in the final palette slot instead of the
    /// front (some subtitle formats require this layout).
    pub fn set_last_index_transparent(&mut self, last: bool) {
        self.last_index_transparent = last;
    }

    /// Install a progress sink; any previous sink is flushed first.
    pub fn set_log_sink(&mut self, sink: Arc<dyn LogSink>) {
        if let Some(old) = &self.log_sink {
            old.flush();
        }
        self.log_sink = Some(sink);
    }

    pub(crate) fn verbose(&self, line: impl FnOnce() -> String) {
        if let Some(sink) = &self.log_sink {
            sink.message(&line());
        }
    }

    pub(crate) fn min_opaque_val(&self) -> f32 {
        self.min_opaque_val
    }

    pub(crate) fn use_contrast_maps(&self) -> bool {
        self.use_contrast_maps
    }

    /// Build a palette for the image. The image's noise map is consumed
    /// here; its edges map stays for dithered remapping.
    pub fn quantize(&self, image: &mut Image<'_>) -> Result<QuantizationResult, Error> {
        let mut hist = Histogram::build(image, self)?;
        image.noise = None;

        let result = self.quantize_histogram(&mut hist);
        if let Some(sink) = &self.log_sink {
            sink.flush();
        }
        result
    }

    fn quantize_histogram(&self, hist: &mut Histogram) -> Result<QuantizationResult, Error> {
        let max_colors = self.max_colors as usize;

        let (mut map, palette_error) = if hist.len() <= max_colors && self.target_mse == 0.0 {
            // Few enough colors that no quality has to be given up.
            let mut map = Colormap::new();
            for item in &hist.items {
                map.push(MapEntry {
                    color: item.color,
                    popularity: item.perceptual_weight,
                    fixed: false,
                });
            }
            (map, Some(0.0))
        } else {
            let (mut map, mut error) = self.find_best_palette(hist);

            // Refinement approaches the local minimum for the palette.
            let mut iterations = self.kmeans_iterations;
            if iterations == 0 && error.is_none() && self.max_mse < MAX_DIFF {
                // Without at least one pass the error stays unknown and the
                // quality floor could never trigger.
                iterations = 1;
            }
            if iterations > 0 {
                self.verbose(|| "  moving colormap towards local minimum".into());
                let mut previous = MAX_DIFF;
                let mut i = 0;
                while i < iterations {
                    let e =
                        kmeans::do_iteration(hist, &mut map, self.min_opaque_val, WeightFeedback::None);
                    error = Some(e);

                    if (previous - e).abs() < self.kmeans_iteration_limit {
                        break;
                    }
                    if e > self.max_mse * 1.5 {
                        // probably hopeless
                        if e > self.max_mse * 3.0 {
                            break; // definitely hopeless
                        }
                        iterations += 1;
                    }
                    previous = e;
                    i += 1;
                }
            }

            if let Some(e) = error {
                if e > self.max_mse {
                    self.verbose(|| {
                        format!(
                            "  image degradation MSE={:.3} exceeded limit of {:.3}",
                            e * 65536.0 / 6.0,
                            self.max_mse * 65536.0 / 6.0
                        )
                    });
                    return Err(Error::QualityTooLow);
                }
            }
            (map, error)
        };

        sort_palette(&mut map, self.last_index_transparent);
        self.verbose(|| {
            let transparent = map
                .entries()
                .iter()
                .filter(|e| e.color.a < 255.0 / 256.0)
                .count();
            format!("  palette sorted...{transparent} entries not fully opaque")
        });

        Ok(QuantizationResult {
            palette: map,
            int_palette: None,
            gamma: image::DEFAULT_GAMMA,
            palette_error,
            dither_level: 1.0,
            use_dither_map: self.use_dither_map,
            min_opaque_val: self.min_opaque_val,
        })
    }

    /// Repeat median cut with reshaped histogram weights, keeping the best
    /// palette seen. Each trial runs one refinement step whose per-entry
    /// error feeds back into the weights, so poorly matched colors get more
    /// of the palette next time around.
    fn find_best_palette(&self, hist: &mut Histogram) -> (Colormap, Option<f64>) {
        let mut max_colors = self.max_colors as usize;
        let target_mse = self.target_mse;

        if self.feedback_loop_trials == 0 {
            let map = mediancut::mediancut(hist, max_colors, target_mse, box_acceptance(target_mse));
            return (map, None);
        }

        let total_trials = self.feedback_loop_trials as i32;
        let mut trials = total_trials;
        let mut best = Colormap::new();
        let mut have_best = false;
        let mut least_error = MAX_DIFF;
        let mut target_overshoot = 1.05;

        loop {
            // Refinement will improve on whatever median cut produces, so
            // median cut may aim slightly past the target.
            let overshot_target = target_mse * target_overshoot;
            let mut newmap = mediancut::mediancut(
                hist,
                max_colors,
                overshot_target,
                box_acceptance(overshot_target),
            );

            // The first trial with a target set skips the weight feedback:
            // the initial weights are already what the target was set for.
            let feedback = if !have_best && target_mse > 0.0 {
                WeightFeedback::None
            } else {
                WeightFeedback::EmphasizeErrors
            };
            let total_error =
                kmeans::do_iteration(hist, &mut newmap, self.min_opaque_val, feedback);

            let good_enough = total_error <= target_mse && newmap.len() < max_colors;
            if !have_best || total_error < least_error || good_enough {
                if total_error < target_mse && total_error > 0.0 {
                    target_overshoot = (target_overshoot * 1.25).min(target_mse / total_error);
                }
                // If the color count could come down, try to keep it there,
                // with one spare as wiggle room.
                max_colors = max_colors.min(newmap.len() + 1);
                least_error = total_error;
                best = newmap;
                have_best = true;
                trials -= 1;
            } else {
                // Regression: pull the weights halfway back toward their
                // perceptual baseline and spend several trials.
                for item in hist.items.iter_mut() {
                    item.adjusted_weight = (item.perceptual_weight + item.adjusted_weight) / 2.0;
                }
                target_overshoot = 1.0;
                trials -= 6;
                if total_error > least_error * 4.0 {
                    trials -= 3;
                }
            }

            self.verbose(|| {
                format!(
                    "  selecting colors...{}%",
                    100 - trials.max(0) * 100 / total_trials
                )
            });

            if trials <= 0 {
                break;
            }
        }

        (best, Some(least_error))
    }
}

/// Result of palette construction: the palette itself plus the settings a
/// remap needs. One result can remap any number of images.
#[derive(Debug)]
pub struct QuantizationResult {
    palette: Colormap,
    int_palette: Option<Vec<RGBA8>>,
    gamma: f64,
    palette_error: Option<f64>,
    dither_level: f32,
    use_dither_map: bool,
    min_opaque_val: f32,
}

impl QuantizationResult {
    /// Floyd-Steinberg amplitude for subsequent remaps: 0.0 disables
    /// dithering, 1.0 is full strength.
    pub fn set_dithering_level(&mut self, dither_level: f32) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&dither_level) {
            return Err(Error::ValueOutOfRange("dither_level"));
        }
        self.dither_level = dither_level;
        Ok(())
    }

    /// Gamma for the integer palette, in (0, 1). The default 0.45455 is as
    /// close to 1/2.2 as the output can express.
    pub fn set_output_gamma(&mut self, gamma: f64) -> Result<(), Error> {
        if gamma <= 0.0 || gamma >= 1.0 {
            return Err(Error::ValueOutOfRange("output_gamma"));
        }
        self.gamma = gamma;
        self.int_palette = None;
        Ok(())
    }

    pub fn output_gamma(&self) -> f64 {
        self.gamma
    }

    pub fn palette_len(&self) -> usize {
        self.palette.len()
    }

    /// The integer palette. Finalized lazily if no remap ran yet.
    pub fn palette(&mut self) -> &[RGBA8] {
        if self.int_palette.is_none() {
            let mut map = self.palette.clone();
            self.int_palette = Some(rounded_palette(&mut map, self.gamma));
        }
        match &self.int_palette {
            Some(palette) => palette,
            None => &[],
        }
    }

    /// Alpha values for a PNG tRNS chunk: one byte per palette entry,
    /// truncated after the last non-opaque one. `None` when the palette is
    /// fully opaque and the chunk can be omitted.
    pub fn alpha_table(&mut self) -> Option<Vec<u8>> {
        let alphas: Vec<u8> = self.palette().iter().map(|px| px.a).collect();
        let last_non_opaque = alphas.iter().rposition(|&a| a != 255);
        last_non_opaque.map(|pos| alphas[..=pos].to_vec())
    }

    /// Mean squared remapping error in MSE·65536/6 units (0 = perfect).
    /// `None` until an error has been measured (fast speeds skip it until
    /// the first remap).
    pub fn remapping_error(&self) -> Option<f64> {
        self.palette_error.map(|e| e * 65536.0 / 6.0)
    }

    /// Remap the image into a caller-provided row-major index buffer.
    pub fn remap_into(&mut self, image: &mut Image<'_>, buffer: &mut [u8]) -> Result<(), Error> {
        let required = image.width() * image.height();
        if buffer.len() < required {
            return Err(Error::BufferTooSmall {
                len: buffer.len(),
                required,
            });
        }
        let output = &mut buffer[..required];

        // Each remap starts from the palette as built, so remapping the same
        // image twice gives byte-identical results.
        let mut map = self.palette.clone();
        let mut remapping_error = self.palette_error;

        if self.dither_level == 0.0 {
            self.int_palette = Some(rounded_palette(&mut map, self.gamma));
            remapping_error = Some(remap::remap_to_palette(
                image,
                output,
                &mut map,
                self.min_opaque_val,
            ));
        } else {
            let generate_dither_map =
                self.use_dither_map && image.edges.is_some() && image.dither_map.is_none();
            if generate_dither_map {
                // A plain pass exposes runs of identical indices, which the
                // dither map uses to spare large flat areas from grain.
                remapping_error = Some(remap::remap_to_palette(
                    image,
                    output,
                    &mut map,
                    self.min_opaque_val,
                ));
                if let Some(mut edges) = image.edges.take() {
                    contrast::update_dither_map(
                        output,
                        &mut edges,
                        image.width(),
                        image.height(),
                    );
                    image.set_dither_map(edges);
                }
            }

            // The plain pass above was the palette's last chance to move, so
            // the integer palette is only fixed now.
            self.int_palette = Some(rounded_palette(&mut map, self.gamma));

            let max_dither_error = remapping_error
                .map_or(16.0 / 256.0, |e| (e * 2.4).max(16.0 / 256.0))
                as f32;
            remap::remap_to_palette_floyd(
                image,
                output,
                &map,
                self.min_opaque_val,
                self.dither_level,
                self.use_dither_map,
                generate_dither_map,
                max_dither_error,
            );
        }

        // Error measured on a dithered plane would be absurd; the plain
        // measurement correlates with perceived quality, so it is kept.
        if self.palette_error.is_none() {
            self.palette_error = remapping_error;
        }
        Ok(())
    }

    /// Remap the image writing one index row into each caller row.
    pub fn remap_into_rows(
        &mut self,
        image: &mut Image<'_>,
        rows: &mut [&mut [u8]],
    ) -> Result<(), Error> {
        let width = image.width();
        let height = image.height();
        if rows.len() < height || rows.iter().any(|r| r.len() < width) {
            return Err(Error::BufferTooSmall {
                len: rows.iter().map(|r| r.len()).sum(),
                required: width * height,
            });
        }

        let mut buffer = vec![0u8; width * height];
        self.remap_into(image, &mut buffer)?;
        for (dst, src) in rows.iter_mut().zip(buffer.chunks_exact(width)) {
            dst[..width].copy_from_slice(src);
        }
        Ok(())
    }

    /// Convenience remap: returns the integer palette and a fresh index
    /// plane.
    pub fn remapped(
        &mut self,
        image: &mut Image<'_>,
    ) -> Result<(Vec<RGBA8>, Vec<u8>), Error> {
        let mut buffer = vec![0u8; image.width() * image.height()];
        self.remap_into(image, &mut buffer)?;
        Ok((self.palette().to_vec(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_curve_is_monotonic() {
        let mut previous = quality_to_mse(100);
        for q in (0..100).rev() {
            let mse = quality_to_mse(q);
            assert!(mse > previous, "quality {q} should allow more error");
            previous = mse;
        }
        assert_eq!(quality_to_mse(0), MAX_DIFF);
    }

    #[test]
    fn setters_reject_out_of_range_without_changing_state() {
        let mut attr = Attributes::new();
        assert_eq!(
            attr.set_max_colors(1),
            Err(Error::ValueOutOfRange("max_colors"))
        );
        assert_eq!(
            attr.set_max_colors(257),
            Err(Error::ValueOutOfRange("max_colors"))
        );
        assert_eq!(attr.set_speed(0), Err(Error::ValueOutOfRange("speed")));
        assert_eq!(attr.set_speed(11), Err(Error::ValueOutOfRange("speed")));
        assert_eq!(
            attr.set_quality(50, 80),
            Err(Error::ValueOutOfRange("quality"))
        );
        assert_eq!(attr.max_colors, 256);
    }

    #[test]
    fn speed_derives_documented_tuning() {
        let mut attr = Attributes::new();

        attr.set_speed(1).unwrap();
        assert_eq!(attr.feedback_loop_trials, 47);
        assert_eq!(attr.kmeans_iterations, 7 + 7 * 7 / 2);
        assert!(attr.use_contrast_maps);
        assert!(attr.use_dither_map);
        assert_eq!(attr.min_posterization, 0);

        attr.set_speed(8).unwrap();
        assert_eq!(attr.feedback_loop_trials, 0);
        assert_eq!(attr.min_posterization, 1);
        assert!(!attr.use_contrast_maps);
        assert!(!attr.use_dither_map);
    }

    #[test]
    fn quality_sets_target_and_floor() {
        let mut attr = Attributes::new();
        attr.set_quality(80, 50).unwrap();
        assert!(attr.target_mse < attr.max_mse);
        attr.set_quality(70, 0).unwrap();
        assert_eq!(attr.max_mse, MAX_DIFF);
    }
}
