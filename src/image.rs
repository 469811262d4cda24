use rgb::RGBA8;

use crate::color::GammaLut;
use crate::contrast;
use crate::error::Error;
use crate::Attributes;

/// Gamma assumed when the caller passes 0 ("sRGB-like", 1/2.2 as storable).
pub(crate) const DEFAULT_GAMMA: f64 = 0.45455;

fn validate_geometry(width: usize, height: usize, gamma: f64) -> Result<(), Error> {
    if width < 1 || height < 1 {
        return Err(Error::ValueOutOfRange("dimensions"));
    }
    if !(0.0..=1.0).contains(&gamma) {
        return Err(Error::ValueOutOfRange("gamma"));
    }
    Ok(())
}

/// Pixel storage: either an owned contiguous bitmap or borrowed row slices.
/// Rows need not be contiguous in the borrowed case; freeing follows the tag.
enum PixelStore<'pixels> {
    Owned(Vec<RGBA8>),
    BorrowedRows(Vec<&'pixels [RGBA8]>),
}

/// An RGBA input image with its gamma and the importance maps derived from it.
///
/// The noise map is consumed by histogram construction; the edges and dither
/// maps outlive `quantize` and steer dithered remapping.
pub struct Image<'pixels> {
    width: usize,
    height: usize,
    gamma: f64,
    store: PixelStore<'pixels>,
    pub(crate) noise: Option<Vec<f32>>,
    pub(crate) edges: Option<Vec<f32>>,
    pub(crate) dither_map: Option<Vec<f32>>,
}

impl<'pixels> Image<'pixels> {
    /// Wrap an owned contiguous row-major bitmap.
    ///
    /// `gamma` must lie in (0, 1]; 0 selects the sRGB-like default.
    pub fn new(
        attr: &Attributes,
        pixels: Vec<RGBA8>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        validate_geometry(width, height, gamma)?;
        if pixels.len() != width * height {
            return Err(Error::BufferTooSmall {
                len: pixels.len(),
                required: width * height,
            });
        }
        Self::from_store(attr, PixelStore::Owned(pixels), width, height, gamma)
    }

    /// Wrap borrowed rows, which may live anywhere (e.g. one slice per
    /// scanline of a decoder's buffer).
    pub fn new_borrowed_rows(
        attr: &Attributes,
        rows: Vec<&'pixels [RGBA8]>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        validate_geometry(width, height, gamma)?;
        if rows.len() != height || rows.iter().any(|r| r.len() != width) {
            return Err(Error::ValueOutOfRange("rows"));
        }
        Self::from_store(attr, PixelStore::BorrowedRows(rows), width, height, gamma)
    }

    fn from_store(
        attr: &Attributes,
        store: PixelStore<'pixels>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        let mut image = Self {
            width,
            height,
            gamma: if gamma == 0.0 { DEFAULT_GAMMA } else { gamma },
            store,
            noise: None,
            edges: None,
            dither_map: None,
        };

        let min_opaque = attr.min_opaque_val();
        if min_opaque > 0.0 && min_opaque <= 254.0 / 255.0 {
            attr.verbose(|| "  nudging almost-opaque colors to full opacity...".into());
            image.modify_alpha(min_opaque);
        }

        if attr.use_contrast_maps() && width >= 4 && height >= 4 {
            let (noise, edges) = contrast::contrast_maps(&image);
            image.noise = Some(noise);
            image.edges = Some(edges);
        }

        Ok(image)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub(crate) fn gamma(&self) -> f64 {
        self.gamma
    }

    pub(crate) fn row(&self, y: usize) -> &[RGBA8] {
        match &self.store {
            PixelStore::Owned(pixels) => &pixels[y * self.width..(y + 1) * self.width],
            PixelStore::BorrowedRows(rows) => rows[y],
        }
    }

    pub(crate) fn noise(&self) -> Option<&[f32]> {
        self.noise.as_deref()
    }

    pub(crate) fn edges(&self) -> Option<&[f32]> {
        self.edges.as_deref()
    }

    pub(crate) fn dither_map(&self) -> Option<&[f32]> {
        self.dither_map.as_deref()
    }

    /// Promote the (already shaped) edges plane to the dither map.
    pub(crate) fn set_dither_map(&mut self, map: Vec<f32>) {
        self.dither_map = Some(map);
        self.edges = None;
    }

    /// Copy borrowed rows into an owned bitmap so pixels can be rewritten.
    fn make_owned(&mut self) {
        if let PixelStore::BorrowedRows(rows) = &self.store {
            let mut pixels = Vec::with_capacity(self.width * self.height);
            for row in rows {
                pixels.extend_from_slice(row);
            }
            self.store = PixelStore::Owned(pixels);
        }
    }

    /// Clients that round low alpha to fully-transparent (notably old IE)
    /// show any slight transparency as a hole. Push alphas at or above the
    /// threshold toward opaque, raising them linearly to avoid a visible
    /// step between modified and untouched pixels.
    fn modify_alpha(&mut self, min_opaque_val: f32) {
        self.make_owned();
        let gamma = self.gamma;
        let lut = GammaLut::new(gamma);

        let almost_opaque_val = min_opaque_val * 169.0 / 256.0;
        let almost_opaque_val_int = (almost_opaque_val * 255.0) as u8;

        let PixelStore::Owned(pixels) = &mut self.store else {
            unreachable!();
        };
        for px in pixels.iter_mut() {
            if px.a >= almost_opaque_val_int {
                let fa = lut.to_f(*px).a;
                let al = almost_opaque_val
                    + (fa - almost_opaque_val) * (1.0 - almost_opaque_val)
                        / (min_opaque_val - almost_opaque_val);
                px.a = if al >= 1.0 { 255 } else { (al * 256.0) as u8 };
            }
        }
    }
}
