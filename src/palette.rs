use rgb::RGBA8;

use crate::color::{to_rgb, FPixel, GammaLut};

pub(crate) const MAX_COLORS: usize = 256;

/// One palette color in linear space, in the same gamma-linear space as
/// histogram entries.
#[derive(Debug, Clone)]
pub(crate) struct MapEntry {
    pub color: FPixel,
    pub popularity: f32,
    /// Fixed entries are never moved by refinement.
    pub fixed: bool,
}

/// Ordered working palette. Insertion order is the output order until
/// `sort_palette` runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct Colormap {
    entries: Vec<MapEntry>,
}

impl Colormap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: MapEntry) {
        debug_assert!(self.entries.len() < MAX_COLORS);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [MapEntry] {
        &mut self.entries
    }
}

/// Produce the integer palette under `gamma`, writing the re-linearized
/// rounded value back into the colormap.
///
/// The write-back makes remapping compare pixels against exactly the colors
/// the encoder will emit, removing the rounding mismatch between palette and
/// index plane. Rounding an already-rounded color is a no-op, so this is
/// safe to run once per remap.
pub(crate) fn rounded_palette(map: &mut Colormap, gamma: f64) -> Vec<RGBA8> {
    let lut = GammaLut::new(gamma);
    map.entries
        .iter_mut()
        .map(|entry| {
            let px = to_rgb(gamma, entry.color);
            entry.color = lut.to_f(px);
            px
        })
        .collect()
}

/// Order palette entries for output.
///
/// With `last_index_transparent`, a fully transparent entry moves to the
/// final slot and the prefix sorts by descending popularity. Otherwise all
/// not-fully-opaque entries cluster at the front (stable, so an encoder can
/// truncate its alpha table after the last non-opaque entry), each group
/// sorted by descending popularity.
pub(crate) fn sort_palette(map: &mut Colormap, last_index_transparent: bool) {
    let entries = &mut map.entries;

    if last_index_transparent {
        if let Some(pos) = entries.iter().position(|e| e.color.a < 1.0 / 256.0) {
            let last = entries.len() - 1;
            entries.swap(pos, last);
            let (head, _) = entries.split_at_mut(last);
            head.sort_by(|x, y| y.popularity.total_cmp(&x.popularity));
            return;
        }
    }

    entries.sort_by(|x, y| {
        let x_opaque = x.color.a >= 255.0 / 256.0;
        let y_opaque = y.color.a >= 255.0 / 256.0;
        x_opaque
            .cmp(&y_opaque)
            .then(y.popularity.total_cmp(&x.popularity))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(a: f32, popularity: f32) -> MapEntry {
        MapEntry {
            color: FPixel::new(0.5, 0.5, 0.5, a),
            popularity,
            fixed: false,
        }
    }

    #[test]
    fn transparent_entries_cluster_at_front() {
        let mut map = Colormap::new();
        map.push(entry(1.0, 5.0));
        map.push(entry(0.5, 1.0));
        map.push(entry(1.0, 2.0));
        map.push(entry(0.0, 3.0));
        sort_palette(&mut map, false);

        let alphas: Vec<f32> = map.entries().iter().map(|e| e.color.a).collect();
        assert!(alphas[0] < 1.0 && alphas[1] < 1.0);
        assert!(alphas[2] >= 1.0 && alphas[3] >= 1.0);
        // Descending popularity inside each group.
        assert!(map.entries()[0].popularity >= map.entries()[1].popularity);
        assert!(map.entries()[2].popularity >= map.entries()[3].popularity);
    }

    #[test]
    fn last_index_transparent_moves_entry_to_tail() {
        let mut map = Colormap::new();
        map.push(entry(0.0, 9.0));
        map.push(entry(1.0, 1.0));
        map.push(entry(1.0, 4.0));
        sort_palette(&mut map, true);

        let last = map.entries().last().unwrap();
        assert!(last.color.a < 1.0 / 256.0);
        assert!(map.entries()[0].popularity >= map.entries()[1].popularity);
    }

    #[test]
    fn last_index_transparent_without_transparency_falls_back() {
        let mut map = Colormap::new();
        map.push(entry(1.0, 1.0));
        map.push(entry(0.5, 2.0));
        sort_palette(&mut map, true);
        // No fully transparent entry: normal front-clustering applies.
        assert!(map.entries()[0].color.a < 1.0);
    }

    #[test]
    fn rounding_writeback_is_idempotent() {
        let gamma = 0.45455;
        let mut map = Colormap::new();
        map.push(entry(1.0, 1.0));
        map.entries_mut()[0].color = FPixel::new(0.3137, 0.723, 0.011, 1.0);

        let first = rounded_palette(&mut map, gamma);
        let second = rounded_palette(&mut map, gamma);
        assert_eq!(first, second);
    }

}
