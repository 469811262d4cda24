use palquant::{Attributes, Error, Image, RGBA8};

#[test]
fn single_color_image_is_lossless() {
    let attr = {
        let mut a = Attributes::new();
        a.set_max_colors(2).unwrap();
        a
    };
    let red = RGBA8::new(255, 0, 0, 255);
    let mut img = Image::new(&attr, vec![red; 4], 2, 2, 0.0).unwrap();

    let mut result = attr.quantize(&mut img).unwrap();
    let (palette, indices) = result.remapped(&mut img).unwrap();

    assert_eq!(palette.len(), 1);
    assert_eq!(palette[0], red);
    assert!(indices.iter().all(|&i| i == 0));
    assert_eq!(result.remapping_error(), Some(0.0));
}

#[test]
fn transparent_color_lands_in_last_slot_when_requested() {
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    attr.set_last_index_transparent(true);

    let pixels = vec![
        RGBA8::new(0, 0, 0, 0),
        RGBA8::new(255, 0, 0, 255),
        RGBA8::new(0, 255, 0, 255),
        RGBA8::new(0, 0, 255, 255),
    ];
    let mut img = Image::new(&attr, pixels, 2, 2, 0.0).unwrap();

    let mut result = attr.quantize(&mut img).unwrap();
    let (palette, indices) = result.remapped(&mut img).unwrap();

    assert_eq!(palette.len(), 4);
    assert!(palette[3].a < 1);
    assert_eq!(indices[0], 3);
    for &i in &indices[1..] {
        assert_ne!(i, 3);
    }
}

#[test]
fn transparent_colors_cluster_at_front_by_default() {
    let attr = Attributes::new();
    let mut pixels = Vec::new();
    for i in 0..64u8 {
        let a = if i % 8 == 0 { 0 } else { 255 };
        pixels.push(RGBA8::new(i * 4, 0, 0, a));
    }
    let mut img = Image::new(&attr, pixels, 8, 8, 0.0).unwrap();

    let mut result = attr.quantize(&mut img).unwrap();
    let palette = result.palette().to_vec();

    // No fully-opaque entry may precede a non-opaque one.
    let first_opaque = palette
        .iter()
        .position(|px| px.a == 255)
        .unwrap_or(palette.len());
    for px in &palette[first_opaque..] {
        assert_eq!(px.a, 255);
    }

    // The alpha table covers exactly the non-opaque prefix.
    let table = result.alpha_table().unwrap();
    assert_eq!(table.len(), first_opaque);
}

#[test]
fn alpha_table_is_omitted_for_opaque_images() {
    let attr = Attributes::new();
    let mut img = Image::new(&attr, vec![RGBA8::new(1, 2, 3, 255); 16], 4, 4, 0.0).unwrap();
    let mut result = attr.quantize(&mut img).unwrap();
    assert_eq!(result.alpha_table(), None);
}

#[test]
fn remap_rejects_short_buffer() {
    let attr = Attributes::new();
    let mut img = Image::new(&attr, vec![RGBA8::new(9, 9, 9, 255); 4], 2, 2, 0.0).unwrap();
    let mut result = attr.quantize(&mut img).unwrap();

    let mut too_small = [0u8; 3];
    assert_eq!(
        result.remap_into(&mut img, &mut too_small),
        Err(Error::BufferTooSmall {
            len: 3,
            required: 4
        })
    );
}

#[test]
fn remap_into_rows_matches_contiguous_output() {
    let attr = Attributes::new();
    let pixels: Vec<RGBA8> = (0..16)
        .map(|i| RGBA8::new((i * 16) as u8, 0, 0, 255))
        .collect();
    let mut img = Image::new(&attr, pixels, 4, 4, 0.0).unwrap();

    let mut result = attr.quantize(&mut img).unwrap();
    result.set_dithering_level(0.0).unwrap();

    let mut contiguous = vec![0u8; 16];
    result.remap_into(&mut img, &mut contiguous).unwrap();

    let mut backing = vec![0u8; 16];
    {
        let mut rows: Vec<&mut [u8]> = backing.chunks_mut(4).collect();
        result.remap_into_rows(&mut img, &mut rows).unwrap();
    }
    assert_eq!(backing, contiguous);
}

#[test]
fn borrowed_rows_quantize_like_owned_pixels() {
    let attr = Attributes::new();
    let rows_data: Vec<Vec<RGBA8>> = (0..4)
        .map(|y| {
            (0..4)
                .map(|x| RGBA8::new((x * 60) as u8, (y * 60) as u8, 0, 255))
                .collect()
        })
        .collect();

    let borrowed: Vec<&[RGBA8]> = rows_data.iter().map(|r| r.as_slice()).collect();
    let mut img_rows = Image::new_borrowed_rows(&attr, borrowed, 4, 4, 0.0).unwrap();

    let owned: Vec<RGBA8> = rows_data.iter().flatten().copied().collect();
    let mut img_owned = Image::new(&attr, owned, 4, 4, 0.0).unwrap();

    let mut a = attr.quantize(&mut img_rows).unwrap();
    let mut b = attr.quantize(&mut img_owned).unwrap();
    assert_eq!(
        a.remapped(&mut img_rows).unwrap(),
        b.remapped(&mut img_owned).unwrap()
    );
}

#[test]
fn result_setters_validate_at_the_boundary() {
    let attr = Attributes::new();
    let mut img = Image::new(&attr, vec![RGBA8::new(0, 0, 0, 255); 4], 2, 2, 0.0).unwrap();
    let mut result = attr.quantize(&mut img).unwrap();

    assert_eq!(
        result.set_dithering_level(1.5),
        Err(Error::ValueOutOfRange("dither_level"))
    );
    assert_eq!(
        result.set_dithering_level(-0.1),
        Err(Error::ValueOutOfRange("dither_level"))
    );
    assert_eq!(
        result.set_output_gamma(1.0),
        Err(Error::ValueOutOfRange("output_gamma"))
    );
    assert_eq!(
        result.set_output_gamma(0.0),
        Err(Error::ValueOutOfRange("output_gamma"))
    );
    assert_eq!(result.output_gamma(), 0.45455);

    result.set_dithering_level(0.5).unwrap();
    result.set_output_gamma(0.5).unwrap();
}

#[test]
fn image_getters_report_dimensions() {
    let attr = Attributes::new();
    let img = Image::new(&attr, vec![RGBA8::new(0, 0, 0, 255); 6], 3, 2, 0.0).unwrap();
    assert_eq!(img.width(), 3);
    assert_eq!(img.height(), 2);
}

#[test]
fn attributes_can_be_cloned_and_reused() {
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let copy = attr.clone();

    let mut img = Image::new(&copy, vec![RGBA8::new(1, 2, 3, 255); 4], 2, 2, 0.0).unwrap();
    let mut result = copy.quantize(&mut img).unwrap();
    assert!(result.palette().len() <= 8);
}
