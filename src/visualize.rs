use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::models::{DetectionResult, Flake};

const CLASS_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([0, 200, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 200, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 220, 220]),
];

const FILL_ALPHA: f32 = 0.4;
const OUTLINE_THICKNESS: i32 = 2;

pub fn class_color(class_index: usize) -> Rgb<u8> {
    CLASS_COLORS[class_index % CLASS_COLORS.len()]
}

/// Draw every flake with confidence at least `confidence_threshold` onto a copy of `image`.
pub fn visualize_flakes(
    result: &DetectionResult,
    image: &DynamicImage,
    confidence_threshold: f32,
) -> DynamicImage {
    let mut canvas = image.to_rgb8();
    for flake in result
        .flakes
        .iter()
        .filter(|flake| flake.confidence >= confidence_threshold)
    {
        draw_flake(&mut canvas, flake);
    }
    DynamicImage::ImageRgb8(canvas)
}

fn draw_flake(canvas: &mut RgbImage, flake: &Flake) {
    let color = class_color(flake.class_index);
    let (width, height) = canvas.dimensions();

    for &(x, y) in &flake.region.pixels {
        if x < width && y < height {
            let px = canvas.get_pixel_mut(x, y);
            for c in 0..3 {
                px[c] = (px[c] as f32 * (1.0 - FILL_ALPHA) + color[c] as f32 * FILL_ALPHA) as u8;
            }
        }
    }

    let region = &flake.region;
    let (left, top) = region.origin();
    for thickness in 0..OUTLINE_THICKNESS {
        let rect = Rect::at(left as i32 - thickness, top as i32 - thickness)
            .of_size(
                region.width() + (2 * thickness) as u32,
                region.height() + (2 * thickness) as u32,
            );
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Write the annotated image as `output_dir/file_name`.
pub fn persist(image: &DynamicImage, output_dir: &Path, file_name: &str) -> anyhow::Result<PathBuf> {
    let path = output_dir.join(file_name);
    image
        .save(&path)
        .map_err(|e| anyhow::anyhow!("Failed to save {}: {}", path.display(), e))?;
    Ok(path)
}
