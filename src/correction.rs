use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, Rgb, RgbImage};

use crate::error::PipelineError;

/// Target brightness of the corrected background.
pub const MAX_BACKGROUND_VALUE: f32 = 241.0;

/// Load the flatfield reference image for a run.
pub fn load_flatfield(path: &Path) -> Result<RgbImage, PipelineError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| PipelineError::FlatfieldLoad {
            path: path.to_path_buf(),
            source: Some(image::ImageError::IoError(e)),
        })?;
    let img = reader.decode().map_err(|e| PipelineError::FlatfieldLoad {
        path: path.to_path_buf(),
        source: Some(e),
    })?;
    Ok(img.to_rgb8())
}

/// Divide the sample by the flatfield to cancel uneven illumination.
///
/// The flatfield is resized to the sample when their dimensions differ.
pub fn remove_vignette(image: &DynamicImage, flatfield: &RgbImage) -> DynamicImage {
    let sample = image.to_rgb8();
    let (width, height) = sample.dimensions();

    let resized;
    let field = if flatfield.dimensions() == (width, height) {
        flatfield
    } else {
        resized = imageops::resize(flatfield, width, height, FilterType::Triangle);
        &resized
    };

    let corrected = RgbImage::from_fn(width, height, |x, y| {
        let px = sample.get_pixel(x, y);
        let ff = field.get_pixel(x, y);
        Rgb(std::array::from_fn(|c| correct_channel(px[c], ff[c])))
    });

    DynamicImage::ImageRgb8(corrected)
}

fn correct_channel(sample: u8, flat: u8) -> u8 {
    let value = sample as f32 / (flat.max(1) as f32) * MAX_BACKGROUND_VALUE;
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_maps_to_target_value() {
        assert_eq!(correct_channel(200, 200), 241);
        assert_eq!(correct_channel(100, 200), 121);
        assert_eq!(correct_channel(255, 10), 255);
        assert_eq!(correct_channel(0, 0), 0);
    }

    #[test]
    fn uneven_illumination_is_flattened() {
        // Left half lit at 100, right half at 200, same material
        let sample = RgbImage::from_fn(4, 2, |x, _| if x < 2 { Rgb([100; 3]) } else { Rgb([200; 3]) });
        let corrected = remove_vignette(&DynamicImage::ImageRgb8(sample.clone()), &sample).to_rgb8();
        assert!(corrected.pixels().all(|p| p.0 == [241; 3]));
    }

    #[test]
    fn flatfield_is_resized_to_sample() {
        let sample = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([120; 3])));
        let field = RgbImage::from_pixel(2, 2, Rgb([120; 3]));
        let corrected = remove_vignette(&sample, &field);
        assert_eq!((corrected.width(), corrected.height()), (8, 6));
        assert_eq!(corrected.to_rgb8().get_pixel(3, 3).0, [241; 3]);
    }

    #[test]
    fn missing_flatfield_is_a_load_error() {
        let err = load_flatfield(Path::new("/nonexistent/flatfield.png")).unwrap_err();
        assert!(matches!(err, PipelineError::FlatfieldLoad { .. }));
    }
}
