use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::BTreeMap;

use crate::models::FlakeRegion;

/// A labelled region together with the per-pixel values accumulated over it.
#[derive(Debug, Clone)]
pub struct LabelledRegion {
    pub region: FlakeRegion,
    pub value_sum: f64,
}

impl LabelledRegion {
    pub fn mean_value(&self) -> f64 {
        if self.region.pixels.is_empty() {
            0.0
        } else {
            self.value_sum / self.region.pixels.len() as f64
        }
    }
}

/// Find 8-connected regions of non-zero pixels in `mask`.
///
/// `values` holds one entry per pixel in row-major order and is summed per
/// region. Regions with fewer than `min_area` pixels are dropped. Output is
/// ordered by component label.
pub fn find_regions(mask: &GrayImage, values: &[f32], min_area: u32) -> Vec<LabelledRegion> {
    let width = mask.width();
    let labeled = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut regions: BTreeMap<u32, LabelledRegion> = BTreeMap::new();

    for (x, y, label) in labeled.enumerate_pixels() {
        let label_val = label[0];
        if label_val == 0 {
            continue; // Skip background
        }
        let value = values
            .get((y * width + x) as usize)
            .copied()
            .unwrap_or(0.0) as f64;

        regions
            .entry(label_val)
            .and_modify(|r| {
                r.region.min_x = r.region.min_x.min(x);
                r.region.min_y = r.region.min_y.min(y);
                r.region.max_x = r.region.max_x.max(x);
                r.region.max_y = r.region.max_y.max(y);
                r.region.pixels.push((x, y));
                r.value_sum += value;
            })
            .or_insert_with(|| LabelledRegion {
                region: FlakeRegion {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    pixels: vec![(x, y)],
                },
                value_sum: value,
            });
    }

    regions
        .into_values()
        .filter(|r| r.region.pixels.len() as u32 >= min_area)
        .collect()
}
