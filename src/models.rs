use image::DynamicImage;

/// How an image record was obtained from its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Single,
    MultiPage,
}

/// One decoded unit of work.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Unique within a run. Pages are named `"{page}_{file name}"`.
    pub display_name: String,
    pub pixels: DynamicImage,
    pub source_kind: SourceKind,
}

impl ImageRecord {
    pub fn single(file_name: &str, pixels: DynamicImage) -> Self {
        Self {
            display_name: file_name.to_string(),
            pixels,
            source_kind: SourceKind::Single,
        }
    }

    pub fn page(page_index: usize, file_name: &str, pixels: DynamicImage) -> Self {
        Self {
            display_name: format!("{page_index}_{file_name}"),
            pixels,
            source_kind: SourceKind::MultiPage,
        }
    }

    /// File name the annotated image is written under.
    pub fn output_file_name(&self) -> String {
        format!("detected_{}", self.display_name)
    }
}

/// Connected pixel region covered by a flake.
#[derive(Debug, Clone, PartialEq)]
pub struct FlakeRegion {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    /// Member pixels. May be empty when a detector only reports a box.
    pub pixels: Vec<(u32, u32)>,
}

impl FlakeRegion {
    pub fn from_box(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            pixels: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.max_x.abs_diff(self.min_x) + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y.abs_diff(self.min_y) + 1
    }

    /// Top-left corner, whichever way round the detector reported the box.
    pub fn origin(&self) -> (u32, u32) {
        (self.min_x.min(self.max_x), self.min_y.min(self.max_y))
    }

    pub fn area(&self) -> u32 {
        if self.pixels.is_empty() {
            self.width() * self.height()
        } else {
            self.pixels.len() as u32
        }
    }

    pub fn center(&self) -> (u32, u32) {
        ((self.min_x + self.max_x) / 2, (self.min_y + self.max_y) / 2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flake {
    /// Material/thickness class name from the contrast model.
    pub class_name: String,
    /// Index of the class in the contrast model, used for colouring.
    pub class_index: usize,
    pub region: FlakeRegion,
    pub confidence: f32,
}

/// Flakes found in one image, in detector order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub flakes: Vec<Flake>,
}

impl DetectionResult {
    pub fn new(flakes: Vec<Flake>) -> Self {
        Self { flakes }
    }

    pub fn is_empty(&self) -> bool {
        self.flakes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flakes.len()
    }
}
