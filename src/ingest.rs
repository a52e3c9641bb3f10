//! Turns source files into decoded image records.
//!
//! Still images yield one record named after the file. Multi-page TIFF and
//! GIF files yield one record per page, named `"{page}_{file name}"`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageBuffer, ImageReader};
use thiserror::Error;
use tiff::decoder::{Decoder as TiffDecoder, DecodingResult};
use tracing::{debug, warn};

use crate::models::ImageRecord;

/// OS metadata files that never enter the work queue.
pub const HOUSEKEEPING_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".localized"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Still,
    MultiPage,
    Unsupported,
}

const EXTENSION_KINDS: &[(&str, FileKind)] = &[
    ("png", FileKind::Still),
    ("jpg", FileKind::Still),
    ("jpeg", FileKind::Still),
    ("bmp", FileKind::Still),
    ("tif", FileKind::MultiPage),
    ("tiff", FileKind::MultiPage),
    ("gif", FileKind::MultiPage),
];

/// Why a source file produced no records.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported file type")]
    Unsupported,
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("cannot decode tiff: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("unsupported tiff pixel layout {0:?}")]
    TiffLayout(tiff::ColorType),
    #[error("file contains no pages")]
    NoPages,
}

/// Look up the kind of a file by its extension. Unknown extensions are unsupported.
pub fn classify(path: &Path) -> FileKind {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return FileKind::Unsupported;
    };
    let ext = ext.to_ascii_lowercase();
    EXTENSION_KINDS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, kind)| *kind)
        .unwrap_or(FileKind::Unsupported)
}

pub fn is_housekeeping(file_name: &str) -> bool {
    HOUSEKEEPING_FILE_NAMES.contains(&file_name) || file_name.starts_with("._")
}

/// Files found in a source directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceListing {
    /// Candidate sources in lexical order.
    pub sources: Vec<PathBuf>,
    /// Housekeeping files left out of `sources`.
    pub housekeeping: Vec<PathBuf>,
}

/// List the files of `dir` in lexical order, setting housekeeping files aside.
/// Subdirectories are ignored.
pub fn list_sources(dir: &Path) -> std::io::Result<SourceListing> {
    let mut listing = SourceListing::default();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if is_housekeeping(&entry.file_name().to_string_lossy()) {
            debug!("Ignoring housekeeping file {}", entry.path().display());
            listing.housekeeping.push(entry.path());
            continue;
        }
        listing.sources.push(entry.path());
    }
    listing.sources.sort();
    listing.housekeeping.sort();
    Ok(listing)
}

/// Decode one source file into its image records.
pub fn ingest_file(path: &Path) -> Result<Vec<ImageRecord>, IngestError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match classify(path) {
        FileKind::Still => {
            let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
            Ok(vec![ImageRecord::single(&file_name, img)])
        }
        FileKind::MultiPage => {
            let pages = decode_pages(path)?;
            debug!("Decoded {} pages from {}", pages.len(), file_name);
            Ok(pages
                .into_iter()
                .enumerate()
                .map(|(idx, img)| ImageRecord::page(idx, &file_name, img))
                .collect())
        }
        FileKind::Unsupported => Err(IngestError::Unsupported),
    }
}

fn decode_pages(path: &Path) -> Result<Vec<DynamicImage>, IngestError> {
    let is_gif = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gif"));
    if is_gif {
        decode_gif_frames(path)
    } else {
        decode_tiff_pages(path)
    }
}

fn decode_tiff_pages(path: &Path) -> Result<Vec<DynamicImage>, IngestError> {
    let mut decoder = TiffDecoder::new(BufReader::new(File::open(path)?))?;
    let mut pages = Vec::new();

    loop {
        match read_tiff_page(&mut decoder) {
            Ok(page) => pages.push(page),
            // A damaged trailing page keeps the pages decoded before it
            Err(e) if !pages.is_empty() => {
                warn!("Stopping at page {} of {}: {}", pages.len(), path.display(), e);
                break;
            }
            Err(e) => return Err(e),
        }
        if !decoder.more_images() {
            break;
        }
        if let Err(e) = decoder.next_image() {
            warn!("Stopping at page {} of {}: {}", pages.len(), path.display(), e);
            break;
        }
    }

    Ok(pages)
}

fn read_tiff_page<R: std::io::Read + std::io::Seek>(
    decoder: &mut TiffDecoder<R>,
) -> Result<DynamicImage, IngestError> {
    use tiff::ColorType;

    let (width, height) = decoder.dimensions()?;
    let color = decoder.colortype()?;
    let data = decoder.read_image()?;

    let img = match (color, data) {
        (ColorType::Gray(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
        }
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma16)
        }
        (ColorType::RGB(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb16)
        }
        (ColorType::RGBA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba16)
        }
        (other, _) => return Err(IngestError::TiffLayout(other)),
    };

    img.ok_or(IngestError::TiffLayout(color))
}

fn decode_gif_frames(path: &Path) -> Result<Vec<DynamicImage>, IngestError> {
    let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
    let mut pages = Vec::new();

    for frame in decoder.into_frames() {
        match frame {
            Ok(frame) => pages.push(DynamicImage::ImageRgba8(frame.into_buffer())),
            Err(e) if !pages.is_empty() => {
                warn!("Stopping at frame {} of {}: {}", pages.len(), path.display(), e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if pages.is_empty() {
        return Err(IngestError::NoPages);
    }
    Ok(pages)
}
