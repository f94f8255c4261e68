// ABOUTME: Converts downloaded images into formats the output deck can embed
// ABOUTME: Verifies native images decode and re-encodes foreign ones as opaque PNG

use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageError, ImageFormat, Rgb, RgbImage};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Extensions embedded as-is once they decode.
pub const NATIVE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Background used when flattening transparency.
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

pub fn is_native_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| NATIVE_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FormatNormalizer;

impl FormatNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Return a path to an embeddable version of the image at `path`, or
    /// `None` when the file is missing, corrupt or cannot be converted.
    pub fn normalize(&self, path: &Path) -> Option<PathBuf> {
        if !path.is_file() {
            debug!("Image file does not exist: {:?}", path);
            return None;
        }

        if is_native_extension(path) {
            return match decode(path) {
                Ok(_) => Some(path.to_path_buf()),
                Err(e) => {
                    warn!("{:?} has an image extension but does not decode: {}", path, e);
                    None
                }
            };
        }

        debug!("Converting {:?} to PNG", path);
        let image = match decode(path) {
            Ok(image) => image,
            Err(ImageError::Unsupported(e)) => {
                // No decoder for this format in this build; let the embed
                // step reject it.
                warn!("Cannot decode {:?} ({}), passing it through", path, e);
                return Some(path.to_path_buf());
            }
            Err(e) => {
                warn!("Failed to decode {:?}: {}", path, e);
                return None;
            }
        };

        let converted = flatten(image);
        let new_path = converted_path(path);
        match converted.save_with_format(&new_path, ImageFormat::Png) {
            Ok(()) => {
                debug!("Converted image written to {:?}", new_path);
                Some(new_path)
            }
            Err(e) => {
                warn!("Failed to write converted image {:?}: {}", new_path, e);
                None
            }
        }
    }
}

fn decode(path: &Path) -> image::ImageResult<DynamicImage> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

fn converted_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    path.with_file_name(format!("{}_converted.png", stem))
}

/// Composite alpha onto a white background; any other non-RGB, non-gray
/// layout becomes 8-bit RGB.
pub fn flatten(image: DynamicImage) -> DynamicImage {
    if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        let mut out = RgbImage::from_pixel(rgba.width(), rgba.height(), BACKGROUND);
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |fg: u8, bg: u8| -> u8 {
                ((u16::from(fg) * alpha + u16::from(bg) * (255 - alpha) + 127) / 255) as u8
            };
            out.put_pixel(
                x,
                y,
                Rgb([
                    blend(pixel[0], BACKGROUND[0]),
                    blend(pixel[1], BACKGROUND[1]),
                    blend(pixel[2], BACKGROUND[2]),
                ]),
            );
        }
        DynamicImage::ImageRgb8(out)
    } else {
        match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => image,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        }
    }
}
