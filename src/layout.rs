// ABOUTME: Slide layout templates and placement geometry
// ABOUTME: Picks a template that differs from the previous slide and places images and text

use crate::errors::Result;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

pub const TEMPLATE_COUNT: usize = 12;

/// Transparency used for text boxes unless a template asks for less.
pub const DEFAULT_TEXT_TRANSPARENCY: f64 = 0.15;

/// A rectangle in slide units (EMU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub cx: i64,
    pub cy: i64,
}

impl Rect {
    pub fn new(x: i64, y: i64, cx: i64, cy: i64) -> Self {
        Self { x, y, cx, cy }
    }
}

/// A region expressed as fractions of the slide's width and height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

const fn region(x: f64, y: f64, w: f64, h: f64) -> Region {
    Region { x, y, w, h }
}

impl Region {
    pub fn to_rect(self, slide_cx: i64, slide_cy: i64) -> Rect {
        let (w, h) = (slide_cx as f64, slide_cy as f64);
        Rect::new(
            (self.x * w).round() as i64,
            (self.y * h).round() as i64,
            (self.w * w).round() as i64,
            (self.h * h).round() as i64,
        )
    }
}

/// Fixed recipe for one slide design.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Template {
    pub name: &'static str,
    pub primary: Region,
    pub secondary: Region,
    pub text: Region,
    pub text_transparency: f64,
    /// Draw a white frame over each image region.
    pub framed: bool,
}

const fn template(
    name: &'static str,
    primary: Region,
    secondary: Region,
    text: Region,
    text_transparency: f64,
) -> Template {
    Template {
        name,
        primary,
        secondary,
        text,
        text_transparency,
        framed: false,
    }
}

pub const TEMPLATES: [Template; TEMPLATE_COUNT] = [
    template(
        "split overlap",
        region(0.0, 0.0, 0.6, 1.0),
        region(0.4, 0.0, 0.6, 1.0),
        region(0.125, 0.2, 0.75, 0.35),
        0.1,
    ),
    template(
        "top and bottom",
        region(0.0, 0.0, 1.0, 0.55),
        region(0.0, 0.45, 1.0, 0.55),
        region(0.1, 0.38, 0.8, 0.24),
        0.1,
    ),
    template(
        "diagonal",
        region(0.0, 0.0, 0.7, 0.7),
        region(0.3, 0.3, 0.7, 0.7),
        region(0.15, 0.32, 0.7, 0.32),
        0.1,
    ),
    template(
        "center focus",
        region(0.15, 0.15, 0.7, 0.7),
        region(0.7, 0.05, 0.25, 0.25),
        region(0.2, 0.75, 0.6, 0.2),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "quadrants",
        region(0.0, 0.0, 0.5, 0.5),
        region(0.5, 0.5, 0.5, 0.5),
        region(0.2, 0.4, 0.6, 0.2),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "large left",
        region(0.0, 0.0, 0.65, 1.0),
        region(0.68, 0.1, 0.3, 0.4),
        region(0.68, 0.55, 0.3, 0.35),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "large top",
        region(0.0, 0.0, 1.0, 0.65),
        region(0.1, 0.68, 0.4, 0.3),
        region(0.55, 0.68, 0.4, 0.3),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "collage",
        region(0.1, 0.1, 0.5, 0.6),
        region(0.4, 0.3, 0.5, 0.6),
        region(0.15, 0.72, 0.7, 0.25),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "full bleed overlay",
        region(0.0, 0.0, 1.0, 1.0),
        region(0.3, 0.2, 0.7, 0.6),
        region(0.1, 0.72, 0.8, 0.24),
        0.1,
    ),
    template(
        "grid",
        region(0.05, 0.05, 0.45, 0.45),
        region(0.5, 0.5, 0.45, 0.45),
        region(0.2, 0.7, 0.6, 0.25),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    template(
        "slanted split",
        region(0.0, 0.0, 0.55, 1.0),
        region(0.45, 0.1, 0.55, 0.8),
        region(0.5, 0.1, 0.45, 0.3),
        DEFAULT_TEXT_TRANSPARENCY,
    ),
    Template {
        name: "picture frames",
        primary: region(0.15, 0.1, 0.35, 0.5),
        secondary: region(0.5, 0.1, 0.35, 0.5),
        text: region(0.2, 0.65, 0.6, 0.3),
        text_transparency: DEFAULT_TEXT_TRANSPARENCY,
        framed: true,
    },
];

/// Template lookup; out-of-range ids fall back to the first template.
pub fn template_for(id: usize) -> &'static Template {
    TEMPLATES.get(id).unwrap_or(&TEMPLATES[0])
}

/// Chooses templates so that consecutive slides never share one.
///
/// The generator is reseeded from the deck's slide count on every call, so a
/// given deck always gets the same sequence.
#[derive(Debug, Default, Clone)]
pub struct TemplateSelector {
    previous: Option<usize>,
}

impl TemplateSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<usize> {
        self.previous
    }

    pub fn select(&mut self, slide_count: usize) -> usize {
        let available: Vec<usize> = (0..TEMPLATE_COUNT)
            .filter(|id| Some(*id) != self.previous)
            .collect();
        let seed = (slide_count as u64).wrapping_mul(7).wrapping_add(13);
        let mut rng = StdRng::seed_from_u64(seed);
        let id = *available.choose(&mut rng).unwrap_or(&0);
        self.previous = Some(id);
        id
    }
}

/// Scale a `src_w`×`src_h` image to the largest size that fits inside
/// `target` without distortion, centered in it.
pub fn fit_within(src_w: u32, src_h: u32, target: Rect) -> Rect {
    if src_w == 0 || src_h == 0 {
        return target;
    }
    let scale_w = target.cx as f64 / f64::from(src_w);
    let scale_h = target.cy as f64 / f64::from(src_h);
    let scale = scale_w.min(scale_h);

    let cx = (f64::from(src_w) * scale).round() as i64;
    let cy = (f64::from(src_h) * scale).round() as i64;
    Rect::new(
        target.x + (target.cx - cx) / 2,
        target.y + (target.cy - cy) / 2,
        cx,
        cy,
    )
}

/// Look of the text overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBoxStyle {
    pub fill_rgb: [u8; 3],
    pub transparency: f64,
    pub border_rgb: [u8; 3],
    pub border_pt: f64,
    pub font_pt: f64,
    pub bold: bool,
    pub text_rgb: [u8; 3],
}

impl TextBoxStyle {
    pub fn with_transparency(transparency: f64) -> Self {
        Self {
            transparency,
            ..Self::default()
        }
    }
}

impl Default for TextBoxStyle {
    fn default() -> Self {
        Self {
            fill_rgb: [255, 255, 255],
            transparency: DEFAULT_TEXT_TRANSPARENCY,
            border_rgb: [50, 50, 50],
            border_pt: 4.0,
            font_pt: 40.0,
            bold: true,
            text_rgb: [20, 20, 20],
        }
    }
}

/// The slide operations the layout engine needs from a document.
pub trait SlideCanvas {
    /// Remove pictures, shapes, text boxes and placeholders. Returns how many
    /// were removed.
    fn clear_content(&mut self) -> usize;

    /// Place an image in `rect`, beneath every other shape on the slide.
    fn add_picture(&mut self, image: &Path, rect: Rect) -> Result<()>;

    fn add_text_box(&mut self, rect: Rect, text: &str, style: &TextBoxStyle) -> Result<()>;

    /// Unfilled white border around `rect`.
    fn add_frame(&mut self, rect: Rect) -> Result<()>;
}

/// Clear the slide and lay out up to two images plus one text box using
/// template `id`. Each image keeps its aspect ratio inside its region.
pub fn apply_template<C: SlideCanvas + ?Sized>(
    canvas: &mut C,
    id: usize,
    slide_size: (i64, i64),
    images: &[&Path],
    text: &str,
) -> Result<()> {
    let template = template_for(id);
    let (slide_cx, slide_cy) = slide_size;
    debug!("Applying template {} ({})", id, template.name);

    let removed = canvas.clear_content();
    debug!("Removed {} existing shapes", removed);

    let regions = [template.primary, template.secondary];
    // Each picture lands beneath those already placed, so the first stays on top.
    for (image, region) in images.iter().zip(regions.iter()) {
        let target = region.to_rect(slide_cx, slide_cy);
        let (w, h) = image::image_dimensions(image)?;
        canvas.add_picture(image, fit_within(w, h, target))?;
    }

    if template.framed {
        for region in regions.iter().take(images.len()) {
            canvas.add_frame(region.to_rect(slide_cx, slide_cy))?;
        }
    }

    let style = TextBoxStyle::with_transparency(template.text_transparency);
    canvas.add_text_box(template.text.to_rect(slide_cx, slide_cy), text, &style)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq)]
    enum Op {
        Clear,
        Picture(PathBuf, Rect),
        Text(Rect, String, f64),
        Frame(Rect),
    }

    #[derive(Default)]
    struct RecordingCanvas {
        ops: Vec<Op>,
    }

    impl SlideCanvas for RecordingCanvas {
        fn clear_content(&mut self) -> usize {
            self.ops.push(Op::Clear);
            0
        }

        fn add_picture(&mut self, image: &Path, rect: Rect) -> Result<()> {
            self.ops.push(Op::Picture(image.to_path_buf(), rect));
            Ok(())
        }

        fn add_text_box(&mut self, rect: Rect, text: &str, style: &TextBoxStyle) -> Result<()> {
            self.ops.push(Op::Text(rect, text.to_string(), style.transparency));
            Ok(())
        }

        fn add_frame(&mut self, rect: Rect) -> Result<()> {
            self.ops.push(Op::Frame(rect));
            Ok(())
        }
    }

    fn write_image(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(w, h, Rgb([1, 2, 3])).save(&path).unwrap();
        path
    }

    #[test]
    fn square_image_fills_height_of_wide_box_and_is_centered() {
        let placed = fit_within(1000, 1000, Rect::new(0, 0, 400, 200));
        assert_eq!(placed, Rect::new(100, 0, 200, 200));
    }

    #[test]
    fn fit_never_exceeds_the_box() {
        for (w, h) in [(1920, 1080), (300, 1200), (7, 3), (1, 1)] {
            let target = Rect::new(50, 60, 640, 480);
            let placed = fit_within(w, h, target);
            assert!(placed.cx <= target.cx && placed.cy <= target.cy);
            assert!(placed.cx >= target.cx - 1 || placed.cy >= target.cy - 1);
            assert!(placed.x >= target.x && placed.y >= target.y);
        }
    }

    #[test]
    fn selector_never_repeats_consecutively() {
        let mut selector = TemplateSelector::new();
        for slide_count in [1usize, 2, 5, 12, 40] {
            let mut last = None;
            for _ in 0..50 {
                let id = selector.select(slide_count);
                assert!(id < TEMPLATE_COUNT);
                assert_ne!(Some(id), last);
                last = Some(id);
            }
        }
    }

    #[test]
    fn selector_is_reproducible_for_same_deck_size() {
        let mut a = TemplateSelector::new();
        let mut b = TemplateSelector::new();
        let first: Vec<_> = (0..10).map(|_| a.select(8)).collect();
        let second: Vec<_> = (0..10).map(|_| b.select(8)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn regions_scale_with_slide() {
        let rect = region(0.5, 0.25, 0.5, 0.5).to_rect(1000, 800);
        assert_eq!(rect, Rect::new(500, 200, 500, 400));
    }

    #[test]
    fn apply_clears_then_stacks_images_under_text() {
        let dir = TempDir::new().unwrap();
        let first = write_image(dir.path(), "a.png", 100, 50);
        let second = write_image(dir.path(), "b.png", 50, 100);
        let mut canvas = RecordingCanvas::default();

        apply_template(&mut canvas, 4, (1000, 1000), &[&first, &second], "犬\ndog").unwrap();

        assert_eq!(canvas.ops.len(), 4);
        assert_eq!(canvas.ops[0], Op::Clear);
        assert_eq!(
            canvas.ops[1],
            Op::Picture(first.clone(), Rect::new(0, 125, 500, 250))
        );
        assert_eq!(
            canvas.ops[2],
            Op::Picture(second.clone(), Rect::new(625, 500, 250, 500))
        );
        assert_eq!(
            canvas.ops[3],
            Op::Text(Rect::new(200, 400, 600, 200), "犬\ndog".to_string(), 0.15)
        );
    }

    #[test]
    fn framed_template_adds_frames() {
        let dir = TempDir::new().unwrap();
        let img = write_image(dir.path(), "a.png", 10, 10);
        let mut canvas = RecordingCanvas::default();

        apply_template(&mut canvas, 11, (1000, 1000), &[&img, &img], "text").unwrap();

        let frames = canvas
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Frame(_)))
            .count();
        assert_eq!(frames, 2);
        assert!(matches!(canvas.ops.last(), Some(Op::Text(..))));
    }

    #[test]
    fn out_of_range_id_uses_first_template() {
        assert_eq!(template_for(99).name, TEMPLATES[0].name);
    }
}
