// ABOUTME: Shared fixtures for integration tests
// ABOUTME: Builds minimal decks, noise images and scripted network fakes

#![allow(dead_code)]

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use slide_illustrator::fetch::{HttpResponse, TransportError};
use slide_illustrator::{HttpTransport, ImageProvider, ProgressEvent, ProgressSink};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

const REL_SLIDE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide";

fn text_shape(id: usize, text: &str) -> String {
    format!(
        r#"<p:sp><p:nvSpPr><p:cNvPr id="{id}" name="TextBox {id}"/><p:cNvSpPr txBox="1"/><p:nvPr/></p:nvSpPr><p:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="100" cy="100"/></a:xfrm></p:spPr><p:txBody><a:bodyPr/><a:lstStyle/><a:p><a:r><a:rPr lang="ja-JP"/><a:t>{text}</a:t></a:r></a:p></p:txBody></p:sp>"#,
        id = id,
        text = text
    )
}

pub fn slide_xml(texts: &[&str]) -> String {
    let shapes: String = texts
        .iter()
        .enumerate()
        .map(|(i, text)| text_shape(i + 2, text))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:cSld><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/><a:chOff x="0" y="0"/><a:chExt cx="0" cy="0"/></a:xfrm></p:grpSpPr>{shapes}</p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sld>"#,
        shapes = shapes
    )
}

/// Write a deck with one slide per entry, each holding one text box per text.
pub fn build_deck(path: &Path, slides: &[&[&str]]) {
    build_deck_with_defaults(path, slides, &[]);
}

/// Like [`build_deck`], also declaring `Default` content types for the given
/// `(extension, content type)` pairs, as decks saved by PowerPoint do.
pub fn build_deck_with_defaults(path: &Path, slides: &[&[&str]], defaults: &[(&str, &str)]) {
    let declared: String = defaults
        .iter()
        .map(|(ext, content_type)| {
            format!(r#"<Default Extension="{}" ContentType="{}"/>"#, ext, content_type)
        })
        .collect();
    let file = fs::File::create(path).expect("Failed to create deck");
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default();

    let overrides: String = (1..=slides.len())
        .map(|n| {
            format!(
                r#"<Override PartName="/ppt/slides/slide{}.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slide+xml"/>"#,
                n
            )
        })
        .collect();
    zip.start_file("[Content_Types].xml", options).unwrap();
    write!(
        zip,
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/>{}<Override PartName="/ppt/presentation.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"/>{}</Types>"#,
        declared,
        overrides
    )
    .unwrap();

    zip.start_file("_rels/.rels", options).unwrap();
    zip.write_all(br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="ppt/presentation.xml"/></Relationships>"#).unwrap();

    let ids: String = (1..=slides.len())
        .map(|n| format!(r#"<p:sldId id="{}" r:id="rId{}"/>"#, 255 + n, n + 1))
        .collect();
    zip.start_file("ppt/presentation.xml", options).unwrap();
    write!(
        zip,
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><p:presentation xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:sldIdLst>{}</p:sldIdLst><p:sldSz cx="9144000" cy="6858000"/><p:notesSz cx="6858000" cy="9144000"/></p:presentation>"#,
        ids
    )
    .unwrap();

    let rels: String = (1..=slides.len())
        .map(|n| {
            format!(
                r#"<Relationship Id="rId{}" Type="{}" Target="slides/slide{}.xml"/>"#,
                n + 1,
                REL_SLIDE,
                n
            )
        })
        .collect();
    zip.start_file("ppt/_rels/presentation.xml.rels", options).unwrap();
    write!(
        zip,
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{}</Relationships>"#,
        rels
    )
    .unwrap();

    for (i, texts) in slides.iter().enumerate() {
        zip.start_file(format!("ppt/slides/slide{}.xml", i + 1), options)
            .unwrap();
        zip.write_all(slide_xml(texts).as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// Raw bytes of one part of a saved deck.
pub fn read_part(deck: &Path, name: &str) -> Option<Vec<u8>> {
    let mut archive = ZipArchive::new(fs::File::open(deck).ok()?).ok()?;
    let mut file = archive.by_name(name).ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    Some(bytes)
}

pub fn part_names(deck: &Path) -> Vec<String> {
    let archive = ZipArchive::new(fs::File::open(deck).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

/// PNG of random-looking pixels, comfortably above the minimum body size.
pub fn noise_png(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let img = RgbImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let b = state.to_be_bytes();
        Rgb([b[0], b[1], b[2]])
    });
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut bytes, ImageOutputFormat::Png)
        .unwrap();
    bytes.into_inner()
}

pub type Calls = Rc<RefCell<Vec<String>>>;

/// Provider returning the same URLs for every keyword and recording queries.
pub struct FixedProvider {
    pub urls: Vec<String>,
    pub calls: Calls,
}

impl FixedProvider {
    pub fn boxed(urls: &[&str], calls: &Calls) -> Box<dyn ImageProvider> {
        Box::new(Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            calls: Rc::clone(calls),
        })
    }
}

impl ImageProvider for FixedProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn search(&self, keyword: &str, count: usize) -> Vec<String> {
        self.calls.borrow_mut().push(keyword.to_string());
        self.urls.iter().take(count).cloned().collect()
    }
}

/// Transport serving canned responses; unknown URLs get a 404.
#[derive(Default)]
pub struct CannedTransport {
    pub responses: HashMap<String, HttpResponse>,
    pub hits: Rc<RefCell<HashMap<String, usize>>>,
}

impl CannedTransport {
    pub fn with_image(mut self, url: &str, body: Vec<u8>, content_type: &str) -> Self {
        self.responses.insert(
            url.to_string(),
            HttpResponse {
                status: 200,
                content_type: Some(content_type.to_string()),
                body,
            },
        );
        self
    }
}

impl HttpTransport for CannedTransport {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, TransportError> {
        *self.hits.borrow_mut().entry(url.to_string()).or_insert(0) += 1;
        Ok(self.responses.get(url).cloned().unwrap_or(HttpResponse {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }))
    }
}

/// Sink collecting every event for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}
