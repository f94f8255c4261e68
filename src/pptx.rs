// ABOUTME: PPTX document model for reading slide text and injecting pictures and text boxes
// ABOUTME: Keeps every archive part in memory and rewrites only the slides that changed

use crate::errors::{IllustratorError, Result};
use crate::layout::{Rect, SlideCanvas, TextBoxStyle};
use crate::utils;
use log::{debug, info};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// 10in × 7.5in, used when `p:sldSz` is missing.
pub const DEFAULT_SLIDE_SIZE: (i64, i64) = (9_144_000, 6_858_000);

pub const EMU_PER_POINT: f64 = 12_700.0;
pub const EMU_PER_INCH: f64 = 914_400.0;

const FRAME_WIDTH_PT: f64 = 8.0;

const REL_SLIDE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide";
const REL_IMAGE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
const CONTENT_TYPES: &str = "[Content_Types].xml";
const PRESENTATION: &str = "ppt/presentation.xml";
const PRESENTATION_RELS: &str = "ppt/_rels/presentation.xml.rels";

fn pptx_error(msg: impl Into<String>) -> IllustratorError {
    IllustratorError::PptxError(msg.into())
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.to_string()));
        }
    }
    Ok(None)
}

fn to_emu(points: f64) -> i64 {
    (points * EMU_PER_POINT).round() as i64
}

fn hex(rgb: [u8; 3]) -> String {
    format!("{:02X}{:02X}{:02X}", rgb[0], rgb[1], rgb[2])
}

/// One package relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub target_mode: Option<String>,
}

fn parse_relationships(xml: &str) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut rels = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == b"Relationship" =>
            {
                rels.push(Relationship {
                    id: attribute(e, b"Id")?.unwrap_or_default(),
                    rel_type: attribute(e, b"Type")?.unwrap_or_default(),
                    target: attribute(e, b"Target")?.unwrap_or_default(),
                    target_mode: attribute(e, b"TargetMode")?,
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rels)
}

fn serialize_relationships(rels: &[Relationship]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for rel in rels {
        xml.push_str(&format!(
            r#"<Relationship Id="{}" Type="{}" Target="{}""#,
            escape(&rel.id),
            escape(&rel.rel_type),
            escape(&rel.target)
        ));
        if let Some(mode) = &rel.target_mode {
            xml.push_str(&format!(r#" TargetMode="{}""#, escape(mode)));
        }
        xml.push_str("/>");
    }
    xml.push_str("</Relationships>");
    xml
}

/// `ppt/slides/slide3.xml` -> `ppt/slides/_rels/slide3.xml.rels`
fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

/// Resolve a relationship target found in `ppt/_rels/presentation.xml.rels`.
fn resolve_presentation_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("ppt/{}", target.trim_start_matches("./")),
    }
}

fn media_prefix(slide_number: usize) -> String {
    format!("illustrated_s{}_", slide_number)
}

fn is_illustrated_media(part: &str) -> bool {
    part.strip_prefix("ppt/media/")
        .map_or(false, |name| name.starts_with("illustrated_s"))
}

/// Resolve a relationship `target` of the part `source` to a part name,
/// e.g. `../media/a.png` from `ppt/slides/slide1.xml` is `ppt/media/a.png`.
fn resolve_part_target(source: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = source.split('/').collect();
    parts.pop();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Values of every namespace-prefixed attribute, which covers `r:embed`,
/// `r:link` and `r:id` references to slide relationships.
fn prefixed_attribute_values(xml: &str) -> Result<HashSet<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut values = HashSet::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                for attr in e.attributes().flatten() {
                    if attr.key.prefix().is_some() {
                        values.insert(attr.unescape_value()?.to_string());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(values)
}

/// Highest media counter already used for `slide_number` in the package.
fn existing_media_index(entries: &[(String, Vec<u8>)], slide_number: usize) -> usize {
    let prefix = format!("ppt/media/{}", media_prefix(slide_number));
    entries
        .iter()
        .filter_map(|(name, _)| name.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|n| n.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

/// A direct child of `p:spTree`, kept as raw XML.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeItem {
    kind: String,
    xml: String,
}

/// Split slide XML into the part before the shape tree's children, the
/// children themselves and the remainder.
fn split_shape_tree(xml: &str) -> Result<(String, Vec<TreeItem>, String)> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut depth = 0usize;
    let mut tree_depth: Option<usize> = None;
    let mut head_end = None;
    let mut tail_start = None;
    let mut child: Option<(usize, String)> = None;
    let mut items = Vec::new();

    loop {
        let before = reader.buffer_position();
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let name = String::from_utf8_lossy(local_name(e.name().as_ref())).to_string();
                match tree_depth {
                    None if name == "spTree" => {
                        tree_depth = Some(depth);
                        head_end = Some(reader.buffer_position());
                    }
                    Some(d) if depth == d + 1 && tail_start.is_none() => {
                        child = Some((before, name))
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if tree_depth.map_or(false, |d| depth == d) && tail_start.is_none() {
                    items.push(TreeItem {
                        kind: String::from_utf8_lossy(local_name(e.name().as_ref())).to_string(),
                        xml: xml[before..reader.buffer_position()].to_string(),
                    });
                }
            }
            Event::End(_) => {
                if let (Some(d), None) = (tree_depth, tail_start) {
                    if depth == d + 1 {
                        if let Some((start, kind)) = child.take() {
                            items.push(TreeItem {
                                kind,
                                xml: xml[start..reader.buffer_position()].to_string(),
                            });
                        }
                    } else if depth == d {
                        tail_start = Some(before);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match (head_end, tail_start) {
        (Some(head_end), Some(tail_start)) => Ok((
            xml[..head_end].to_string(),
            items,
            xml[tail_start..].to_string(),
        )),
        _ => Err(pptx_error("slide has no shape tree")),
    }
}

/// Text of a `p:sp` element: paragraphs joined with newlines, trimmed.
fn shape_text(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"p" => paragraphs.push(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => {
                if local_name(e.name().as_ref()) == b"br" {
                    if let Some(p) = paragraphs.last_mut() {
                        p.push('\n');
                    }
                }
            }
            Event::End(e) => {
                if local_name(e.name().as_ref()) == b"t" {
                    in_text = false;
                }
            }
            Event::Text(t) if in_text => {
                if let Some(p) = paragraphs.last_mut() {
                    p.push_str(&t.unescape()?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let text = paragraphs.join("\n").trim().to_string();
    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Highest `id` on any `cNvPr` in the slide.
fn max_shape_id(xml: &str) -> Result<u32> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut max = 1;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == b"cNvPr" =>
            {
                if let Some(id) = attribute(e, b"id")?.and_then(|v| v.parse::<u32>().ok()) {
                    max = max.max(id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(max)
}

/// One slide of a [`PptxDocument`], editable in memory.
///
/// Cloning a slide snapshots it, including any pictures added so far.
#[derive(Debug, Clone)]
pub struct Slide {
    number: usize,
    part: String,
    head: String,
    items: Vec<TreeItem>,
    tail: String,
    rels: Vec<Relationship>,
    rels_existed: bool,
    media: Vec<(String, Vec<u8>)>,
    /// Media parts from earlier runs already using this slide's naming.
    media_offset: usize,
    next_id: u32,
    dirty: bool,
}

impl Slide {
    fn parse(
        number: usize,
        part: String,
        xml: &str,
        rels_xml: Option<&str>,
        media_offset: usize,
    ) -> Result<Self> {
        let (head, items, tail) = split_shape_tree(xml)?;
        let rels = match rels_xml {
            Some(rels) => parse_relationships(rels)?,
            None => Vec::new(),
        };
        Ok(Self {
            number,
            part,
            head,
            items,
            tail,
            rels,
            rels_existed: rels_xml.is_some(),
            media: Vec::new(),
            media_offset,
            next_id: max_shape_id(xml)? + 1,
            dirty: false,
        })
    }

    /// 1-based position in the deck.
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn part_name(&self) -> &str {
        &self.part
    }

    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    /// Non-empty text of each top-level shape, in document order.
    pub fn texts(&self) -> Result<Vec<String>> {
        let mut texts = Vec::new();
        for item in self.items.iter().filter(|i| i.kind == "sp") {
            if let Some(text) = shape_text(&item.xml)? {
                texts.push(text);
            }
        }
        Ok(texts)
    }

    /// Number of top-level pictures.
    pub fn picture_count(&self) -> usize {
        self.items.iter().filter(|i| i.kind == "pic").count()
    }

    /// Number of top-level shapes (text boxes, autoshapes, placeholders).
    pub fn shape_count(&self) -> usize {
        self.items.iter().filter(|i| i.kind == "sp").count()
    }

    /// Drop top-level pictures and shapes. Group properties and other
    /// frames (tables, charts) stay. Image relationships of removed pictures
    /// are dropped on save.
    pub fn remove_content_shapes(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|i| i.kind != "sp" && i.kind != "pic");
        let removed = before - self.items.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next_rel_id(&self) -> String {
        let max = self
            .rels
            .iter()
            .filter_map(|r| r.id.strip_prefix("rId").and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        format!("rId{}", max + 1)
    }

    /// Index right after `p:grpSpPr`, i.e. the bottom of the z-order.
    fn bottom_index(&self) -> usize {
        self.items
            .iter()
            .position(|i| i.kind == "grpSpPr")
            .map(|p| p + 1)
            .unwrap_or(0)
    }

    /// Embed the image at `path` and place it at `rect`, beneath every other
    /// shape on the slide.
    pub fn insert_picture(&mut self, path: &Path, rect: Rect) -> Result<()> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .ok_or_else(|| pptx_error(format!("image {:?} has no extension", path)))?;
        if !matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif") {
            return Err(IllustratorError::UnsupportedImage(format!(
                "{:?} cannot be embedded",
                path
            )));
        }
        let bytes = fs::read(path)?;

        let media_name = format!(
            "{}{}.{}",
            media_prefix(self.number),
            self.media_offset + self.media.len() + 1,
            ext
        );
        let rel_id = self.next_rel_id();
        self.rels.push(Relationship {
            id: rel_id.clone(),
            rel_type: REL_IMAGE.to_string(),
            target: format!("../media/{}", media_name),
            target_mode: None,
        });
        self.media.push((format!("ppt/media/{}", media_name), bytes));

        let id = self.take_id();
        let descr = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let xml = format!(
            r#"<p:pic xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><p:nvPicPr><p:cNvPr id="{id}" name="Picture {id}" descr="{descr}"/><p:cNvPicPr><a:picLocks noChangeAspect="1"/></p:cNvPicPr><p:nvPr/></p:nvPicPr><p:blipFill><a:blip r:embed="{rel}"/><a:stretch><a:fillRect/></a:stretch></p:blipFill><p:spPr><a:xfrm><a:off x="{x}" y="{y}"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></p:spPr></p:pic>"#,
            id = id,
            descr = escape(&descr),
            rel = rel_id,
            x = rect.x,
            y = rect.y,
            cx = rect.cx,
            cy = rect.cy,
        );
        let at = self.bottom_index();
        self.items.insert(
            at,
            TreeItem {
                kind: "pic".to_string(),
                xml,
            },
        );
        self.dirty = true;
        debug!("Slide {}: picture {} placed at {:?}", self.number, media_name, rect);
        Ok(())
    }

    /// Add a filled, bordered text box on top of the slide. Each line of
    /// `text` becomes a centered paragraph.
    pub fn insert_text_box(&mut self, rect: Rect, text: &str, style: &TextBoxStyle) -> Result<()> {
        let id = self.take_id();
        let alpha = ((1.0 - style.transparency.clamp(0.0, 1.0)) * 100_000.0).round() as i64;
        let bold = if style.bold { "1" } else { "0" };
        let size = (style.font_pt * 100.0).round() as i64;
        let inset_x = (0.4 * EMU_PER_INCH) as i64;
        let inset_y = (0.3 * EMU_PER_INCH) as i64;

        let paragraphs: String = text
            .lines()
            .map(|line| {
                format!(
                    r#"<a:p><a:pPr algn="ctr"/><a:r><a:rPr lang="en-US" sz="{size}" b="{bold}" dirty="0"><a:solidFill><a:srgbClr val="{color}"/></a:solidFill></a:rPr><a:t>{text}</a:t></a:r></a:p>"#,
                    size = size,
                    bold = bold,
                    color = hex(style.text_rgb),
                    text = escape(line),
                )
            })
            .collect();
        let paragraphs = if paragraphs.is_empty() {
            r#"<a:p><a:pPr algn="ctr"/></a:p>"#.to_string()
        } else {
            paragraphs
        };

        let xml = format!(
            r#"<p:sp><p:nvSpPr><p:cNvPr id="{id}" name="Text Overlay {id}"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:spPr><a:xfrm><a:off x="{x}" y="{y}"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom><a:solidFill><a:srgbClr val="{fill}"><a:alpha val="{alpha}"/></a:srgbClr></a:solidFill><a:ln w="{border}"><a:solidFill><a:srgbClr val="{line}"/></a:solidFill></a:ln></p:spPr><p:txBody><a:bodyPr wrap="square" lIns="{ix}" tIns="{iy}" rIns="{ix}" bIns="{iy}" anchor="ctr"><a:normAutofit/></a:bodyPr><a:lstStyle/>{paragraphs}</p:txBody></p:sp>"#,
            id = id,
            x = rect.x,
            y = rect.y,
            cx = rect.cx,
            cy = rect.cy,
            fill = hex(style.fill_rgb),
            alpha = alpha,
            border = to_emu(style.border_pt),
            line = hex(style.border_rgb),
            ix = inset_x,
            iy = inset_y,
            paragraphs = paragraphs,
        );
        self.items.push(TreeItem {
            kind: "sp".to_string(),
            xml,
        });
        self.dirty = true;
        Ok(())
    }

    /// Unfilled white rectangle drawn around `rect`.
    pub fn insert_frame(&mut self, rect: Rect) -> Result<()> {
        let id = self.take_id();
        let xml = format!(
            r#"<p:sp><p:nvSpPr><p:cNvPr id="{id}" name="Frame {id}"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:spPr><a:xfrm><a:off x="{x}" y="{y}"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom><a:noFill/><a:ln w="{w}"><a:solidFill><a:srgbClr val="FFFFFF"/></a:solidFill></a:ln></p:spPr></p:sp>"#,
            id = id,
            x = rect.x,
            y = rect.y,
            cx = rect.cx,
            cy = rect.cy,
            w = to_emu(FRAME_WIDTH_PT),
        );
        self.items.push(TreeItem {
            kind: "sp".to_string(),
            xml,
        });
        self.dirty = true;
        Ok(())
    }

    /// Relationships to keep when saving: image relationships no longer
    /// referenced by the slide XML are dropped, everything else stays.
    pub fn live_relationships(&self) -> Result<Vec<Relationship>> {
        if !self.rels.iter().any(|r| r.rel_type == REL_IMAGE) {
            return Ok(self.rels.clone());
        }
        let referenced = prefixed_attribute_values(&self.to_xml())?;
        Ok(self
            .rels
            .iter()
            .filter(|r| r.rel_type != REL_IMAGE || referenced.contains(&r.id))
            .cloned()
            .collect())
    }

    fn to_xml(&self) -> String {
        let mut xml = self.head.clone();
        for item in &self.items {
            xml.push_str(&item.xml);
        }
        xml.push_str(&self.tail);
        xml
    }
}

impl SlideCanvas for Slide {
    fn clear_content(&mut self) -> usize {
        self.remove_content_shapes()
    }

    fn add_picture(&mut self, image: &Path, rect: Rect) -> Result<()> {
        self.insert_picture(image, rect)
    }

    fn add_text_box(&mut self, rect: Rect, text: &str, style: &TextBoxStyle) -> Result<()> {
        self.insert_text_box(rect, text, style)
    }

    fn add_frame(&mut self, rect: Rect) -> Result<()> {
        self.insert_frame(rect)
    }
}

/// A `.pptx` package held in memory.
#[derive(Debug, Clone)]
pub struct PptxDocument {
    entries: Vec<(String, Vec<u8>)>,
    slides: Vec<Slide>,
    slide_size: (i64, i64),
}

impl PptxDocument {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening presentation {:?}", path);
        if !path.is_file() {
            return Err(IllustratorError::PathNotFoundError(path.to_path_buf()));
        }
        let file = fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let mut bytes = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut bytes)?;
            entries.push((file.name().to_string(), bytes));
        }

        let lookup: HashMap<&str, &[u8]> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        let text = |name: &str| -> Option<String> {
            lookup
                .get(name)
                .map(|b| String::from_utf8_lossy(b).to_string())
        };

        let presentation = text(PRESENTATION)
            .ok_or_else(|| pptx_error("missing ppt/presentation.xml"))?;
        let pres_rels = text(PRESENTATION_RELS)
            .ok_or_else(|| pptx_error("missing ppt/_rels/presentation.xml.rels"))?;

        let (order, slide_size) = read_presentation(&presentation)?;
        let targets: HashMap<String, String> = parse_relationships(&pres_rels)?
            .into_iter()
            .filter(|r| r.rel_type == REL_SLIDE)
            .map(|r| (r.id, resolve_presentation_target(&r.target)))
            .collect();

        let mut slides = Vec::with_capacity(order.len());
        for rel_id in order {
            let part = targets
                .get(&rel_id)
                .ok_or_else(|| pptx_error(format!("slide relationship {} not found", rel_id)))?;
            let xml = text(part).ok_or_else(|| pptx_error(format!("missing slide part {}", part)))?;
            let rels = text(&rels_path_for(part));
            let number = slides.len() + 1;
            let offset = existing_media_index(&entries, number);
            slides.push(Slide::parse(number, part.clone(), &xml, rels.as_deref(), offset)?);
        }

        debug!(
            "Loaded {} slides, size {}x{} EMU",
            slides.len(),
            slide_size.0,
            slide_size.1
        );
        Ok(Self {
            entries,
            slides,
            slide_size,
        })
    }

    pub fn slide_count(&self) -> usize {
        self.slides.len()
    }

    pub fn slide_size(&self) -> (i64, i64) {
        self.slide_size
    }

    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    pub fn slides_mut(&mut self) -> &mut [Slide] {
        &mut self.slides
    }

    /// Names of every part in the package, in archive order.
    pub fn part_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut replaced: HashMap<String, Vec<u8>> = HashMap::new();
        let mut added: Vec<(String, Vec<u8>)> = Vec::new();
        let mut extensions: Vec<String> = Vec::new();
        let mut live_media: HashSet<String> = HashSet::new();

        for slide in &self.slides {
            let rels = if slide.dirty {
                slide.live_relationships()?
            } else {
                slide.rels.clone()
            };
            live_media.extend(
                rels.iter()
                    .filter(|r| r.rel_type == REL_IMAGE && r.target_mode.is_none())
                    .map(|r| resolve_part_target(&slide.part, &r.target)),
            );
            if !slide.dirty {
                continue;
            }

            replaced.insert(slide.part.clone(), slide.to_xml().into_bytes());
            let rels_xml = serialize_relationships(&rels).into_bytes();
            if slide.rels_existed {
                replaced.insert(rels_path_for(&slide.part), rels_xml);
            } else if !rels.is_empty() {
                added.push((rels_path_for(&slide.part), rels_xml));
            }
            added.extend(slide.media.iter().cloned());
        }

        // Pictures this tool placed earlier and has since removed leave
        // nothing behind.
        let orphaned = |name: &str| is_illustrated_media(name) && !live_media.contains(name);
        added.retain(|(name, _)| !orphaned(name));
        for (name, _) in &added {
            if let Some((_, ext)) = name.rsplit_once('.') {
                if is_illustrated_media(name) && !extensions.iter().any(|e| e == ext) {
                    extensions.push(ext.to_string());
                }
            }
        }

        if let Some((_, types)) = self.entries.iter().find(|(n, _)| n == CONTENT_TYPES) {
            let types = String::from_utf8_lossy(types);
            replaced.insert(
                CONTENT_TYPES.to_string(),
                with_default_content_types(&types, &extensions)?.into_bytes(),
            );
        }

        utils::ensure_parent_directory_exists(path)?;
        let file = fs::File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for (name, bytes) in &self.entries {
            if orphaned(name) {
                debug!("Dropping unreferenced media {}", name);
                continue;
            }
            zip.start_file(name.as_str(), options)?;
            zip.write_all(replaced.get(name).unwrap_or(bytes))?;
        }
        for (name, bytes) in &added {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;

        info!("Presentation saved to {:?}", path);
        Ok(())
    }
}

/// Slide relationship ids in `sldIdLst` order, plus the slide size.
fn read_presentation(xml: &str) -> Result<(Vec<String>, (i64, i64))> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut order = Vec::new();
    let mut size = DEFAULT_SLIDE_SIZE;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) => match local_name(e.name().as_ref()) {
                b"sldId" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.prefix().is_some() && attr.key.local_name().as_ref() == b"id" {
                            order.push(attr.unescape_value()?.to_string());
                        }
                    }
                }
                b"sldSz" => {
                    let cx = attribute(e, b"cx")?.and_then(|v| v.parse().ok());
                    let cy = attribute(e, b"cy")?.and_then(|v| v.parse().ok());
                    if let (Some(cx), Some(cy)) = (cx, cy) {
                        size = (cx, cy);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok((order, size))
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// Lowercased extensions that already have a `Default` content type.
fn declared_default_extensions(types: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(types);
    reader.trim_text(true);
    let mut declared = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == b"Default" =>
            {
                if let Some(ext) = attribute(e, b"Extension")? {
                    declared.push(ext.to_lowercase());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(declared)
}

/// Add a `Default` entry for each extension the package does not declare yet.
fn with_default_content_types(types: &str, extensions: &[String]) -> Result<String> {
    let mut declared = declared_default_extensions(types)?;
    let mut insert = String::new();
    for ext in extensions {
        let ext = ext.to_lowercase();
        if declared.contains(&ext) {
            continue;
        }
        insert.push_str(&format!(
            r#"<Default Extension="{}" ContentType="{}"/>"#,
            escape(&ext),
            content_type_for(&ext)
        ));
        declared.push(ext);
    }
    if insert.is_empty() {
        return Ok(types.to_string());
    }
    match types.rfind("</Types>") {
        Some(pos) => Ok(format!("{}{}{}", &types[..pos], insert, &types[pos..])),
        None => Err(pptx_error("[Content_Types].xml has no closing Types element")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    const SLIDE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:cSld><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr/><p:sp><p:nvSpPr><p:cNvPr id="2" name="Title 1"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:spPr/><p:txBody><a:bodyPr/><a:p><a:r><a:t>りんご（apple）</a:t></a:r></a:p></p:txBody></p:sp><p:sp><p:nvSpPr><p:cNvPr id="5" name="Body"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:spPr/><p:txBody><a:bodyPr/><a:p><a:r><a:t>red &amp; ripe</a:t></a:r></a:p><a:p><a:r><a:t>fruit</a:t></a:r></a:p></p:txBody></p:sp><p:sp><p:nvSpPr><p:cNvPr id="3" name="Empty"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:spPr/><p:txBody><a:bodyPr/><a:p><a:r><a:t>  </a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sld>"#;

    fn deck_bytes() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let options = FileOptions::default();
            let parts: [(&str, String); 5] = [
                (
                    CONTENT_TYPES,
                    r#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#.to_string(),
                ),
                (
                    PRESENTATION,
                    r#"<?xml version="1.0" encoding="UTF-8"?><p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><p:sldIdLst><p:sldId id="257" r:id="rId3"/><p:sldId id="256" r:id="rId2"/></p:sldIdLst><p:sldSz cx="12192000" cy="6858000"/></p:presentation>"#.to_string(),
                ),
                (
                    PRESENTATION_RELS,
                    format!(
                        r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId2" Type="{rel}" Target="slides/slide1.xml"/><Relationship Id="rId3" Type="{rel}" Target="slides/slide2.xml"/></Relationships>"#,
                        rel = REL_SLIDE
                    ),
                ),
                ("ppt/slides/slide1.xml", SLIDE.to_string()),
                ("ppt/slides/slide2.xml", SLIDE.replace("りんご（apple）", "second")),
            ];
            for (name, body) in parts.iter() {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn open_deck() -> PptxDocument {
        PptxDocument::from_reader(Cursor::new(deck_bytes())).unwrap()
    }

    #[test]
    fn slides_follow_presentation_order() {
        let doc = open_deck();
        assert_eq!(doc.slide_count(), 2);
        assert_eq!(doc.slide_size(), (12_192_000, 6_858_000));
        assert_eq!(doc.slides()[0].part_name(), "ppt/slides/slide2.xml");
        assert_eq!(doc.slides()[0].texts().unwrap()[0], "second");
        assert_eq!(doc.slides()[1].part_name(), "ppt/slides/slide1.xml");
    }

    #[test]
    fn texts_skip_blank_shapes_and_join_paragraphs() {
        let doc = open_deck();
        assert_eq!(
            doc.slides()[1].texts().unwrap(),
            vec!["りんご（apple）".to_string(), "red & ripe\nfruit".to_string()]
        );
    }

    #[test]
    fn remove_content_keeps_group_properties() {
        let mut doc = open_deck();
        let slide = &mut doc.slides_mut()[0];
        assert_eq!(slide.remove_content_shapes(), 3);
        assert_eq!(slide.shape_count(), 0);
        assert!(slide.to_xml().contains("<p:grpSpPr/>"));
        assert!(slide.to_xml().ends_with("</p:sld>"));
    }

    #[test]
    fn pictures_go_beneath_text() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("a.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&img).unwrap();

        let mut doc = open_deck();
        let slide = &mut doc.slides_mut()[1];
        slide
            .insert_text_box(Rect::new(1, 2, 3, 4), "hello\nworld", &TextBoxStyle::default())
            .unwrap();
        slide.insert_picture(&img, Rect::new(0, 0, 10, 10)).unwrap();

        assert_eq!(slide.items[2].kind, "pic");
        assert!(slide.items[2].xml.contains(r#"r:embed="rId1""#));
        assert!(slide.items[2].xml.contains(r#"id="7""#));
        assert!(slide.items.last().unwrap().xml.contains("Text Overlay 6"));
        assert!(slide.texts().unwrap().contains(&"hello\nworld".to_string()));
    }

    #[test]
    fn text_box_carries_style() {
        let mut doc = open_deck();
        let slide = &mut doc.slides_mut()[0];
        slide
            .insert_text_box(Rect::new(0, 0, 100, 100), "a < b", &TextBoxStyle::with_transparency(0.1))
            .unwrap();
        let xml = &slide.items.last().unwrap().xml;
        assert!(xml.contains(r#"<a:alpha val="90000"/>"#));
        assert!(xml.contains(r#"<a:ln w="50800">"#));
        assert!(xml.contains(r#"sz="4000" b="1""#));
        assert!(xml.contains(r#"lIns="365760" tIns="274320""#));
        assert!(xml.contains("a &lt; b"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("a.webp");
        fs::write(&img, b"RIFF").unwrap();
        let mut doc = open_deck();
        let err = doc.slides_mut()[0]
            .insert_picture(&img, Rect::new(0, 0, 1, 1))
            .unwrap_err();
        assert!(matches!(err, IllustratorError::UnsupportedImage(_)));
    }

    #[test]
    fn save_round_trips_with_media_and_content_types() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("a.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&img).unwrap();

        let mut doc = open_deck();
        {
            let slide = &mut doc.slides_mut()[0];
            slide.remove_content_shapes();
            slide.insert_picture(&img, Rect::new(0, 0, 10, 10)).unwrap();
            slide
                .insert_text_box(Rect::new(0, 0, 5, 5), "second", &TextBoxStyle::default())
                .unwrap();
        }
        let out = dir.path().join("out").join("deck.pptx");
        doc.save(&out).unwrap();

        let reopened = PptxDocument::open(&out).unwrap();
        assert_eq!(reopened.slide_count(), 2);
        assert_eq!(reopened.slides()[0].picture_count(), 1);
        assert_eq!(reopened.slides()[0].texts().unwrap(), vec!["second".to_string()]);
        assert_eq!(reopened.slides()[1].picture_count(), 0);
        assert!(reopened
            .part_names()
            .contains(&"ppt/media/illustrated_s1_1.png"));
        assert!(reopened
            .part_names()
            .contains(&"ppt/slides/_rels/slide2.xml.rels"));

        let mut archive = ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        let mut types = String::new();
        archive
            .by_name(CONTENT_TYPES)
            .unwrap()
            .read_to_string(&mut types)
            .unwrap();
        assert!(types.contains(r#"<Default Extension="png" ContentType="image/png"/>"#));
    }

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn declared_image_defaults_are_not_repeated() {
        let types = r#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="PNG" ContentType="image/png"/><Default Extension="xml" ContentType="application/xml"/></Types>"#;
        let exts = vec!["png".to_string(), "jpg".to_string(), "jpg".to_string()];

        let updated = with_default_content_types(types, &exts).unwrap();

        assert_eq!(count(&updated.to_lowercase(), r#"extension="png""#), 1);
        assert_eq!(count(&updated, r#"<Default Extension="jpg" ContentType="image/jpeg"/>"#), 1);
        assert!(updated.ends_with("</Types>"));
        assert_eq!(with_default_content_types(types, &[]).unwrap(), types);
    }

    #[test]
    fn saving_twice_keeps_one_default_per_extension() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("a.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&img).unwrap();

        let mut doc = open_deck();
        doc.slides_mut()[0].insert_picture(&img, Rect::new(0, 0, 10, 10)).unwrap();
        let first = dir.path().join("first.pptx");
        doc.save(&first).unwrap();

        let mut again = PptxDocument::open(&first).unwrap();
        again.slides_mut()[1].insert_picture(&img, Rect::new(0, 0, 10, 10)).unwrap();
        let second = dir.path().join("second.pptx");
        again.save(&second).unwrap();

        let mut archive = ZipArchive::new(fs::File::open(&second).unwrap()).unwrap();
        let mut types = String::new();
        archive
            .by_name(CONTENT_TYPES)
            .unwrap()
            .read_to_string(&mut types)
            .unwrap();
        assert_eq!(count(&types, r#"Extension="png""#), 1);
    }

    #[test]
    fn replaced_pictures_leave_no_orphans() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("a.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&img).unwrap();

        let mut doc = open_deck();
        doc.slides_mut()[0].insert_picture(&img, Rect::new(0, 0, 10, 10)).unwrap();
        let first = dir.path().join("first.pptx");
        doc.save(&first).unwrap();

        let mut again = PptxDocument::open(&first).unwrap();
        {
            let slide = &mut again.slides_mut()[0];
            assert_eq!(slide.picture_count(), 1);
            slide.remove_content_shapes();
            slide.insert_picture(&img, Rect::new(0, 0, 20, 20)).unwrap();
            assert_eq!(
                slide
                    .live_relationships()
                    .unwrap()
                    .iter()
                    .filter(|r| r.rel_type == REL_IMAGE)
                    .count(),
                1
            );
        }
        let second = dir.path().join("second.pptx");
        again.save(&second).unwrap();

        let reopened = PptxDocument::open(&second).unwrap();
        let names = reopened.part_names();
        assert!(!names.contains(&"ppt/media/illustrated_s1_1.png"));
        assert!(names.contains(&"ppt/media/illustrated_s1_2.png"));
        let rels = &reopened.slides()[0].rels;
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].target, "../media/illustrated_s1_2.png");
    }

    #[test]
    fn relationship_targets_resolve_against_the_source_part() {
        assert_eq!(
            resolve_part_target("ppt/slides/slide1.xml", "../media/a.png"),
            "ppt/media/a.png"
        );
        assert_eq!(
            resolve_part_target("ppt/slides/slide1.xml", "./b.xml"),
            "ppt/slides/b.xml"
        );
        assert_eq!(resolve_part_target("ppt/slides/slide1.xml", "/ppt/x.png"), "ppt/x.png");
    }

    #[test]
    fn relationships_round_trip() {
        let rels = vec![Relationship {
            id: "rId1".to_string(),
            rel_type: REL_IMAGE.to_string(),
            target: "https://example.com/a&b".to_string(),
            target_mode: Some("External".to_string()),
        }];
        let parsed = parse_relationships(&serialize_relationships(&rels)).unwrap();
        assert_eq!(parsed, rels);
    }

    #[test]
    fn slide_without_shape_tree_is_an_error() {
        assert!(split_shape_tree("<p:sld><p:cSld/></p:sld>").is_err());
    }
}
