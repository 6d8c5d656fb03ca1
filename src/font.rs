use crate::error::RippleError;
use crate::records::{FONT_BOLD, FONT_ITALIC};
use crate::types::Px;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use ttf_parser::GlyphId;

pub const DEFAULT_FONT_SIZE: i32 = 14;

/// A face request: family name, pixel size and bold/italic flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FontFace {
    pub name: Arc<str>,
    pub size: Px,
    pub flags: u8,
}

impl FontFace {
    pub fn new(name: &str, size: Px, flags: u8) -> Self {
        Self {
            name: Arc::from(name),
            size,
            flags,
        }
    }
}

/// Font-metrics service consumed by layout, hit-testing and rendering.
pub trait FontMetrics: Send + Sync {
    fn text_width(&self, face: &FontFace, text: &str) -> Px;
    fn line_height(&self, face: &FontFace) -> Px;
    /// Distance from the top of the line box to the baseline.
    fn ascent(&self, face: &FontFace) -> Px;
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct FontKey {
    name: String,
    size_milli: i64,
    flags: u8,
}

impl FontKey {
    fn of(face: &FontFace) -> Self {
        Self {
            name: normalize_name(&face.name),
            size_milli: face.size.to_milli_i64(),
            flags: face.flags,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TextWidthKey {
    font: FontKey,
    text: String,
}

#[derive(Debug)]
struct TextWidthCache {
    map: HashMap<TextWidthKey, Px>,
    order: VecDeque<TextWidthKey>,
    max_entries: usize,
}

impl TextWidthCache {
    fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&self, key: &TextWidthKey) -> Option<Px> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: TextWidthKey, value: Px) {
        if self.map.contains_key(&key) {
            return;
        }
        self.map.insert(key.clone(), value);
        self.order.push_back(key);
        while self.map.len() > self.max_entries {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct RegisteredFont {
    pub name: String,
    pub data: Arc<Vec<u8>>,
}

/// Font files known to the host, addressable by any of their names.
#[derive(Debug, Default)]
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub fn register_dir(&mut self, path: impl AsRef<Path>) {
        let Ok(entries) = fs::read_dir(path.as_ref()) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Err(err) = self.register_file(&path) {
                    log::debug!("skipping font {}: {}", path.display(), err);
                }
            }
        }
    }

    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String, RippleError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|v| v.to_str())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if ext != "ttf" && ext != "otf" {
            return Err(RippleError::Resource(format!(
                "unsupported font file {}",
                path.display()
            )));
        }
        let data = fs::read(path)?;
        let source = path.to_string_lossy().into_owned();
        self.register_bytes(data, Some(&source))
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, RippleError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            return Err(RippleError::Resource(format!(
                "invalid font data for {source}"
            )));
        };
        let (name, aliases) = font_names(&face, Path::new(source));
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name: name.clone(),
            data: Arc::new(data),
        });
        for alias in std::iter::once(name.clone()).chain(aliases) {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }
        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        self.lookup
            .get(&normalize_name(name))
            .and_then(|index| self.fonts.get(*index))
    }

    /// Looks up the styled variant of a family (`"Sans Bold Italic"`, `"Sans-Bold"`), falling
    /// back to the plain family.
    pub fn resolve_styled(&self, name: &str, flags: u8) -> Option<&RegisteredFont> {
        let suffix = match (flags & FONT_BOLD != 0, flags & FONT_ITALIC != 0) {
            (true, true) => Some("bold italic"),
            (true, false) => Some("bold"),
            (false, true) => Some("italic"),
            (false, false) => None,
        };
        if let Some(suffix) = suffix {
            let compact = suffix.replace(' ', "");
            for candidate in [
                format!("{name} {suffix}"),
                format!("{name}-{compact}"),
                format!("{name}{compact}"),
            ] {
                if let Some(font) = self.resolve(&candidate) {
                    return Some(font);
                }
            }
        }
        self.resolve(name)
    }
}

/// Per-face metrics in font units, shared by every size of the face.
#[derive(Debug)]
struct FaceMetrics {
    units_per_em: i32,
    ascent: i32,
    descent: i32,
    line_gap: i32,
    first_char: u32,
    widths: Vec<u16>,
    missing_width: u16,
    data: Arc<Vec<u8>>,
}

impl FaceMetrics {
    fn from_data(data: Arc<Vec<u8>>) -> Option<Self> {
        let face = ttf_parser::Face::parse(&data, 0).ok()?;
        let first_char = 32u32;
        let widths: Vec<u16> = (first_char..=255)
            .map(|code| {
                char::from_u32(code)
                    .and_then(|ch| face.glyph_index(ch))
                    .and_then(|gid| face.glyph_hor_advance(gid))
                    .unwrap_or(0)
            })
            .collect();
        let missing_width = widths.first().copied().unwrap_or(0);
        Some(Self {
            units_per_em: face.units_per_em().max(1) as i32,
            ascent: face.ascender() as i32,
            descent: face.descender() as i32,
            line_gap: face.line_gap() as i32,
            first_char,
            widths,
            missing_width,
            data: data.clone(),
        })
    }

    fn is_within_latin(&self, text: &str) -> bool {
        let last = self.first_char + self.widths.len() as u32;
        text.chars()
            .all(|ch| (self.first_char..last).contains(&(ch as u32)))
    }

    fn measure(&self, size: Px, text: &str) -> Px {
        if !self.is_within_latin(text) {
            if let Some(width) = self.measure_shaped(size, text) {
                return width;
            }
        }
        let mut total_units: i32 = 0;
        for ch in text.chars() {
            let idx = (ch as u32).wrapping_sub(self.first_char) as usize;
            let adv = self.widths.get(idx).copied().unwrap_or(self.missing_width);
            total_units = total_units.saturating_add(adv as i32);
        }
        size.mul_ratio(total_units, self.units_per_em)
    }

    fn measure_shaped(&self, size: Px, text: &str) -> Option<Px> {
        let glyphs = shape_run(&self.data, text);
        if glyphs.is_empty() {
            return None;
        }
        let total = glyphs
            .iter()
            .fold(0i32, |acc, glyph| acc.saturating_add(glyph.advance));
        Some(size.mul_ratio(total.max(0), self.units_per_em))
    }

    fn line_height(&self, size: Px) -> Px {
        let units = self.ascent - self.descent + self.line_gap;
        if units <= 0 {
            return size;
        }
        size.mul_ratio(units, self.units_per_em)
    }

    fn ascent(&self, size: Px) -> Px {
        let gap_above = self.line_gap / 2;
        size.mul_ratio(self.ascent + gap_above, self.units_per_em)
    }
}

/// Loaded metrics for one face at one size.
#[derive(Debug)]
pub struct LoadedFont {
    face: Arc<FaceMetrics>,
    size: Px,
    line_height: Px,
    ascent: Px,
}

impl LoadedFont {
    pub fn line_height(&self) -> Px {
        self.line_height
    }

    pub fn ascent(&self) -> Px {
        self.ascent
    }

    pub fn measure(&self, text: &str) -> Px {
        self.face.measure(self.size, text)
    }

    pub fn data(&self) -> &Arc<Vec<u8>> {
        &self.face.data
    }
}

/// Host-owned font service: resolves face requests against a registry and caches loaded
/// metrics per face, size and flags. Unknown faces fall back to proportional estimates.
#[derive(Debug)]
pub struct FontCache {
    registry: FontRegistry,
    faces: Mutex<HashMap<String, Option<Arc<FaceMetrics>>>>,
    loaded: Mutex<HashMap<FontKey, Arc<LoadedFont>>>,
    widths: Mutex<TextWidthCache>,
    missing: Mutex<HashSet<String>>,
}

impl FontCache {
    pub fn new(registry: FontRegistry) -> Self {
        Self {
            registry,
            faces: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            widths: Mutex::new(TextWidthCache::new(20_000)),
            missing: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &FontRegistry {
        &self.registry
    }

    /// Returns the loaded handle for a request, or `None` when no registered font matches.
    pub fn load(&self, face: &FontFace) -> Option<Arc<LoadedFont>> {
        let key = FontKey::of(face);
        if let Ok(loaded) = self.loaded.lock() {
            if let Some(font) = loaded.get(&key) {
                return Some(font.clone());
            }
        }
        let Some(metrics) = self.face_metrics(face) else {
            self.note_missing(face);
            return None;
        };
        let font = Arc::new(LoadedFont {
            line_height: metrics.line_height(face.size),
            ascent: metrics.ascent(face.size),
            face: metrics,
            size: face.size,
        });
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.insert(key, font.clone());
        }
        Some(font)
    }

    fn face_metrics(&self, face: &FontFace) -> Option<Arc<FaceMetrics>> {
        let registered = self.registry.resolve_styled(&face.name, face.flags)?;
        let key = normalize_name(&registered.name);
        if let Ok(faces) = self.faces.lock() {
            if let Some(entry) = faces.get(&key) {
                return entry.clone();
            }
        }
        let metrics = FaceMetrics::from_data(registered.data.clone()).map(Arc::new);
        if let Ok(mut faces) = self.faces.lock() {
            faces.insert(key, metrics.clone());
        }
        metrics
    }

    fn note_missing(&self, face: &FontFace) {
        if let Ok(mut missing) = self.missing.lock() {
            if missing.insert(normalize_name(&face.name)) {
                log::warn!("font '{}' is not registered; using estimated metrics", face.name);
            }
        }
    }
}

impl FontMetrics for FontCache {
    fn text_width(&self, face: &FontFace, text: &str) -> Px {
        if text.is_empty() {
            return Px::ZERO;
        }
        let key = TextWidthKey {
            font: FontKey::of(face),
            text: text.to_string(),
        };
        if let Ok(cache) = self.widths.lock() {
            if let Some(value) = cache.get(&key) {
                return value;
            }
        }
        let value = match self.load(face) {
            Some(font) => font.measure(text),
            None => estimated_width(face, text),
        };
        if let Ok(mut cache) = self.widths.lock() {
            cache.insert(key, value);
        }
        value
    }

    fn line_height(&self, face: &FontFace) -> Px {
        match self.load(face) {
            Some(font) => font.line_height(),
            None => face.size.mul_ratio(6, 5),
        }
    }

    fn ascent(&self, face: &FontFace) -> Px {
        match self.load(face) {
            Some(font) => font.ascent(),
            None => face.size.mul_ratio(19, 20),
        }
    }
}

fn estimated_width(face: &FontFace, text: &str) -> Px {
    let char_width = (face.size * 0.6).max(Px::from_i32(1));
    char_width * (text.chars().count() as i32)
}

/// One glyph of a shaped run, in font units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShapedGlyph {
    pub glyph_id: u16,
    pub advance: i32,
    pub x_offset: i32,
    pub y_offset: i32,
}

/// Shapes `text` with the face in `data`. Faces rustybuzz cannot load fall back to one glyph per
/// character straight from the cmap.
pub(crate) fn shape_run(data: &[u8], text: &str) -> Vec<ShapedGlyph> {
    if let Some(face) = HbFace::from_slice(data, 0) {
        let mut buffer = UnicodeBuffer::new();
        buffer.set_direction(detect_direction(text));
        buffer.push_str(text);
        let output = rustybuzz::shape(&face, &[], buffer);
        let glyphs: Vec<ShapedGlyph> = output
            .glyph_infos()
            .iter()
            .zip(output.glyph_positions())
            .map(|(info, pos)| ShapedGlyph {
                glyph_id: info.glyph_id as u16,
                advance: pos.x_advance,
                x_offset: pos.x_offset,
                y_offset: pos.y_offset,
            })
            .collect();
        if !glyphs.is_empty() {
            return glyphs;
        }
    }
    let Ok(face) = ttf_parser::Face::parse(data, 0) else {
        return Vec::new();
    };
    text.chars()
        .map(|ch| {
            let gid = face.glyph_index(ch).unwrap_or(GlyphId(0));
            ShapedGlyph {
                glyph_id: gid.0,
                advance: face.glyph_hor_advance(gid).map_or(0, i32::from),
                x_offset: 0,
                y_offset: 0,
            }
        })
        .collect()
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let rtl = matches!(
            ch as u32,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

fn font_names(face: &ttf_parser::Face<'_>, path: &Path) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                family.get_or_insert(name);
            }
            name_id::FULL_NAME => {
                full.get_or_insert(name);
            }
            name_id::POST_SCRIPT_NAME => {
                post.get_or_insert(name);
            }
            _ => {}
        }
    }

    let stem = path
        .file_stem()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string());
    let primary = full
        .clone()
        .or_else(|| post.clone())
        .or_else(|| family.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let aliases = [family, full, post, stem]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate != primary)
        .collect();
    (primary, aliases)
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}
