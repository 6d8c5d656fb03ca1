//! Embeddable objects: anything the host inlines into the flow that contributes a measured size
//! and draws itself into the canvas.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use image::RgbaImage;

use crate::canvas::Canvas;
use crate::error::RippleError;
use crate::types::{Px, Rect, Size};

/// Placement flags for embedded objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LayoutOptions(u16);

impl LayoutOptions {
    pub const NONE: LayoutOptions = LayoutOptions(0);
    /// Float at the cursor; text flows around the object's own bounds.
    pub const SQUARE: LayoutOptions = LayoutOptions(0x0001);
    /// Float whose clip spans the whole container width.
    pub const WIDE: LayoutOptions = LayoutOptions(0x0002);
    /// Extend the clip to the container's right edge.
    pub const RIGHT: LayoutOptions = LayoutOptions(0x0004);
    /// Extend the clip to the container's left edge.
    pub const LEFT: LayoutOptions = LayoutOptions(0x0008);
    /// Extend the clip down to at least the bottom of the line the object was placed on.
    pub const BOTTOM: LayoutOptions = LayoutOptions(0x0010);
    pub const BACKGROUND: LayoutOptions = LayoutOptions(0x0020);
    pub const FOREGROUND: LayoutOptions = LayoutOptions(0x0040);
    pub const FIXED: LayoutOptions = LayoutOptions(0x0080);
    pub const HFIXED: LayoutOptions = LayoutOptions(0x0100);
    pub const VFIXED: LayoutOptions = LayoutOptions(0x0200);

    const NAMES: [(&'static str, LayoutOptions); 10] = [
        ("square", Self::SQUARE),
        ("wide", Self::WIDE),
        ("right", Self::RIGHT),
        ("left", Self::LEFT),
        ("bottom", Self::BOTTOM),
        ("background", Self::BACKGROUND),
        ("foreground", Self::FOREGROUND),
        ("fixed", Self::FIXED),
        ("hfixed", Self::HFIXED),
        ("vfixed", Self::VFIXED),
    ];

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: LayoutOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: LayoutOptions) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: LayoutOptions) -> LayoutOptions {
        LayoutOptions(self.0 | other.0)
    }

    /// Parses a list such as `"square|right"` or `"background, fixed"`. Unknown names are
    /// returned so the caller can report them.
    pub fn parse(list: &str) -> (LayoutOptions, Vec<String>) {
        let mut options = LayoutOptions::NONE;
        let mut unknown = Vec::new();
        for part in list.split(['|', ',', ' ', '+']).filter(|p| !p.is_empty()) {
            let lower = part.to_ascii_lowercase();
            match Self::NAMES.iter().find(|(name, _)| *name == lower) {
                Some((_, flag)) => options = options.union(*flag),
                None => unknown.push(part.to_string()),
            }
        }
        (options, unknown)
    }

    /// Objects that leave the inline flow.
    pub fn is_floating(self) -> bool {
        self.intersects(
            Self::SQUARE
                .union(Self::WIDE)
                .union(Self::LEFT)
                .union(Self::RIGHT)
                .union(Self::BOTTOM)
                .union(Self::fixed_any()),
        )
    }

    pub fn fixed_any() -> LayoutOptions {
        Self::FIXED.union(Self::HFIXED).union(Self::VFIXED)
    }
}

/// Result of measuring an object against the space available to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measured {
    pub width: Px,
    pub height: Px,
    /// Whether the object wants text to flow around it.
    pub clip: bool,
}

/// The embeddable-object protocol.
pub trait Embedded: Send + Sync {
    fn name(&self) -> &str {
        "object"
    }

    fn measure(&self, available: Size) -> Measured;

    fn layout_options(&self) -> LayoutOptions {
        LayoutOptions::NONE
    }

    /// Position relative to the container origin for fixed placement.
    fn fixed_position(&self) -> Option<(Px, Px)> {
        None
    }

    fn draw(&self, canvas: &mut Canvas, bounds: Rect);
}

/// A decoded raster image.
pub struct Picture {
    source: String,
    image: Arc<RgbaImage>,
    width: Option<Px>,
    height: Option<Px>,
}

impl Picture {
    /// Loads from a file path or a `data:` URI.
    pub fn load(source: &str, base_dir: Option<&Path>) -> Result<Picture, RippleError> {
        let image = match parse_data_uri(source) {
            Some((mime, data)) => decode_image(&data, Some(&mime)),
            None => {
                let path = match base_dir {
                    Some(dir) if Path::new(source).is_relative() => dir.join(source),
                    _ => Path::new(source).to_path_buf(),
                };
                let bytes = std::fs::read(&path)?;
                decode_image(&bytes, None)
            }
        };
        let image = image
            .ok_or_else(|| RippleError::Resource(format!("cannot decode picture '{}'", short(source))))?;
        Ok(Picture {
            source: source.to_string(),
            image: Arc::new(image),
            width: None,
            height: None,
        })
    }

    pub fn from_image(source: &str, image: RgbaImage) -> Picture {
        Picture {
            source: source.to_string(),
            image: Arc::new(image),
            width: None,
            height: None,
        }
    }

    /// Requested display size; a missing side keeps the aspect ratio.
    pub fn with_size(mut self, width: Option<Px>, height: Option<Px>) -> Picture {
        self.width = width;
        self.height = height;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn natural_size(&self) -> (Px, Px) {
        let (w, h) = self.image.dimensions();
        let nat_w = Px::from_i32(w.min(i32::MAX as u32) as i32);
        let nat_h = Px::from_i32(h.min(i32::MAX as u32) as i32);
        match (self.width, self.height) {
            (Some(width), Some(height)) => (width, height),
            (Some(width), None) if w > 0 => (width, width.mul_ratio(h as i32, w as i32)),
            (None, Some(height)) if h > 0 => (height.mul_ratio(w as i32, h as i32), height),
            _ => (nat_w, nat_h),
        }
    }
}

impl Embedded for Picture {
    fn name(&self) -> &str {
        "picture"
    }

    fn measure(&self, available: Size) -> Measured {
        let (mut width, mut height) = self.natural_size();
        if width > available.width && width.is_positive() {
            let scaled = available.width.max(Px::ZERO);
            height = height.mul_ratio(scaled.to_milli_i32(), width.to_milli_i32());
            width = scaled;
        }
        Measured {
            width,
            height,
            clip: true,
        }
    }

    fn draw(&self, canvas: &mut Canvas, bounds: Rect) {
        canvas.draw_image(bounds, self.image.clone());
    }
}

/// Zero-size stand-in for an object or picture that failed to load.
pub struct Placeholder {
    name: String,
}

impl Placeholder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Embedded for Placeholder {
    fn name(&self) -> &str {
        &self.name
    }

    fn measure(&self, _available: Size) -> Measured {
        Measured {
            width: Px::ZERO,
            height: Px::ZERO,
            clip: false,
        }
    }

    fn draw(&self, _canvas: &mut Canvas, _bounds: Rect) {}
}

#[derive(Clone)]
pub struct ObjectEntry {
    pub object: Arc<dyn Embedded>,
    /// Markup override of the object's own layout options.
    pub options: Option<LayoutOptions>,
    pub position: Option<(Px, Px)>,
}

impl ObjectEntry {
    pub fn options(&self) -> LayoutOptions {
        self.options.unwrap_or_else(|| self.object.layout_options())
    }

    pub fn position(&self) -> Option<(Px, Px)> {
        self.position.or_else(|| self.object.fixed_position())
    }
}

/// Objects referenced by `Object` records, plus host objects registered by name.
#[derive(Default, Clone)]
pub struct ObjectTable {
    entries: Vec<ObjectEntry>,
    named: HashMap<String, Arc<dyn Embedded>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an instance and returns the id stored in its `Object` record.
    pub fn insert(&mut self, entry: ObjectEntry) -> Result<u32, RippleError> {
        let id = u32::try_from(self.entries.len())
            .map_err(|_| RippleError::Capacity("object table is full".to_string()))?;
        self.entries.try_reserve(1)?;
        self.entries.push(entry);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&ObjectEntry> {
        self.entries.get(id as usize)
    }

    pub fn register(&mut self, name: &str, object: Arc<dyn Embedded>) {
        self.named.insert(name.trim().to_ascii_lowercase(), object);
    }

    pub fn named(&self, name: &str) -> Option<Arc<dyn Embedded>> {
        self.named.get(&name.trim().to_ascii_lowercase()).cloned()
    }

    pub fn clear_instances(&mut self) {
        self.entries.clear();
    }
}

fn short(source: &str) -> &str {
    if source.starts_with("data:") {
        "data URI"
    } else {
        source
    }
}

pub(crate) fn decode_image(data: &[u8], mime: Option<&str>) -> Option<RgbaImage> {
    let guessed_format = if let Some(mime) = mime {
        if mime.contains("png") {
            Some(image::ImageFormat::Png)
        } else if mime.contains("jpeg") || mime.contains("jpg") {
            Some(image::ImageFormat::Jpeg)
        } else {
            None
        }
    } else {
        image::guess_format(data).ok()
    };

    let decoded = if let Some(fmt) = guessed_format {
        image::load_from_memory_with_format(data, fmt).ok()?
    } else {
        image::load_from_memory(data).ok()?
    };
    Some(decoded.to_rgba8())
}

pub(crate) fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    if !uri.starts_with("data:") {
        return None;
    }
    let (header, payload) = uri.split_once(',')?;
    let mime = header
        .trim_start_matches("data:")
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .ok()?
    } else {
        payload.as_bytes().to_vec()
    };
    Some((mime, data))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Solid box of a fixed size used by layout tests.
    pub(crate) struct BoxObject {
        pub(crate) width: Px,
        pub(crate) height: Px,
        pub(crate) options: LayoutOptions,
        pub(crate) position: Option<(Px, Px)>,
    }

    impl BoxObject {
        pub(crate) fn new(width: i32, height: i32, options: LayoutOptions) -> Self {
            Self {
                width: Px::from_i32(width),
                height: Px::from_i32(height),
                options,
                position: None,
            }
        }
    }

    impl Embedded for BoxObject {
        fn name(&self) -> &str {
            "box"
        }

        fn measure(&self, _available: Size) -> Measured {
            Measured {
                width: self.width,
                height: self.height,
                clip: true,
            }
        }

        fn layout_options(&self) -> LayoutOptions {
            self.options
        }

        fn fixed_position(&self) -> Option<(Px, Px)> {
            self.position
        }

        fn draw(&self, canvas: &mut Canvas, bounds: Rect) {
            canvas.fill_rect(bounds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut src = RgbaImage::new(width, height);
        for pixel in src.pixels_mut() {
            *pixel = image::Rgba([255, 0, 0, 255]);
        }
        let mut bytes = Vec::new();
        src.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        bytes
    }

    #[test]
    fn parse_data_uri_base64_decodes_payload() {
        let (mime, data) = parse_data_uri("data:text/plain;base64,SGVsbG8=").unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(data, b"Hello");
        assert!(parse_data_uri("picture.png").is_none());
    }

    #[test]
    fn pictures_load_from_data_uri_and_scale_to_fit() {
        let uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png_bytes(40, 20))
        );
        let picture = Picture::load(&uri, None).unwrap();
        let fitted = picture.measure(Size::new(Px::from_i32(20), Px::UNBOUNDED));
        assert_eq!(fitted.width, Px::from_i32(20));
        assert_eq!(fitted.height, Px::from_i32(10));

        let sized = picture.with_size(None, Some(Px::from_i32(10)));
        let natural = sized.measure(Size::new(Px::from_i32(500), Px::UNBOUNDED));
        assert_eq!(natural.width, Px::from_i32(20));
    }

    #[test]
    fn undecodable_pictures_are_resource_errors() {
        let err = Picture::load("data:image/png;base64,AAAA", None);
        assert!(matches!(err, Err(RippleError::Resource(_))));
        let placeholder = Placeholder::new("missing");
        let measured = placeholder.measure(Size::default());
        assert_eq!(measured.width, Px::ZERO);
        assert!(!measured.clip);
    }

    #[test]
    fn layout_option_lists_parse_and_report_unknown_names() {
        let (options, unknown) = LayoutOptions::parse("square|Right, bogus");
        assert!(options.contains(LayoutOptions::SQUARE));
        assert!(options.contains(LayoutOptions::RIGHT));
        assert_eq!(unknown, vec!["bogus".to_string()]);
        assert!(options.is_floating());
        assert!(!LayoutOptions::BACKGROUND.is_floating());
    }

    #[test]
    fn object_table_assigns_sequential_ids_and_named_lookup() {
        let mut table = ObjectTable::new();
        let entry = ObjectEntry {
            object: Arc::new(Placeholder::new("a")),
            options: Some(LayoutOptions::FOREGROUND),
            position: None,
        };
        assert_eq!(table.insert(entry.clone()).unwrap(), 0);
        assert_eq!(table.insert(entry).unwrap(), 1);
        assert_eq!(table.get(1).map(|e| e.options()), Some(LayoutOptions::FOREGROUND));
        table.register("Clock", Arc::new(Placeholder::new("clock")));
        assert!(table.named("clock").is_some());
    }
}
