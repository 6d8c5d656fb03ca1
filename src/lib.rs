mod callback;
mod canvas;
mod debug;
mod error;
mod font;
mod keymap;
mod layout;
mod markup;
mod metrics;
mod object;
mod perf;
mod raster;
mod records;
mod render;
mod segments;
mod stream;
mod style;
mod table;
mod types;

pub use callback::{Callback, CallbackArgs, CallbackKind, CallbackResult, ScriptBridge};
pub use canvas::{Canvas, Command, DisplayList};
use debug::DebugLogger;
pub use error::RippleError;
pub use font::{DEFAULT_FONT_SIZE, FontCache, FontFace, FontMetrics, FontRegistry};
pub use keymap::{KeyBinding, resolve_binding, resolve_key, resolve_qualifiers};
pub use layout::{
    EditDef, Layout, LayoutConfig, LayoutContext, MAX_DEPTH, MAX_PAGE_WIDTH, MAX_REPASS,
    MIN_PAGE_WIDTH,
};
pub use markup::{
    CompileReport, CompileTarget, Content, Item, MARKUP_EXTENSIONS, compile, evaluate, substitute,
};
pub use metrics::{DocumentMetrics, LayoutMetrics};
pub use object::{
    Embedded, LayoutOptions, Measured, ObjectEntry, ObjectTable, Picture, Placeholder,
};
use perf::PerfLogger;
pub use raster::{rasterize, to_png};
pub use records::{
    Cell, FontStyle, IndexStart, Link, LinkKind, ListKind, ListStart, ParagraphStart, Record,
    RecordKind, Row, SetMargins, TableStart, name_hash,
};
pub use render::{RenderContext, RenderOptions, render};
pub use segments::{
    BoxKind, BoxPlacement, Clip, EditRegion, LinkRegion, Marker, ObjectLayer, ObjectPlacement,
    Segment, SegmentFlags, SegmentIndex, TextRun,
};
pub use stream::{ESC, RecordView, Stream, StructureMap, Unit};
pub use style::TextStyle;
pub use types::{Color, HAlign, Length, Margins, Px, Rect, Size, VAlign};

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ripple_stream_contract as contract;
use serde_json::{Map, Value, json};
use tiny_skia::Pixmap;

/// A laid-out document: its stream, the layout derived from it and the host hooks it calls.
pub struct Document {
    config: LayoutConfig,
    paragraph_defaults: (f32, f32),
    page_colour: Option<Color>,
    metrics: Arc<dyn FontMetrics>,
    fonts: Option<Arc<FontCache>>,
    content: Content,
    layout: Layout,
    callbacks: HashMap<String, Callback>,
    base_dir: Option<PathBuf>,
    compile_warnings: Vec<String>,
    doc_metrics: DocumentMetrics,
    redraw_suspended: bool,
    active: bool,
    /// Fragments share their parent's loggers; only the root writes the summary.
    root: bool,
    debug: Option<Arc<DebugLogger>>,
    perf: Option<Arc<PerfLogger>>,
}

/// What lies under a point of the laid-out page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitTest {
    pub segment: usize,
    /// Nearest character boundary to the point.
    pub stream_index: usize,
    pub caret_x: Px,
    pub link: Option<usize>,
    pub edit: Option<usize>,
}

impl Document {
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    /// Compiles markup and appends it to the document.
    ///
    /// Compilation runs against a copy of the content, so a source that fails to parse leaves the
    /// document exactly as it was.
    pub fn feed(&mut self, markup: &str) -> Result<CompileReport, RippleError> {
        let started = Instant::now();
        let mut content = self.content.clone();
        let report = {
            let (leading, spacing) = self.paragraph_defaults;
            let mut target = CompileTarget::new(&mut content, &self.config.base_style)
                .with_base_dir(self.base_dir.as_deref())
                .with_paragraph_defaults(leading, spacing)
                .with_debug(self.debug.as_deref());
            markup::compile(markup, &mut target)?
        };
        self.content = content;
        for warning in &report.warnings {
            log::warn!("{}", warning);
            self.compile_warnings.push(warning.to_string());
        }
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.doc_metrics.compile_ms = ms;
        if let Some(perf) = self.perf.as_deref() {
            perf.log_span_ms("compile", None, ms);
            perf.log_counts(
                "compile",
                None,
                &[
                    ("elements", report.elements as u64),
                    ("skipped", report.skipped as u64),
                    ("resource_failures", report.resource_failures as u64),
                ],
            );
        }
        self.begin_layout().layout_pass(None);
        Ok(report)
    }

    /// Loads a markup file. Relative picture paths resolve against the file's directory.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<CompileReport, RippleError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !MARKUP_EXTENSIONS.contains(&extension.as_str()) {
            return Err(RippleError::InvalidConfiguration(format!(
                "unsupported document extension '{}' (expected one of {})",
                extension,
                MARKUP_EXTENSIONS.join(", ")
            )));
        }
        let source = std::fs::read_to_string(path)?;
        let previous = match path.parent() {
            Some(parent) => self.base_dir.replace(parent.to_path_buf()),
            None => self.base_dir.clone(),
        };
        let report = self.feed(&source);
        if report.is_err() {
            self.base_dir = previous;
        }
        report
    }

    pub fn resize(&mut self, width: i32) -> Result<(), RippleError> {
        validate_width(width)?;
        if Px::from_i32(width) == self.config.width {
            return Ok(());
        }
        self.config.width = Px::from_i32(width);
        self.begin_layout().layout_pass(None);
        Ok(())
    }

    /// Inserts text at a unit boundary and re-lays from the nearest checkpoint.
    pub fn insert_text(&mut self, index: usize, text: &str) -> Result<usize, RippleError> {
        let end = self.content.stream.insert_text(index, text)?;
        self.shift_items(index, 0, end - index);
        self.layout_pass(Some(index));
        Ok(end)
    }

    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<(), RippleError> {
        self.content.stream.remove_range(start, end)?;
        self.shift_items(start, end - start, 0);
        self.layout_pass(Some(start));
        Ok(())
    }

    /// Shows or hides every index region called `name`. Returns how many regions changed.
    pub fn set_index_visible(&mut self, name: &str, visible: bool) -> Result<usize, RippleError> {
        let hash = records::name_hash(name);
        let mut changes = Vec::new();
        let stream = &self.content.stream;
        for unit in stream.units(0, stream.len()) {
            let Unit::Record(view) = unit? else {
                continue;
            };
            if view.kind != RecordKind::IndexStart {
                continue;
            }
            if let Record::IndexStart(start) = view.record()? {
                if start.name_hash == hash && start.visible != visible {
                    changes.push((view.index, IndexStart { visible, ..start }));
                }
            }
        }
        let Some(first) = changes.first().map(|(index, _)| *index) else {
            return Ok(0);
        };
        let mut stream = self.content.stream.clone();
        for (index, start) in &changes {
            stream.rewrite_record(*index, &Record::IndexStart(*start))?;
        }
        self.content.stream = stream;
        self.layout_pass(Some(first));
        Ok(changes.len())
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) {
        self.content.variables.insert(name.to_string(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.content.variables.get(name).map(String::as_str)
    }

    /// Draws the current layout. Nothing is drawn while a layout transaction is open.
    pub fn render(&mut self, canvas: &mut Canvas, options: &RenderOptions) -> usize {
        if self.redraw_suspended {
            log::debug!("render skipped: redraw is suspended");
            return 0;
        }
        let started = Instant::now();
        let mut options = options.clone();
        if options.page_colour.is_none() {
            options.page_colour = self.page_colour;
        }
        let ctx = RenderContext {
            stream: &self.content.stream,
            layout: &self.layout,
            objects: &self.content.objects,
            metrics: &*self.metrics,
            base_style: &self.config.base_style,
        };
        let count = render::render(&ctx, canvas, &options);
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.doc_metrics.render_ms = ms;
        self.doc_metrics.render_commands = count;
        if let Some(perf) = self.perf.as_deref() {
            perf.log_span_ms("render", None, ms);
        }
        count
    }

    /// Renders the whole page and rasterises it at `scale` device pixels per document pixel.
    pub fn rasterize(&mut self, scale: f32) -> Result<Pixmap, RippleError> {
        let mut canvas = Canvas::new(self.page_size());
        self.render(&mut canvas, &RenderOptions::default());
        let list = canvas.finish();
        let fonts = self.fonts.as_deref().map(FontCache::registry);
        match self.perf.as_deref() {
            Some(perf) => perf.span("raster", None, || raster::rasterize(&list, scale, fonts)),
            None => raster::rasterize(&list, scale, fonts),
        }
    }

    pub fn render_png(&mut self, scale: f32) -> Result<Vec<u8>, RippleError> {
        let pixmap = self.rasterize(scale)?;
        raster::to_png(&pixmap)
    }

    pub fn hit_test(&self, x: Px, y: Px) -> Option<HitTest> {
        let index = self.layout.index();
        let segment = index.segment_at(x, y)?;
        let start = index.segments().get(segment)?.stream_start;
        let seed = self
            .layout
            .style_seed(start)
            .unwrap_or((0, &self.config.base_style));
        let (stream_index, caret_x) = index.resolve_screen_position(
            &self.content.stream,
            &*self.metrics,
            seed,
            segment,
            x,
        )?;
        Some(HitTest {
            segment,
            stream_index,
            caret_x,
            link: index.link_at(x, y),
            edit: index.edit_at(x, y),
        })
    }

    /// Runs the callback behind a link. `function` links call the callback registered under their
    /// target; `href` links call the one registered as `"link"`.
    pub fn activate_link(&mut self, link: usize) -> Result<CallbackResult, RippleError> {
        self.check_active("link activation")?;
        let region = self
            .layout
            .index()
            .links()
            .get(link)
            .cloned()
            .ok_or_else(|| RippleError::InvalidConfiguration(format!("no link region {link}")))?;
        let name = match region.kind {
            LinkKind::Function => region.target.clone(),
            LinkKind::Href => "link".to_string(),
        };
        let args = CallbackArgs {
            kind: CallbackKind::LinkActivate,
            element_id: region.element_id,
            target: region.target,
            text: String::new(),
        };
        Ok(self
            .dispatch(&name, &args)
            .unwrap_or(CallbackResult::Reject))
    }

    /// Checks proposed content for an edit region against its definition and `onchange` hook.
    pub fn validate_edit(&mut self, edit: usize, text: &str) -> Result<CallbackResult, RippleError> {
        self.check_active("edit validation")?;
        let region = self.edit_region(edit)?;
        if region
            .max_chars
            .is_some_and(|max| text.chars().count() > max)
        {
            return Ok(CallbackResult::Reject);
        }
        if !region.line_breaks && text.contains('\n') {
            return Ok(CallbackResult::Reject);
        }
        let Some(hook) = region.on_change.clone() else {
            return Ok(CallbackResult::Accept);
        };
        let args = edit_args(CallbackKind::EditChange, &region, text);
        Ok(self
            .dispatch(&hook, &args)
            .unwrap_or(CallbackResult::Accept))
    }

    /// Validates `text` and, if accepted, replaces the edit region's content with it.
    pub fn commit_edit(&mut self, edit: usize, text: &str) -> Result<CallbackResult, RippleError> {
        if self.validate_edit(edit, text)? == CallbackResult::Reject {
            return Ok(CallbackResult::Reject);
        }
        let region = self.edit_region(edit)?;
        let (start, end) = (region.content_start, region.content_end);
        let mut stream = self.content.stream.clone();
        stream.remove_range(start, end)?;
        stream.insert_text(start, text)?;
        self.content.stream = stream;
        self.shift_items(start, end - start, text.len());
        self.layout_pass(Some(start));
        Ok(CallbackResult::Accept)
    }

    pub fn enter_edit(&mut self, edit: usize) -> Result<(), RippleError> {
        self.edit_hook(edit, CallbackKind::EditEnter)
    }

    pub fn exit_edit(&mut self, edit: usize) -> Result<(), RippleError> {
        self.edit_hook(edit, CallbackKind::EditExit)
    }

    /// Current text of an edit region, without records.
    pub fn edit_text(&self, edit: usize) -> Option<String> {
        let region = self.layout.index().edits().get(edit)?;
        let mut text = String::new();
        for unit in self
            .content
            .stream
            .units(region.content_start, region.content_end)
        {
            if let Ok(Unit::Text { text: run, .. }) = unit {
                text.push_str(run);
            }
        }
        Some(text)
    }

    pub fn register_callback(&mut self, name: &str, callback: Callback) {
        self.callbacks.insert(name.to_string(), callback);
    }

    /// Makes a host object available to `<object name="...">` in markup fed after this call.
    pub fn register_object(&mut self, name: &str, object: Arc<dyn Embedded>) {
        self.content.objects.register(name, object);
    }

    /// Compiles the menu nested in an item into a document of its own.
    ///
    /// The child shares fonts, loggers, callbacks, named objects, templates and the variables as
    /// they are now.
    pub fn open_fragment(&self, item: usize) -> Result<Document, RippleError> {
        let source = self
            .content
            .items
            .get(item)
            .and_then(|item| item.fragment)
            .and_then(|fragment| self.content.fragments.get(fragment))
            .ok_or_else(|| {
                RippleError::InvalidConfiguration(format!("item {item} has no menu fragment"))
            })?
            .clone();
        let mut child = self.spawn();
        child.content.variables = self.content.variables.clone();
        child.content.templates = self.content.templates.clone();
        child.content.objects = self.content.objects.clone();
        child.content.objects.clear_instances();
        child.feed(&source)?;
        Ok(child)
    }

    /// First enabled item bound to `key` that responds to keys.
    pub fn find_item_by_key(&self, key: KeyBinding) -> Option<usize> {
        self.content
            .items
            .iter()
            .position(|item| item.key == Some(key) && !item.disabled && !item.no_key_response)
    }

    /// Writes the stream, variables and edit definitions to a cache file.
    ///
    /// Objects, items and templates are not cached; a document loaded from cache has the same
    /// text and structure with embedded objects drawn as empty space.
    pub fn save_cache(&self, path: impl AsRef<Path>) -> Result<(), RippleError> {
        let mut extra = Map::new();
        extra.insert("width".to_string(), json!(self.config.width.to_f32()));
        extra.insert("variables".to_string(), json!(self.content.variables));
        let mut edits: Vec<&EditDef> = self.content.edits.values().collect();
        edits.sort_by(|a, b| a.name.cmp(&b.name));
        let edits: Vec<Value> = edits
            .into_iter()
            .map(|def| {
                json!({
                    "name": def.name,
                    "max_chars": def.max_chars,
                    "line_breaks": def.line_breaks,
                    "on_enter": def.on_enter,
                    "on_exit": def.on_exit,
                    "on_change": def.on_change,
                })
            })
            .collect();
        extra.insert("edits".to_string(), Value::Array(edits));
        let bytes = contract::encode(self.content.stream.as_bytes(), extra);
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Replaces the document content with a cache file written by [`Document::save_cache`].
    pub fn load_cache(&mut self, path: impl AsRef<Path>) -> Result<(), RippleError> {
        let bytes = std::fs::read(path)?;
        let (manifest, stream_bytes) =
            contract::decode(&bytes).map_err(|err| RippleError::Resource(err.to_string()))?;
        let mut content = Content::new();
        content.stream = Stream::from_bytes(stream_bytes)?;
        if let Some(Value::Object(variables)) = manifest.extra.get("variables") {
            for (name, value) in variables {
                if let Some(value) = value.as_str() {
                    content.variables.insert(name.clone(), value.to_string());
                }
            }
        }
        if let Some(Value::Array(edits)) = manifest.extra.get("edits") {
            for entry in edits {
                let Some(def) = edit_def_from_json(entry) else {
                    log::warn!("skipping malformed edit definition in cache");
                    continue;
                };
                content.edits.insert(records::name_hash(&def.name), def);
            }
        }
        content.objects = self.content.objects.clone();
        content.objects.clear_instances();
        self.content = content;
        self.begin_layout().layout_pass(None);
        Ok(())
    }

    /// Suspends drawing until the returned transaction is dropped.
    pub fn begin_layout(&mut self) -> LayoutTransaction<'_> {
        let resume = !self.redraw_suspended;
        self.redraw_suspended = true;
        LayoutTransaction {
            document: self,
            resume,
        }
    }

    pub fn is_redraw_suspended(&self) -> bool {
        self.redraw_suspended
    }

    pub fn stream(&self) -> &Stream {
        &self.content.stream
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn segments(&self) -> &[Segment] {
        self.layout.index().segments()
    }

    pub fn clips(&self) -> &[Clip] {
        self.layout.index().clips()
    }

    pub fn links(&self) -> &[LinkRegion] {
        self.layout.index().links()
    }

    pub fn edits(&self) -> &[EditRegion] {
        self.layout.index().edits()
    }

    pub fn items(&self) -> &[Item] {
        &self.content.items
    }

    pub fn layout_errors(&self) -> &[RippleError] {
        self.layout.errors()
    }

    pub fn compile_warnings(&self) -> &[String] {
        &self.compile_warnings
    }

    pub fn metrics(&self) -> &DocumentMetrics {
        &self.doc_metrics
    }

    pub fn width(&self) -> Px {
        self.layout.width()
    }

    pub fn height(&self) -> Px {
        self.layout.height()
    }

    pub fn page_size(&self) -> Size {
        Size::new(self.layout.width(), self.layout.height())
    }

    fn spawn(&self) -> Document {
        Document {
            config: self.config.clone(),
            paragraph_defaults: self.paragraph_defaults,
            page_colour: self.page_colour,
            metrics: Arc::clone(&self.metrics),
            fonts: self.fonts.clone(),
            content: Content::new(),
            layout: Layout::default(),
            callbacks: self.callbacks.clone(),
            base_dir: self.base_dir.clone(),
            compile_warnings: Vec::new(),
            doc_metrics: DocumentMetrics::default(),
            redraw_suspended: false,
            active: false,
            root: false,
            debug: self.debug.clone(),
            perf: self.perf.clone(),
        }
    }

    /// Full pass when `from` is `None`, otherwise a resumed pass from the checkpoint before it.
    fn layout_pass(&mut self, from: Option<usize>) {
        let started = Instant::now();
        let ctx = LayoutContext::new(
            &self.content.stream,
            &*self.metrics,
            &self.content.objects,
            &self.content.edits,
            &self.config,
        )
        .with_debug(self.debug.as_deref());
        match from {
            Some(index) => self.layout.relayout_from(&ctx, index),
            None => self.layout = Layout::run(&ctx),
        }
        for error in self.layout.errors() {
            log::debug!("layout: {}", error);
        }
        let layout_metrics = *self.layout.metrics();
        self.doc_metrics.layout = layout_metrics;
        self.doc_metrics.stream_bytes = self.content.stream.len();
        if let Some(perf) = self.perf.as_deref() {
            perf.log_span_ms("layout", None, started.elapsed().as_secs_f64() * 1000.0);
            perf.log_counts(
                "layout",
                None,
                &[
                    ("segments", layout_metrics.segments as u64),
                    ("clips", layout_metrics.clips as u64),
                    ("errors", layout_metrics.errors as u64),
                    ("table_repasses", layout_metrics.table_repasses),
                    ("list_repasses", layout_metrics.list_repasses),
                ],
            );
        }
    }

    fn check_active(&self, what: &str) -> Result<(), RippleError> {
        if !self.active {
            return Ok(());
        }
        log::warn!("{} rejected: a callback is already running", what);
        if let Some(debug) = self.debug.as_deref() {
            debug.event("callback.reentrant", json!({ "operation": what }));
            debug.increment("callback.reentrant", 1);
        }
        Err(RippleError::Reentrant(format!(
            "{what} while a callback is running"
        )))
    }

    /// Invokes a registered callback with the re-entrancy flag raised. `None` when no callback
    /// is registered under `name`.
    fn dispatch(&mut self, name: &str, args: &CallbackArgs) -> Option<CallbackResult> {
        let Some(callback) = self.callbacks.get(name).cloned() else {
            log::debug!("no callback registered as '{}'", name);
            return None;
        };
        self.active = true;
        let result = callback.invoke(self, args);
        self.active = false;
        Some(result)
    }

    fn edit_region(&self, edit: usize) -> Result<EditRegion, RippleError> {
        self.layout
            .index()
            .edits()
            .get(edit)
            .cloned()
            .ok_or_else(|| RippleError::InvalidConfiguration(format!("no edit region {edit}")))
    }

    fn edit_hook(&mut self, edit: usize, kind: CallbackKind) -> Result<(), RippleError> {
        self.check_active("edit focus change")?;
        let region = self.edit_region(edit)?;
        let hook = match kind {
            CallbackKind::EditEnter => region.on_enter.clone(),
            _ => region.on_exit.clone(),
        };
        let Some(hook) = hook else {
            return Ok(());
        };
        let text = self.edit_text(edit).unwrap_or_default();
        let args = edit_args(kind, &region, &text);
        self.dispatch(&hook, &args);
        Ok(())
    }

    /// Keeps item stream indices pointing at their records after `removed` bytes at `at` were
    /// replaced by `inserted` bytes.
    fn shift_items(&mut self, at: usize, removed: usize, inserted: usize) {
        let end = at + removed;
        self.content
            .items
            .retain(|item| removed == 0 || item.stream_index < at || item.stream_index >= end);
        for item in &mut self.content.items {
            if item.stream_index >= end {
                item.stream_index = item.stream_index - removed + inserted;
            }
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if !self.root {
            return;
        }
        if let Some(debug) = self.debug.as_deref() {
            debug.emit_summary("document");
            debug.flush();
        }
        if let Some(perf) = self.perf.as_deref() {
            perf.flush();
        }
    }
}

fn edit_args(kind: CallbackKind, region: &EditRegion, text: &str) -> CallbackArgs {
    CallbackArgs {
        kind,
        element_id: region.element_id,
        target: region.name.clone(),
        text: text.to_string(),
    }
}

fn edit_def_from_json(value: &Value) -> Option<EditDef> {
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    Some(EditDef {
        name: text("name")?,
        max_chars: value
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|max| max as usize),
        line_breaks: value
            .get("line_breaks")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        on_enter: text("on_enter"),
        on_exit: text("on_exit"),
        on_change: text("on_change"),
    })
}

fn validate_width(width: i32) -> Result<(), RippleError> {
    if !(MIN_PAGE_WIDTH..=MAX_PAGE_WIDTH).contains(&width) {
        return Err(RippleError::InvalidConfiguration(format!(
            "page width {width} is outside {MIN_PAGE_WIDTH}..={MAX_PAGE_WIDTH}"
        )));
    }
    Ok(())
}

/// Scope during which the document does not draw. Dropping it re-enables drawing, on every exit
/// path.
pub struct LayoutTransaction<'d> {
    document: &'d mut Document,
    resume: bool,
}

impl Deref for LayoutTransaction<'_> {
    type Target = Document;

    fn deref(&self) -> &Document {
        &*self.document
    }
}

impl DerefMut for LayoutTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Document {
        &mut *self.document
    }
}

impl Drop for LayoutTransaction<'_> {
    fn drop(&mut self) {
        if self.resume {
            self.document.redraw_suspended = false;
        }
    }
}

pub struct DocumentBuilder {
    width: i32,
    min_height: i32,
    margins: Margins,
    font_face: String,
    font_size: f32,
    text_colour: Color,
    link_colour: Color,
    background_colour: Option<Color>,
    leading: f32,
    spacing: f32,
    tab_width: i32,
    max_depth: usize,
    max_repass: usize,
    metrics: Option<Arc<dyn FontMetrics>>,
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    debug_path: Option<PathBuf>,
    perf_path: Option<PathBuf>,
    base_dir: Option<PathBuf>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self {
            width: 640,
            min_height: 0,
            margins: Margins::all(4.0),
            font_face: "sans-serif".to_string(),
            font_size: DEFAULT_FONT_SIZE as f32,
            text_colour: Color::BLACK,
            link_colour: Color::rgb(0.0, 0.0, 0.8),
            background_colour: None,
            leading: 1.0,
            spacing: 1.0,
            tab_width: 40,
            max_depth: MAX_DEPTH,
            max_repass: MAX_REPASS,
            metrics: None,
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            debug_path: None,
            perf_path: None,
            base_dir: None,
        }
    }

    pub fn width(mut self, width: i32) -> Self {
        self.width = width;
        self
    }

    pub fn min_height(mut self, height: i32) -> Self {
        self.min_height = height;
        self
    }

    pub fn margins(mut self, margins: Margins) -> Self {
        self.margins = margins;
        self
    }

    pub fn margin_all(mut self, margin: f32) -> Self {
        self.margins = Margins::all(margin);
        self
    }

    pub fn font(mut self, face: &str, size: f32) -> Self {
        self.font_face = face.to_string();
        self.font_size = size;
        self
    }

    pub fn text_colour(mut self, colour: Color) -> Self {
        self.text_colour = colour;
        self
    }

    pub fn link_colour(mut self, colour: Color) -> Self {
        self.link_colour = colour;
        self
    }

    pub fn background_colour(mut self, colour: Color) -> Self {
        self.background_colour = Some(colour);
        self
    }

    /// Default paragraph leading and line spacing, both as multiples of the line height.
    pub fn paragraph_defaults(mut self, leading: f32, spacing: f32) -> Self {
        self.leading = leading;
        self.spacing = spacing;
        self
    }

    pub fn tab_width(mut self, width: i32) -> Self {
        self.tab_width = width;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn max_repass(mut self, passes: usize) -> Self {
        self.max_repass = passes;
        self
    }

    /// Replaces the font-backed metrics with a host service.
    pub fn font_metrics(mut self, metrics: Arc<dyn FontMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register_font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Document, RippleError> {
        validate_width(self.width)?;
        if self.min_height < 0 {
            return Err(RippleError::InvalidConfiguration(
                "min_height must be >= 0".to_string(),
            ));
        }
        if self.max_depth == 0 || self.max_depth > MAX_DEPTH {
            return Err(RippleError::InvalidConfiguration(format!(
                "max_depth must be within 1..={MAX_DEPTH}"
            )));
        }
        if self.max_repass > MAX_REPASS {
            return Err(RippleError::InvalidConfiguration(format!(
                "max_repass must be <= {MAX_REPASS}"
            )));
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(RippleError::InvalidConfiguration(
                "font size must be > 0".to_string(),
            ));
        }
        if self.tab_width <= 0 {
            return Err(RippleError::InvalidConfiguration(
                "tab_width must be > 0".to_string(),
            ));
        }
        for value in [self.leading, self.spacing] {
            if !value.is_finite() || value < 0.0 {
                return Err(RippleError::InvalidConfiguration(
                    "paragraph leading and spacing must be >= 0".to_string(),
                ));
            }
        }

        let mut registry = FontRegistry::new();
        for dir in &self.font_dirs {
            registry.register_dir(dir);
        }
        for file in &self.font_files {
            registry.register_file(file)?;
        }
        let fonts = Arc::new(FontCache::new(registry));
        let metrics: Arc<dyn FontMetrics> = match self.metrics {
            Some(metrics) => metrics,
            None => fonts.clone() as Arc<dyn FontMetrics>,
        };
        let debug = if let Some(path) = self.debug_path {
            Some(Arc::new(DebugLogger::new(path)?))
        } else {
            None
        };
        let perf = if let Some(path) = self.perf_path {
            Some(Arc::new(PerfLogger::new(path)?))
        } else {
            None
        };

        let face = FontFace::new(&self.font_face, Px::from_f32(self.font_size), 0);
        let base_style = TextStyle::new(face, self.text_colour, self.link_colour);
        let mut config = LayoutConfig::new(Px::from_i32(self.width), base_style);
        config.min_height = Px::from_i32(self.min_height);
        config.margins = self.margins;
        config.tab_width = Px::from_i32(self.tab_width);
        config.max_depth = self.max_depth;
        config.max_repass = self.max_repass;

        Ok(Document {
            config,
            paragraph_defaults: (self.leading, self.spacing),
            page_colour: self.background_colour,
            metrics,
            fonts: Some(fonts),
            content: Content::new(),
            layout: Layout::default(),
            callbacks: HashMap::new(),
            base_dir: self.base_dir,
            compile_warnings: Vec::new(),
            doc_metrics: DocumentMetrics::default(),
            redraw_suspended: false,
            active: false,
            root: true,
            debug,
            perf,
        })
    }
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::testing::TableMetrics;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn doc(width: i32) -> Document {
        Document::builder()
            .width(width)
            .margin_all(0.0)
            .font_metrics(Arc::new(TableMetrics::new(10, 20)))
            .build()
            .unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ripple_{}_{}", std::process::id(), name))
    }

    fn plain(doc: &Document) -> String {
        let stream = doc.stream();
        stream
            .units(0, stream.len())
            .filter_map(|unit| match unit {
                Ok(Unit::Text { text, .. }) => Some(text.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn build_validates_configuration() {
        for width in [10, 40_000] {
            assert!(matches!(
                Document::builder().width(width).build(),
                Err(RippleError::InvalidConfiguration(_))
            ));
        }
        assert!(Document::builder().max_depth(0).build().is_err());
        assert!(Document::builder().max_depth(MAX_DEPTH + 1).build().is_err());
        assert!(Document::builder().max_repass(MAX_REPASS + 1).build().is_err());
        assert!(Document::builder().font("serif", 0.0).build().is_err());
        assert!(Document::builder().width(MIN_PAGE_WIDTH).build().is_ok());
    }

    #[test]
    fn feed_lays_out_and_keeps_content_on_parse_failure() {
        let mut doc = doc(300);
        doc.feed("<p>Hello world</p>").unwrap();
        assert_eq!(plain(&doc), "Hello world");
        assert!(!doc.segments().is_empty());
        assert!(doc.height().is_positive());
        let before = doc.stream().len();

        assert!(matches!(doc.feed("<p>broken"), Err(RippleError::Parse(_))));
        assert_eq!(doc.stream().len(), before);
        assert_eq!(plain(&doc), "Hello world");
    }

    #[test]
    fn narrower_width_wraps_onto_more_lines() {
        let mut doc = doc(300);
        doc.feed("<p>alpha beta gamma delta</p>").unwrap();
        let wide = doc.height();
        doc.resize(60).unwrap();
        assert!(doc.height() > wide);
        assert!(doc.resize(5).is_err());
    }

    #[test]
    fn render_is_suppressed_inside_a_layout_transaction() {
        let mut doc = doc(200);
        doc.feed("<p>text</p>").unwrap();
        {
            let mut tx = doc.begin_layout();
            let mut canvas = Canvas::new(tx.page_size());
            assert_eq!(tx.render(&mut canvas, &RenderOptions::default()), 0);
            assert!(tx.is_redraw_suspended());
        }
        assert!(!doc.is_redraw_suspended());
        let mut canvas = Canvas::new(doc.page_size());
        assert!(doc.render(&mut canvas, &RenderOptions::default()) > 0);
        assert!(canvas.finish().text().contains("text"));
        assert!(doc.metrics().render_commands > 0);
    }

    #[test]
    fn hit_test_finds_text_and_links() {
        let mut doc = doc(300);
        doc.feed("<p><a href='#next'>next</a> page</p>").unwrap();
        let link = doc.links()[0].rect;
        let hit = doc
            .hit_test(link.x + Px::from_i32(1), link.y + Px::from_i32(1))
            .unwrap();
        assert_eq!(hit.link, Some(0));
        assert_eq!(hit.edit, None);
        assert!(hit.stream_index <= doc.stream().len());
    }

    #[test]
    fn link_activation_rejects_reentry() {
        let mut doc = doc(300);
        doc.feed("<p><a function='go'>go</a></p>").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let nested_rejected = Arc::new(AtomicBool::new(false));
        let (c, n) = (calls.clone(), nested_rejected.clone());
        doc.register_callback(
            "go",
            Callback::native(move |doc, args| {
                c.fetch_add(1, Ordering::SeqCst);
                assert_eq!(args.kind, CallbackKind::LinkActivate);
                assert_eq!(args.target, "go");
                let nested = doc.activate_link(0);
                n.store(matches!(nested, Err(RippleError::Reentrant(_))), Ordering::SeqCst);
                CallbackResult::Accept
            }),
        );
        assert_eq!(doc.activate_link(0).unwrap(), CallbackResult::Accept);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(nested_rejected.load(Ordering::SeqCst));
        // Released after the callback returned.
        assert_eq!(doc.activate_link(0).unwrap(), CallbackResult::Accept);
        assert!(doc.activate_link(5).is_err());
    }

    #[test]
    fn href_links_without_a_handler_are_rejected() {
        let mut doc = doc(300);
        doc.feed("<p><a href='#top'>top</a></p>").unwrap();
        assert_eq!(doc.activate_link(0).unwrap(), CallbackResult::Reject);
    }

    #[test]
    fn edits_validate_and_commit() {
        let mut doc = doc(300);
        doc.feed(
            "<editdef name='code' maxchars='3' onchange='check'/>\
             <table><row><cell edit='code'>ab</cell></row></table>",
        )
        .unwrap();
        assert_eq!(doc.edits().len(), 1);
        assert_eq!(doc.edit_text(0).as_deref(), Some("ab"));
        doc.register_callback(
            "check",
            Callback::native(|_, args| {
                if args.text.contains('!') {
                    CallbackResult::Reject
                } else {
                    CallbackResult::Accept
                }
            }),
        );
        assert_eq!(doc.validate_edit(0, "abcd").unwrap(), CallbackResult::Reject);
        assert_eq!(doc.validate_edit(0, "a\nb").unwrap(), CallbackResult::Reject);
        assert_eq!(doc.validate_edit(0, "a!").unwrap(), CallbackResult::Reject);
        assert_eq!(doc.commit_edit(0, "xyz").unwrap(), CallbackResult::Accept);
        assert_eq!(doc.edit_text(0).as_deref(), Some("xyz"));
    }

    #[test]
    fn hiding_an_index_collapses_its_lines() {
        let mut doc = doc(300);
        doc.feed("<p>always</p><index name='More'><p>sometimes</p></index>")
            .unwrap();
        let shown = doc.height();
        assert_eq!(doc.set_index_visible("more", false).unwrap(), 1);
        assert!(doc.height() < shown);
        assert_eq!(doc.set_index_visible("more", false).unwrap(), 0);
        assert_eq!(doc.set_index_visible("more", true).unwrap(), 1);
        assert_eq!(doc.height(), shown);
    }

    #[test]
    fn inserted_text_is_laid_out_and_items_follow() {
        let mut doc = doc(300);
        doc.feed("<p>start</p><item id='a' text='Alpha'/>").unwrap();
        let item_index = doc.items()[0].stream_index;
        let at = 0;
        let end = doc.insert_text(at, "xx").unwrap();
        assert_eq!(end, at + 2);
        assert_eq!(doc.items()[0].stream_index, item_index + 2);
        assert!(plain(&doc).starts_with("xx"));
        let item = &doc.items()[0];
        assert_eq!(doc.stream().element_id(item.stream_index), Some(item.element_id));
        doc.remove_range(at, end).unwrap();
        assert_eq!(doc.items()[0].stream_index, item_index);
    }

    #[test]
    fn fragments_and_key_lookup() {
        let mut doc = doc(300);
        doc.set_variable("who", "you");
        doc.feed(
            "<ripple><item id='file' text='File' key='f' qualifier='alt'>\
             <menu><item text='Open [@who]'/></menu></item>\
             <item id='off' text='Off' key='g' disabled='yes'/></ripple>",
        )
        .unwrap();
        let alt_f = resolve_binding("f", Some("alt")).unwrap();
        assert_eq!(doc.find_item_by_key(alt_f), Some(0));
        let g = resolve_binding("g", None).unwrap();
        assert_eq!(doc.find_item_by_key(g), None);

        let child = doc.open_fragment(0).unwrap();
        assert_eq!(child.items().len(), 1);
        assert_eq!(plain(&child), "Open you");
        assert!(doc.open_fragment(1).is_err());
    }

    #[test]
    fn cache_round_trip_restores_stream_and_definitions() {
        let mut doc = doc(300);
        doc.set_variable("mode", "full");
        doc.feed("<editdef name='n' maxchars='4'/><p><b>bold</b> text</p>")
            .unwrap();
        let path = temp_path("cache.rplc");
        doc.save_cache(&path).unwrap();

        let mut restored = self::doc(300);
        restored.load_cache(&path).unwrap();
        assert_eq!(restored.stream().as_bytes(), doc.stream().as_bytes());
        assert_eq!(restored.variable("mode"), Some("full"));
        assert_eq!(restored.segments().len(), doc.segments().len());

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(restored.load_cache(&path), Err(RippleError::Resource(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_file_checks_extension() {
        let mut doc = doc(300);
        let bad = temp_path("doc.txt");
        std::fs::write(&bad, "<p>x</p>").unwrap();
        assert!(matches!(
            doc.load_file(&bad),
            Err(RippleError::InvalidConfiguration(_))
        ));
        let good = temp_path("doc.RPL");
        std::fs::write(&good, "<p>loaded</p>").unwrap();
        doc.load_file(&good).unwrap();
        assert_eq!(plain(&doc), "loaded");
        let _ = std::fs::remove_file(&bad);
        let _ = std::fs::remove_file(&good);
    }

    #[test]
    fn failed_load_keeps_content_and_asset_directory() {
        let mut doc = doc(300);
        let good = temp_path("kept.rpl");
        std::fs::write(&good, "<p>kept</p>").unwrap();
        doc.load_file(&good).unwrap();
        let dir = temp_path("broken_dir");
        std::fs::create_dir_all(&dir).unwrap();
        let broken = dir.join("broken.rpl");
        std::fs::write(&broken, "<p>broken").unwrap();
        assert!(matches!(doc.load_file(&broken), Err(RippleError::Parse(_))));
        assert_eq!(plain(&doc), "kept");
        assert_eq!(doc.base_dir.as_deref(), good.parent());
        let _ = std::fs::remove_file(&good);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rasterizes_the_page() {
        let mut doc = Document::builder()
            .width(40)
            .min_height(30)
            .background_colour(Color::rgb(1.0, 0.0, 0.0))
            .font_metrics(Arc::new(TableMetrics::new(10, 20)))
            .build()
            .unwrap();
        doc.feed("<p></p>").unwrap();
        let png = doc.render_png(1.0).unwrap();
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));
        let pixmap = doc.rasterize(1.0).unwrap();
        let pixel = pixmap.pixel(20, 15).unwrap();
        assert_eq!((pixel.red(), pixel.green(), pixel.blue()), (255, 0, 0));
    }
}
