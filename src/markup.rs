//! Markup Compiler: turns a tag tree into stream records.
//!
//! Content elements become start/end record pairs around their compiled children. Program
//! elements (`if`, `else`, `set`, `repeat`, `template`, `use`, `editdef`) never reach the stream;
//! they steer what gets compiled. Style elements emit the changed style on entry and the previous
//! style on exit, so every element leaves the running style as it found it.
//!
//! Problems inside the markup never abort a compile: unknown elements are skipped, bad attribute
//! values fall back to defaults and failed resources become zero-size placeholders. Each of these
//! is recorded in the [`CompileReport`]. Only malformed XML and stream growth failures are errors.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use roxmltree::{Document as XmlDocument, Node, ParsingOptions};
use serde_json::json;

use crate::debug::DebugLogger;
use crate::error::RippleError;
use crate::keymap::{self, KeyBinding};
use crate::layout::EditDef;
use crate::object::{Embedded, LayoutOptions, ObjectEntry, ObjectTable, Picture, Placeholder};
use crate::records::{
    self, Cell, FONT_BOLD, FONT_ITALIC, FontStyle, IndexStart, Link, LinkKind, ListKind,
    ListStart, ParagraphStart, Record, Row, SetMargins, TableStart,
};
use crate::stream::Stream;
use crate::style::TextStyle;
use crate::types::{Color, HAlign, Length, Px, VAlign};

/// File extensions that load through the markup compiler.
pub const MARKUP_EXTENSIONS: [&str; 3] = ["ripple", "rpl", "rml"];

const MAX_NESTING: usize = 128;
const MAX_REPEAT: i64 = 10_000;
const BULLET_INDENT: i32 = 14;
const MAX_LEADING: f32 = 20.0;
const MAX_VSPACING: f32 = 20.0;

/// An interactive entry declared with `<item>`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Item {
    /// Stream index of the item's paragraph record.
    pub stream_index: usize,
    pub element_id: u32,
    pub id: String,
    pub icon: Option<String>,
    pub text: String,
    pub sort: Option<String>,
    pub categorise: Option<String>,
    pub name: Option<String>,
    pub path: Option<String>,
    pub colour: Option<Color>,
    pub background: Option<Color>,
    pub key: Option<KeyBinding>,
    pub group: Option<String>,
    pub toggle: bool,
    pub disabled: bool,
    pub selected: bool,
    pub no_key_response: bool,
    pub key_repeat: bool,
    /// Index into [`Content::fragments`] of a nested menu, compiled on demand.
    pub fragment: Option<usize>,
}

/// Everything a document accumulates from its markup.
#[derive(Clone, Default)]
pub struct Content {
    pub stream: Stream,
    pub objects: ObjectTable,
    pub edits: HashMap<u32, EditDef>,
    pub items: Vec<Item>,
    /// Source of lazily compiled sub-documents.
    pub fragments: Vec<String>,
    pub templates: HashMap<String, String>,
    pub variables: HashMap<String, String>,
    next_index_id: u32,
}

impl Content {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct CompileTarget<'a> {
    pub content: &'a mut Content,
    pub base_style: &'a TextStyle,
    /// Directory relative picture paths resolve against.
    pub base_dir: Option<&'a Path>,
    /// Leading and line spacing used by `<p>` when the element sets none.
    pub paragraph_defaults: (f32, f32),
    pub(crate) debug: Option<&'a DebugLogger>,
}

impl<'a> CompileTarget<'a> {
    pub fn new(content: &'a mut Content, base_style: &'a TextStyle) -> Self {
        Self {
            content,
            base_style,
            base_dir: None,
            paragraph_defaults: (1.0, 1.0),
            debug: None,
        }
    }

    pub fn with_paragraph_defaults(mut self, leading: f32, spacing: f32) -> Self {
        self.paragraph_defaults = (leading, spacing);
        self
    }

    pub fn with_base_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.base_dir = dir;
        self
    }

    pub(crate) fn with_debug(mut self, debug: Option<&'a DebugLogger>) -> Self {
        self.debug = debug;
        self
    }
}

#[derive(Debug, Default)]
pub struct CompileReport {
    pub elements: usize,
    pub skipped: usize,
    pub resource_failures: usize,
    /// Recovered parse and resource problems, in document order.
    pub warnings: Vec<RippleError>,
}

/// Compiles `source` and appends the result to the target content.
///
/// Sources without a single root element (`Hello <b>there</b>`) are compiled as if wrapped in
/// `<ripple>`.
pub fn compile(source: &str, target: &mut CompileTarget<'_>) -> Result<CompileReport, RippleError> {
    let wrapped;
    let doc = match XmlDocument::parse_with_options(source, parsing_options()) {
        Ok(doc) => doc,
        Err(first) => {
            wrapped = format!("<ripple>{source}</ripple>");
            XmlDocument::parse_with_options(&wrapped, parsing_options())
                .map_err(|_| RippleError::from(first))?
        }
    };
    let mut compiler = Compiler::new(target);
    compiler.root(doc.root_element())?;
    Ok(compiler.report)
}

fn parsing_options() -> ParsingOptions {
    ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StyleState {
    font: FontStyle,
    colour: Color,
    underline: Option<Color>,
    background: Option<Color>,
    inverse: bool,
}

impl StyleState {
    fn from_base(base: &TextStyle) -> Self {
        Self {
            font: FontStyle {
                face: base.face.name.to_string(),
                size: base.face.size,
                flags: base.face.flags,
                align: base.align,
            },
            colour: base.colour,
            underline: base.underline,
            background: base.background,
            inverse: base.inverse,
        }
    }
}

struct Compiler<'t, 'a> {
    target: &'t mut CompileTarget<'a>,
    report: CompileReport,
    style: StyleState,
    saved: Vec<StyleState>,
    preformat: usize,
    /// Whitespace is being swallowed: the last emitted unit was a space or a block boundary.
    last_space: bool,
    depth: usize,
    lists: usize,
}

impl<'t, 'a> Compiler<'t, 'a> {
    fn new(target: &'t mut CompileTarget<'a>) -> Self {
        let style = StyleState::from_base(target.base_style);
        Self {
            target,
            report: CompileReport::default(),
            style,
            saved: Vec::new(),
            preformat: 0,
            last_space: true,
            depth: 0,
            lists: 0,
        }
    }

    fn root(&mut self, root: Node<'_, '_>) -> Result<(), RippleError> {
        match lower_name(root).as_str() {
            "ripple" | "document" | "body" | "menu" => {
                self.report.elements += 1;
                self.children(root, None)
            }
            _ => self.element(root),
        }
    }

    fn children(&mut self, node: Node<'_, '_>, mut menu: Option<&mut Item>) -> Result<(), RippleError> {
        let mut last_if: Option<bool> = None;
        for child in node.children() {
            if child.is_text() {
                let text = child.text().unwrap_or_default();
                if !text.trim().is_empty() {
                    last_if = None;
                }
                self.text(text)?;
                continue;
            }
            if !child.is_element() {
                continue;
            }
            match lower_name(child).as_str() {
                "if" => {
                    self.report.elements += 1;
                    let result = self.condition(child);
                    if result {
                        self.nested(child)?;
                    }
                    last_if = Some(result);
                }
                "else" => {
                    self.report.elements += 1;
                    match last_if.take() {
                        Some(false) => self.nested(child)?,
                        Some(true) => {}
                        None => self.skip(child, "else without a preceding if"),
                    }
                }
                "menu" if menu.is_some() => {
                    last_if = None;
                    self.report.elements += 1;
                    if let Some(item) = menu.as_deref_mut() {
                        let source = &child.document().input_text()[child.range()];
                        item.fragment = Some(self.target.content.fragments.len());
                        self.target.content.fragments.push(source.to_string());
                    }
                }
                _ => {
                    last_if = None;
                    self.element(child)?;
                }
            }
        }
        Ok(())
    }

    /// Children of a program element, which does not count as a nesting level of its own.
    fn nested(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        self.depth += 1;
        let result = if self.depth > MAX_NESTING {
            self.skip(node, "nesting is too deep");
            Ok(())
        } else {
            self.children(node, None)
        };
        self.depth -= 1;
        result
    }

    fn element(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        if self.depth >= MAX_NESTING {
            self.skip(node, "nesting is too deep");
            return Ok(());
        }
        self.report.elements += 1;
        self.depth += 1;
        let result = self.dispatch(node);
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        match lower_name(node).as_str() {
            "ripple" | "document" | "body" => self.children(node, None),
            "head" | "meta" => Ok(()),
            "font" => self.font(node),
            "b" => self.styled(node, |s| s.font.flags |= FONT_BOLD),
            "i" => self.styled(node, |s| s.font.flags |= FONT_ITALIC),
            "u" => {
                let mut attrs = self.attrs(node);
                let colour = attrs.colour("colour");
                self.done(attrs);
                self.styled(node, |s| s.underline = Some(colour.unwrap_or(s.colour)))
            }
            "inverse" => self.styled(node, |s| s.inverse = true),
            "background" => {
                let mut attrs = self.attrs(node);
                let colour = attrs.colour("colour");
                self.done(attrs);
                self.styled(node, |s| s.background = colour)
            }
            "pre" => {
                self.preformat += 1;
                let result = self.children(node, None);
                self.preformat -= 1;
                result
            }
            "savestyle" => {
                self.saved.push(self.style.clone());
                Ok(())
            }
            "restorestyle" => {
                match self.saved.pop() {
                    Some(saved) => {
                        let previous = std::mem::replace(&mut self.style, saved);
                        self.sync_style(&previous)?;
                    }
                    None => self.skip(node, "no saved style to restore"),
                }
                Ok(())
            }
            "p" => self.paragraph(node, false),
            "li" => {
                if self.lists == 0 {
                    self.warn(node, "li outside a list is compiled as a paragraph");
                }
                self.paragraph(node, self.lists > 0)
            }
            "item" => self.item(node),
            "list" => self.list(node),
            "table" => self.table(node),
            "row" => self.row(node),
            "cell" => self.cell(node),
            "index" => self.index(node),
            "a" | "link" => self.link(node),
            "br" => {
                self.target.content.stream.push_text("\n")?;
                self.last_space = true;
                Ok(())
            }
            "advance" => {
                let mut attrs = self.attrs(node);
                let x = attrs.px("x").unwrap_or(Px::ZERO);
                let y = attrs.px("y").unwrap_or(Px::ZERO);
                self.done(attrs);
                self.record(Record::Advance { x, y })?;
                Ok(())
            }
            "setmargins" => self.set_margins(node),
            "tab" => {
                let mut attrs = self.attrs(node);
                let stops = attrs.px_list("stops");
                self.done(attrs);
                self.record(Record::TabDef(stops))?;
                Ok(())
            }
            "image" => self.image(node),
            "object" => self.object(node),
            "set" => {
                self.set(node);
                Ok(())
            }
            "repeat" => self.repeat(node),
            "template" => {
                self.template(node);
                Ok(())
            }
            "use" => self.use_template(node),
            "editdef" => {
                self.edit_def(node);
                Ok(())
            }
            _ => {
                self.skip(node, "unknown element");
                Ok(())
            }
        }
    }

    // ---- text and style ----------------------------------------------------------------------

    fn text(&mut self, raw: &str) -> Result<(), RippleError> {
        let raw = substitute(raw, &self.target.content.variables);
        let text = if self.preformat > 0 {
            let text = raw.replace("\r\n", "\n");
            if let Some(last) = text.chars().last() {
                self.last_space = last.is_whitespace();
            }
            text
        } else {
            let mut out = String::with_capacity(raw.len());
            for ch in raw.chars() {
                if ch.is_whitespace() {
                    if !self.last_space {
                        out.push(' ');
                        self.last_space = true;
                    }
                } else {
                    out.push(ch);
                    self.last_space = false;
                }
            }
            out
        };
        if !text.is_empty() {
            self.target.content.stream.push_text(&text)?;
        }
        Ok(())
    }

    fn record(&mut self, record: Record) -> Result<u32, RippleError> {
        self.target.content.stream.push_record(&record)
    }

    /// Emits a block boundary record; whitespace after it is dropped.
    fn block(&mut self, record: Record) -> Result<u32, RippleError> {
        let id = self.record(record)?;
        self.last_space = true;
        Ok(id)
    }

    /// Emits records for every style field that differs from `previous`.
    fn sync_style(&mut self, previous: &StyleState) -> Result<(), RippleError> {
        let current = self.style.clone();
        if current.font != previous.font {
            self.record(Record::FontStyle(current.font.clone()))?;
        }
        if current.colour != previous.colour {
            self.record(Record::FontColour(current.colour))?;
        }
        if current.underline != previous.underline {
            self.record(Record::Underline(current.underline))?;
        }
        if current.background != previous.background {
            self.record(Record::Background(current.background))?;
        }
        if current.inverse != previous.inverse {
            self.record(Record::Inverse(current.inverse))?;
        }
        Ok(())
    }

    fn styled(
        &mut self,
        node: Node<'_, '_>,
        change: impl FnOnce(&mut StyleState),
    ) -> Result<(), RippleError> {
        self.with_style(change, |compiler| compiler.children(node, None))
    }

    fn with_style(
        &mut self,
        change: impl FnOnce(&mut StyleState),
        body: impl FnOnce(&mut Self) -> Result<(), RippleError>,
    ) -> Result<(), RippleError> {
        let previous = self.style.clone();
        change(&mut self.style);
        self.sync_style(&previous)?;
        body(self)?;
        let changed = std::mem::replace(&mut self.style, previous);
        self.sync_style(&changed)
    }

    fn font(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let face = attrs.text("face");
        let size = attrs.px("size").filter(|s| s.is_positive());
        let colour = attrs.colour("colour");
        let bold = attrs.bool("bold");
        let italic = attrs.bool("italic");
        let align = attrs.align("align");
        self.done(attrs);
        self.styled(node, |s| {
            if let Some(face) = face {
                s.font.face = face;
            }
            if let Some(size) = size {
                s.font.size = size;
            }
            if let Some(colour) = colour {
                s.colour = colour;
            }
            set_flag(&mut s.font.flags, FONT_BOLD, bold);
            set_flag(&mut s.font.flags, FONT_ITALIC, italic);
            if let Some(align) = align {
                s.font.align = align;
            }
        })
    }

    // ---- blocks ------------------------------------------------------------------------------

    fn paragraph(&mut self, node: Node<'_, '_>, list_item: bool) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let (leading, spacing) = self.target.paragraph_defaults;
        let para = ParagraphStart {
            leading: attrs
                .float("leading")
                .map_or(leading, |v| v.clamp(0.0, MAX_LEADING)),
            spacing: attrs
                .float("vspacing")
                .map_or(spacing, |v| v.clamp(0.0, MAX_VSPACING)),
            indent: attrs.px("indent").unwrap_or(Px::ZERO),
            trim: attrs.bool("trim").unwrap_or(false),
            list_item,
            value: if list_item {
                attrs.text("value").unwrap_or_default()
            } else {
                String::new()
            },
        };
        let align = attrs.align("align");
        self.done(attrs);
        self.block(Record::ParagraphStart(para))?;
        self.aligned(align, |compiler| compiler.children(node, None))?;
        self.block(Record::ParagraphEnd)?;
        Ok(())
    }

    fn aligned(
        &mut self,
        align: Option<HAlign>,
        body: impl FnOnce(&mut Self) -> Result<(), RippleError>,
    ) -> Result<(), RippleError> {
        match align {
            Some(align) => self.with_style(|s| s.font.align = align, body),
            None => body(self),
        }
    }

    fn item(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let key_name = attrs.text("key");
        let qualifier = attrs.text("qualifier");
        let mut item = Item {
            id: attrs.text("id").unwrap_or_default(),
            icon: attrs.text("icon"),
            text: attrs.text("text").unwrap_or_default(),
            sort: attrs.text("sort"),
            categorise: attrs.text("categorise"),
            name: attrs.text("name"),
            path: attrs.text("path").or_else(|| attrs.text("src")),
            colour: attrs.colour("colour"),
            background: attrs.colour("background"),
            group: attrs.text("group"),
            toggle: attrs.bool("toggle").unwrap_or(false),
            disabled: attrs.bool("disabled").unwrap_or(false),
            selected: attrs.bool("selected").unwrap_or(false),
            no_key_response: attrs.bool("no-key-response").unwrap_or(false),
            key_repeat: attrs.bool("key-repeat").unwrap_or(false),
            ..Item::default()
        };
        if let Some(key) = key_name.as_deref() {
            item.key = keymap::resolve_binding(key, qualifier.as_deref());
            if item.key.is_none() {
                attrs.invalid("key", key);
            }
        }
        self.done(attrs);

        item.stream_index = self.target.content.stream.len();
        item.element_id = self.block(Record::ParagraphStart(ParagraphStart::default()))?;
        let colour = item.colour;
        let background = item.background;
        let icon = item.icon.clone();
        let label = item.text.clone();
        self.with_style(
            |s| {
                if let Some(colour) = colour {
                    s.colour = colour;
                }
                if background.is_some() {
                    s.background = background;
                }
            },
            |compiler| {
                if let Some(icon) = icon.as_deref() {
                    compiler.picture(icon, None, None, None, None)?;
                }
                if !label.is_empty() {
                    compiler.text(&label)?;
                }
                compiler.children(node, Some(&mut item))
            },
        )?;
        self.block(Record::ParagraphEnd)?;
        self.target.content.items.push(item);
        Ok(())
    }

    fn list(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let kind = match attrs.text("type").map(|t| t.to_ascii_lowercase()) {
            None => ListKind::Bullet,
            Some(t) if t == "bullet" => ListKind::Bullet,
            Some(t) if t == "ordered" => ListKind::Ordered,
            Some(t) if t == "custom" => ListKind::Custom,
            Some(t) => {
                attrs.invalid("type", &t);
                ListKind::Bullet
            }
        };
        let bullet = Px::from_i32(BULLET_INDENT);
        let list = ListStart {
            kind,
            start: attrs.int("start").map_or(1, |v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
            item_indent: match kind {
                ListKind::Bullet => bullet,
                ListKind::Ordered | ListKind::Custom => Px::ZERO,
            },
            block_indent: attrs.px("indent").unwrap_or(bullet),
            vspacing: attrs.float("vspacing").map_or(0.5, |v| v.clamp(0.0, MAX_VSPACING)),
            colour: Some(attrs.colour("colour").unwrap_or(self.style.colour)),
        };
        self.done(attrs);
        self.block(Record::ListStart(list))?;
        self.lists += 1;
        let result = self.children(node, None);
        self.lists -= 1;
        result?;
        self.block(Record::ListEnd)?;
        Ok(())
    }

    fn table(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let defaults = TableStart::default();
        let spacing = attrs.px("spacing");
        let border = attrs.colour("border");
        let table = TableStart {
            columns: attrs.length_list("columns"),
            width: attrs.length("width").unwrap_or(Length::Auto),
            min_height: attrs.px("height").unwrap_or(Px::ZERO),
            padding: attrs.px("padding").unwrap_or(defaults.padding),
            hspacing: attrs.px("hspacing").or(spacing).unwrap_or(defaults.hspacing),
            vspacing: attrs.px("vspacing").or(spacing).unwrap_or(defaults.vspacing),
            thickness: attrs
                .px("thickness")
                .unwrap_or(if border.is_some() { Px::from_i32(1) } else { Px::ZERO }),
            align: attrs.align("align").unwrap_or(HAlign::Left),
            colour: attrs.colour("colour"),
            border,
            highlight: attrs.colour("highlight"),
            shadow: attrs.colour("shadow"),
        };
        self.done(attrs);
        self.block(Record::TableStart(table))?;
        self.children(node, None)?;
        self.block(Record::TableEnd)?;
        Ok(())
    }

    fn row(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let row = Row {
            min_height: attrs.px("height").unwrap_or(Px::ZERO),
            colour: attrs.colour("colour"),
            highlight: attrs.colour("highlight"),
            shadow: attrs.colour("shadow"),
        };
        self.done(attrs);
        self.block(Record::Row(row))?;
        self.children(node, None)?;
        self.block(Record::RowEnd)?;
        Ok(())
    }

    fn cell(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let cell = Cell {
            col_span: attrs
                .int("colspan")
                .map_or(1, |v| v.clamp(1, u16::MAX as i64) as u16),
            valign: attrs.valign("valign").unwrap_or(VAlign::Top),
            colour: attrs.colour("colour"),
            border: attrs.colour("border"),
            edit: attrs.text("edit").unwrap_or_default(),
        };
        if !cell.edit.is_empty()
            && !self
                .target
                .content
                .edits
                .contains_key(&records::name_hash(&cell.edit))
        {
            log::debug!("cell refers to edit definition '{}' before it is defined", cell.edit);
        }
        self.done(attrs);
        self.block(Record::Cell(cell))?;
        self.children(node, None)?;
        self.block(Record::CellEnd)?;
        Ok(())
    }

    fn index(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let Some(name) = attrs.text("name") else {
            self.done(attrs);
            self.skip(node, "index needs a name");
            return Ok(());
        };
        let hidden = attrs.bool("hide").unwrap_or(false);
        self.done(attrs);
        let content = &mut *self.target.content;
        content.next_index_id = content.next_index_id.wrapping_add(1);
        let id = content.next_index_id;
        self.record(Record::IndexStart(IndexStart {
            name_hash: records::name_hash(&name),
            id,
            visible: !hidden,
        }))?;
        self.children(node, None)?;
        self.record(Record::IndexEnd { id })?;
        Ok(())
    }

    fn link(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let href = attrs.text("href");
        let function = attrs.text("function").or_else(|| attrs.text("onclick"));
        let hint = attrs
            .text("hint")
            .or_else(|| attrs.text("title"))
            .unwrap_or_default();
        self.done(attrs);
        let link = match (href, function) {
            (Some(target), _) => Link {
                kind: LinkKind::Href,
                target,
                hint,
            },
            (None, Some(target)) => Link {
                kind: LinkKind::Function,
                target,
                hint,
            },
            (None, None) => {
                self.warn(node, "link has neither href nor function; content kept as text");
                return self.children(node, None);
            }
        };
        self.record(Record::Link(link))?;
        self.children(node, None)?;
        self.record(Record::LinkEnd)?;
        Ok(())
    }

    fn set_margins(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let all = attrs.px("all").unwrap_or(Px::ZERO);
        let margins = SetMargins {
            left: attrs.px("left").unwrap_or(all),
            top: attrs.px("top").unwrap_or(all),
            right: attrs.px("right").unwrap_or(all),
            bottom: attrs.px("bottom").unwrap_or(all),
        };
        self.done(attrs);
        self.record(Record::SetMargins(margins))?;
        Ok(())
    }

    // ---- objects -----------------------------------------------------------------------------

    fn image(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let Some(src) = attrs.text("src").or_else(|| attrs.text("path")) else {
            self.done(attrs);
            self.skip(node, "image needs a src");
            return Ok(());
        };
        let width = attrs.px("width");
        let height = attrs.px("height");
        let options = attrs.options("layout");
        let position = attrs.position();
        self.done(attrs);
        self.picture(&src, width, height, options, position)
    }

    fn picture(
        &mut self,
        src: &str,
        width: Option<Px>,
        height: Option<Px>,
        options: Option<LayoutOptions>,
        position: Option<(Px, Px)>,
    ) -> Result<(), RippleError> {
        let object: Arc<dyn Embedded> = match Picture::load(src, self.target.base_dir) {
            Ok(picture) => Arc::new(picture.with_size(width, height)),
            Err(err) => {
                self.resource_failure(src, err);
                Arc::new(Placeholder::new(src))
            }
        };
        self.embed(object, options, position)
    }

    fn object(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let Some(name) = attrs.text("name") else {
            self.done(attrs);
            self.skip(node, "object needs a name");
            return Ok(());
        };
        let options = attrs.options("layout");
        let position = attrs.position();
        self.done(attrs);
        let object = match self.target.content.objects.named(&name) {
            Some(object) => object,
            None => {
                let err = RippleError::Resource(format!("no object registered as '{name}'"));
                self.resource_failure(&name, err);
                Arc::new(Placeholder::new(name.as_str()))
            }
        };
        self.embed(object, options, position)
    }

    fn embed(
        &mut self,
        object: Arc<dyn Embedded>,
        options: Option<LayoutOptions>,
        position: Option<(Px, Px)>,
    ) -> Result<(), RippleError> {
        let id = self.target.content.objects.insert(ObjectEntry {
            object,
            options,
            position,
        })?;
        self.record(Record::Object(id))?;
        self.last_space = false;
        Ok(())
    }

    // ---- program elements --------------------------------------------------------------------

    fn condition(&mut self, node: Node<'_, '_>) -> bool {
        let mut attrs = self.attrs(node);
        let result = if let Some(name) = attrs.text("exists") {
            self.target.content.variables.contains_key(name.trim())
        } else if let Some(name) = attrs.text("notexists") {
            !self.target.content.variables.contains_key(name.trim())
        } else if let Some(statement) = attrs.text("statement") {
            match evaluate(&statement, &self.target.content.variables) {
                Some(result) => result,
                None => {
                    attrs.invalid("statement", &statement);
                    false
                }
            }
        } else {
            attrs.note("if needs exists, notexists or statement".to_string());
            false
        };
        self.done(attrs);
        result
    }

    fn set(&mut self, node: Node<'_, '_>) {
        let mut attrs = self.attrs(node);
        if let Some(name) = attrs.text("name") {
            let value = attrs.text("value").unwrap_or_default();
            self.target.content.variables.insert(name.trim().to_string(), value);
        } else {
            for (name, value) in attrs.rest() {
                self.target.content.variables.insert(name, value);
            }
        }
        self.done(attrs);
    }

    fn repeat(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let var = attrs.text("index").unwrap_or_else(|| "index".to_string());
        let start = attrs.int("start").unwrap_or(0);
        let step = attrs.int("step").unwrap_or(1);
        let count = attrs.int("count");
        let end = attrs.int("end");
        self.done(attrs);
        if step == 0 {
            self.skip(node, "repeat step is zero");
            return Ok(());
        }
        let mut iterations = match (count, end) {
            (Some(count), _) => count.max(0),
            (None, Some(end)) => {
                let span = end.saturating_sub(start);
                if span != 0 && span.signum() != step.signum() {
                    0
                } else {
                    span.checked_div(step)
                        .and_then(|n| n.checked_add(1))
                        .unwrap_or(MAX_REPEAT.saturating_add(1))
                }
            }
            (None, None) => {
                self.skip(node, "repeat needs count or end");
                return Ok(());
            }
        };
        if iterations > MAX_REPEAT {
            self.warn(node, &format!("repeat limited to {MAX_REPEAT} iterations"));
            iterations = MAX_REPEAT;
        }
        let saved = self.target.content.variables.get(&var).cloned();
        let mut result = Ok(());
        for i in 0..iterations {
            let value = start.saturating_add(i.saturating_mul(step));
            self.target
                .content
                .variables
                .insert(var.clone(), value.to_string());
            result = self.nested(node);
            if result.is_err() {
                break;
            }
        }
        restore_variable(&mut self.target.content.variables, var, saved);
        result
    }

    fn template(&mut self, node: Node<'_, '_>) {
        let mut attrs = self.attrs(node);
        let name = attrs.text("name");
        self.done(attrs);
        let Some(name) = name else {
            self.skip(node, "template needs a name");
            return;
        };
        let source = &node.document().input_text()[node.range()];
        self.target
            .content
            .templates
            .insert(name.trim().to_ascii_lowercase(), source.to_string());
    }

    /// Expands a template. Attributes other than `template`/`name` become variables for the
    /// duration of the expansion.
    fn use_template(&mut self, node: Node<'_, '_>) -> Result<(), RippleError> {
        let mut attrs = self.attrs(node);
        let name = attrs.text("template").or_else(|| attrs.text("name"));
        let params = attrs.rest();
        self.done(attrs);
        let Some(name) = name else {
            self.skip(node, "use needs a template name");
            return Ok(());
        };
        let Some(source) = self
            .target
            .content
            .templates
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
        else {
            self.skip(node, &format!("template '{name}' is not defined"));
            return Ok(());
        };
        let doc = XmlDocument::parse_with_options(&source, parsing_options())?;
        let mut saved = Vec::with_capacity(params.len());
        for (key, value) in params {
            let previous = self.target.content.variables.insert(key.clone(), value);
            saved.push((key, previous));
        }
        let result = self.nested(doc.root_element());
        for (key, previous) in saved.into_iter().rev() {
            restore_variable(&mut self.target.content.variables, key, previous);
        }
        result
    }

    fn edit_def(&mut self, node: Node<'_, '_>) {
        let mut attrs = self.attrs(node);
        let Some(name) = attrs.text("name") else {
            self.done(attrs);
            self.skip(node, "editdef needs a name");
            return;
        };
        let def = EditDef {
            max_chars: attrs.int("maxchars").map(|v| v.max(0) as usize),
            line_breaks: attrs.bool("linebreaks").unwrap_or(false),
            on_enter: attrs.text("onenter"),
            on_exit: attrs.text("onexit"),
            on_change: attrs.text("onchange"),
            name: name.trim().to_string(),
        };
        self.done(attrs);
        self.target
            .content
            .edits
            .insert(records::name_hash(&def.name), def);
    }

    // ---- diagnostics -------------------------------------------------------------------------

    fn attrs(&self, node: Node<'_, '_>) -> Attrs {
        Attrs::new(node, &self.target.content.variables)
    }

    fn done(&mut self, attrs: Attrs) {
        let tag = attrs.tag.clone();
        for message in attrs.finish() {
            let message = format!("<{tag}> {message}");
            log::warn!("markup: {}", message);
            if let Some(debug) = self.target.debug {
                debug.event("compile.attribute", json!({ "tag": tag, "message": message }));
            }
            self.report.warnings.push(RippleError::Parse(message));
        }
    }

    fn warn(&mut self, node: Node<'_, '_>, message: &str) {
        let message = format!("<{}> {}", lower_name(node), message);
        log::warn!("markup: {}", message);
        self.report.warnings.push(RippleError::Parse(message));
    }

    fn skip(&mut self, node: Node<'_, '_>, reason: &str) {
        let tag = lower_name(node);
        log::warn!("markup: <{}> skipped: {}", tag, reason);
        if let Some(debug) = self.target.debug {
            debug.event(
                "compile.skip",
                json!({ "tag": tag, "reason": reason, "offset": node.range().start }),
            );
        }
        self.report.skipped += 1;
        self.report
            .warnings
            .push(RippleError::Parse(format!("<{tag}> skipped: {reason}")));
    }

    fn resource_failure(&mut self, what: &str, err: RippleError) {
        let what = if what.starts_with("data:") { "data URI" } else { what };
        log::warn!("markup: using a placeholder for '{}': {}", what, err);
        if let Some(debug) = self.target.debug {
            debug.event(
                "compile.resource",
                json!({ "source": what, "error": err.to_string() }),
            );
        }
        self.report.resource_failures += 1;
        self.report.warnings.push(match err {
            RippleError::Resource(message) => RippleError::Resource(message),
            other => RippleError::Resource(format!("{what}: {other}")),
        });
    }
}

fn lower_name(node: Node<'_, '_>) -> String {
    node.tag_name().name().to_ascii_lowercase()
}

fn set_flag(flags: &mut u8, flag: u8, value: Option<bool>) {
    match value {
        Some(true) => *flags |= flag,
        Some(false) => *flags &= !flag,
        None => {}
    }
}

fn restore_variable(variables: &mut HashMap<String, String>, key: String, previous: Option<String>) {
    match previous {
        Some(value) => {
            variables.insert(key, value);
        }
        None => {
            variables.remove(&key);
        }
    }
}

/// Replaces every `[@name]` with the variable's value. Unknown names expand to nothing.
pub fn substitute<'s>(raw: &'s str, variables: &HashMap<String, String>) -> Cow<'s, str> {
    if !raw.contains("[@") {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("[@") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find(']') else {
            out.push_str(&rest[open..]);
            return Cow::Owned(out);
        };
        let name = after[..close].trim();
        match variables.get(name) {
            Some(value) => out.push_str(value),
            None => log::debug!("markup: variable '{}' is not set", name),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

const OPERATORS: [(&str, Op); 7] = [
    ("==", Op::Eq),
    ("!=", Op::Ne),
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("<", Op::Lt),
    (">", Op::Gt),
    ("=", Op::Eq),
];

/// Evaluates `lhs op rhs`. Operands name variables or are literals (optionally quoted); the
/// comparison is numeric when both sides parse as numbers. A statement with no operator is true
/// when its value is non-empty and not `0` or `false`. `None` means the statement is malformed.
pub fn evaluate(statement: &str, variables: &HashMap<String, String>) -> Option<bool> {
    let found = statement.char_indices().find_map(|(at, _)| {
        OPERATORS
            .iter()
            .find(|(token, _)| statement[at..].starts_with(*token))
            .map(|(token, op)| (at, token.len(), *op))
    });
    let Some((at, len, op)) = found else {
        let value = operand(statement, variables);
        return Some(!(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false")));
    };
    let lhs = operand(&statement[..at], variables);
    let rhs = operand(&statement[at + len..], variables);
    if lhs.is_empty() && rhs.is_empty() {
        return None;
    }
    let ordering = match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b)?,
        _ => lhs.cmp(&rhs),
    };
    Some(match op {
        Op::Eq => ordering.is_eq(),
        Op::Ne => ordering.is_ne(),
        Op::Le => ordering.is_le(),
        Op::Ge => ordering.is_ge(),
        Op::Lt => ordering.is_lt(),
        Op::Gt => ordering.is_gt(),
    })
}

fn operand(raw: &str, variables: &HashMap<String, String>) -> String {
    let value = raw.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    variables
        .get(value)
        .cloned()
        .unwrap_or_else(|| value.to_string())
}

/// Attribute reader for one element. Tracks which attributes were consumed so that the rest can
/// be reported as unknown.
struct Attrs {
    tag: String,
    list: Vec<(String, String, bool)>,
    notes: Vec<String>,
}

impl Attrs {
    fn new(node: Node<'_, '_>, variables: &HashMap<String, String>) -> Self {
        let list = node
            .attributes()
            .map(|attr| {
                (
                    attr.name().to_ascii_lowercase(),
                    substitute(attr.value(), variables).into_owned(),
                    false,
                )
            })
            .collect();
        Self {
            tag: lower_name(node),
            list,
            notes: Vec::new(),
        }
    }

    fn raw(&mut self, name: &str) -> Option<String> {
        let entry = self.list.iter_mut().find(|(key, _, _)| key == name)?;
        entry.2 = true;
        Some(entry.1.clone())
    }

    fn text(&mut self, name: &str) -> Option<String> {
        self.raw(name)
    }

    fn invalid(&mut self, name: &str, value: &str) {
        self.notes.push(format!("has an invalid {name}=\"{value}\""));
    }

    fn note(&mut self, message: String) {
        self.notes.push(message);
    }

    fn parsed<T>(&mut self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let value = self.raw(name)?;
        let parsed = parse(&value);
        if parsed.is_none() {
            self.invalid(name, &value);
        }
        parsed
    }

    /// `yes`/`true`/`1`/empty are true, `no`/`false`/`0` false.
    fn bool(&mut self, name: &str) -> Option<bool> {
        self.parsed(name, |v| match v.trim().to_ascii_lowercase().as_str() {
            "" | "1" | "yes" | "true" | "on" => Some(true),
            "0" | "no" | "false" | "off" => Some(false),
            _ => None,
        })
    }

    /// Reads `colour`, falling back to the `color` spelling for the same attribute.
    fn colour(&mut self, name: &str) -> Option<Color> {
        if let Some(colour) = self.parsed(name, Color::parse) {
            return Some(colour);
        }
        let alt = name.replace("colour", "color");
        if alt != name {
            return self.parsed(&alt, Color::parse);
        }
        None
    }

    fn float(&mut self, name: &str) -> Option<f32> {
        self.parsed(name, |v| v.trim().parse::<f32>().ok().filter(|f| f.is_finite()))
    }

    fn int(&mut self, name: &str) -> Option<i64> {
        self.parsed(name, |v| v.trim().parse::<i64>().ok())
    }

    fn px(&mut self, name: &str) -> Option<Px> {
        self.parsed(name, parse_px)
    }

    fn px_list(&mut self, name: &str) -> Vec<Px> {
        self.parsed(name, |v| {
            v.split([',', ' '])
                .filter(|p| !p.is_empty())
                .map(parse_px)
                .collect::<Option<Vec<Px>>>()
        })
        .unwrap_or_default()
    }

    fn length(&mut self, name: &str) -> Option<Length> {
        self.parsed(name, Length::parse)
    }

    /// Column lists such as `40,25%,*`; `*` and `auto` mean no explicit width.
    fn length_list(&mut self, name: &str) -> Vec<Length> {
        self.parsed(name, |v| {
            v.split(',')
                .map(|p| match p.trim() {
                    "*" => Some(Length::Auto),
                    other => Length::parse(other),
                })
                .collect::<Option<Vec<Length>>>()
        })
        .unwrap_or_default()
    }

    fn align(&mut self, name: &str) -> Option<HAlign> {
        self.parsed(name, HAlign::parse)
    }

    fn valign(&mut self, name: &str) -> Option<VAlign> {
        self.parsed(name, VAlign::parse)
    }

    fn options(&mut self, name: &str) -> Option<LayoutOptions> {
        let value = self.raw(name)?;
        let (options, unknown) = LayoutOptions::parse(&value);
        for option in unknown {
            self.notes.push(format!("has an unknown layout option '{option}'"));
        }
        Some(options)
    }

    /// `x`/`y` pair for fixed placement; a missing side is zero.
    fn position(&mut self) -> Option<(Px, Px)> {
        let x = self.px("x");
        let y = self.px("y");
        (x.is_some() || y.is_some()).then(|| (x.unwrap_or(Px::ZERO), y.unwrap_or(Px::ZERO)))
    }

    /// Every attribute not consumed so far, marking them consumed.
    fn rest(&mut self) -> Vec<(String, String)> {
        self.list
            .iter_mut()
            .filter(|(_, _, used)| !*used)
            .map(|(key, value, used)| {
                *used = true;
                (key.clone(), value.clone())
            })
            .collect()
    }

    fn finish(self) -> Vec<String> {
        let mut messages = self.notes;
        for (key, _, used) in self.list {
            if !used {
                messages.push(format!("has an unknown attribute '{key}'"));
            }
        }
        messages
    }
}

fn parse_px(raw: &str) -> Option<Px> {
    let value = raw.trim();
    let value = value.strip_suffix("px").unwrap_or(value);
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Px::from_f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::FontFace;
    use crate::records::RecordKind;
    use crate::stream::Unit;

    fn base() -> TextStyle {
        TextStyle::new(
            FontFace::new("Sans", Px::from_i32(14), 0),
            Color::BLACK,
            Color::rgb(0.0, 0.0, 1.0),
        )
    }

    fn build(source: &str) -> (Content, CompileReport) {
        let mut content = Content::new();
        let report = compile_into(&mut content, source);
        (content, report)
    }

    fn compile_into(content: &mut Content, source: &str) -> CompileReport {
        let style = base();
        let mut target = CompileTarget::new(content, &style);
        compile(source, &mut target).unwrap()
    }

    fn outline(stream: &Stream) -> Vec<String> {
        stream
            .units(0, stream.len())
            .map(|unit| match unit.unwrap() {
                Unit::Text { text, .. } => format!("'{text}'"),
                Unit::Record(view) => view.kind.name().to_string(),
            })
            .collect()
    }

    fn plain(stream: &Stream) -> String {
        stream
            .units(0, stream.len())
            .filter_map(|unit| match unit.unwrap() {
                Unit::Text { text, .. } => Some(text.to_string()),
                Unit::Record(_) => None,
            })
            .collect()
    }

    fn records_of(stream: &Stream, kind: RecordKind) -> Vec<Record> {
        stream
            .units(0, stream.len())
            .filter_map(|unit| match unit.unwrap() {
                Unit::Record(view) if view.kind == kind => Some(view.record().unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn whitespace_collapses_outside_pre() {
        let (content, report) = build("<ripple><p>\n  Hello   \n world</p><pre>a\n  b</pre></ripple>");
        assert_eq!(
            outline(&content.stream),
            ["paragraph-start", "'Hello world'", "paragraph-end", "'a\n  b'"]
        );
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn style_elements_restore_the_previous_style() {
        let (content, _) = build("<p>a<b>b</b>c</p>");
        assert_eq!(
            outline(&content.stream),
            [
                "paragraph-start",
                "'a'",
                "font-style",
                "'b'",
                "font-style",
                "'c'",
                "paragraph-end"
            ]
        );
        let fonts = records_of(&content.stream, RecordKind::FontStyle);
        let flags: Vec<u8> = fonts
            .iter()
            .map(|r| match r {
                Record::FontStyle(f) => f.flags,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(flags, [FONT_BOLD, 0]);
    }

    #[test]
    fn font_colour_and_underline_emit_their_own_records() {
        let (content, _) = build("<font colour='#ff0000'><u>x</u></font>");
        assert_eq!(
            outline(&content.stream),
            ["font-colour", "underline", "'x'", "underline", "font-colour"]
        );
        let underlines = records_of(&content.stream, RecordKind::Underline);
        assert_eq!(underlines[0], Record::Underline(Some(Color::rgb(1.0, 0.0, 0.0))));
        assert_eq!(underlines[1], Record::Underline(None));
    }

    #[test]
    fn conditionals_pick_one_branch() {
        let mut content = Content::new();
        content.variables.insert("count".into(), "3".into());
        let source = "<ripple><if statement='[@count] &gt; 2'>big</if><else>small</else>\
                      <if exists='missing'>x</if></ripple>";
        compile_into(&mut content, source);
        assert_eq!(plain(&content.stream), "big");

        let mut content = Content::new();
        content.variables.insert("count".into(), "1".into());
        compile_into(&mut content, source);
        assert_eq!(plain(&content.stream), "small");
    }

    #[test]
    fn set_and_repeat_drive_substitution() {
        let (content, _) = build(
            "<ripple><set name='sep' value=','/>\
             <repeat start='1' end='3' index='n'>[@n][@sep]</repeat></ripple>",
        );
        assert_eq!(plain(&content.stream), "1,2,3,");
        assert!(!content.variables.contains_key("n"));
        assert_eq!(content.variables.get("sep").map(String::as_str), Some(","));
    }

    #[test]
    fn repeat_bounds_at_integer_extremes_are_clamped() {
        for source in [
            "<ripple><repeat end='-9223372036854775808' step='-1'>x</repeat></ripple>",
            "<ripple><repeat end='9223372036854775807'>x</repeat></ripple>",
        ] {
            let (content, report) = build(source);
            assert_eq!(plain(&content.stream).len(), MAX_REPEAT as usize);
            assert!(
                report
                    .warnings
                    .iter()
                    .any(|w| w.to_string().contains("repeat limited"))
            );
        }
    }

    #[test]
    fn templates_expand_with_parameters() {
        let (content, report) = build(
            "<ripple><template name='greet'><b>Hi [@who]</b></template>\
             <use template='greet' who='Ann'/> <use template='nope'/></ripple>",
        );
        assert_eq!(plain(&content.stream), "Hi Ann ");
        assert!(!content.variables.contains_key("who"));
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn unknown_elements_are_skipped_without_losing_siblings() {
        let (content, report) = build("<p>a<blink>x</blink>b</p>");
        assert_eq!(plain(&content.stream), "ab");
        assert_eq!(report.skipped, 1);
        assert!(matches!(report.warnings[0], RippleError::Parse(_)));
    }

    #[test]
    fn unknown_attributes_are_reported() {
        let (_, report) = build("<p sparkle='yes'>a</p>");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].to_string().contains("sparkle"));
    }

    #[test]
    fn tables_nest_rows_and_cells() {
        let (content, _) = build(
            "<table columns='40,*'>\n <row>\n  <cell>A</cell>\n  \
             <cell colspan='2' valign='bottom'>B</cell>\n </row>\n</table>",
        );
        assert_eq!(
            outline(&content.stream),
            [
                "table-start",
                "row",
                "cell",
                "'A'",
                "cell-end",
                "cell",
                "'B'",
                "cell-end",
                "row-end",
                "table-end"
            ]
        );
        match &records_of(&content.stream, RecordKind::TableStart)[0] {
            Record::TableStart(table) => {
                assert_eq!(table.columns, [Length::Px(Px::from_i32(40)), Length::Auto]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &records_of(&content.stream, RecordKind::Cell)[1] {
            Record::Cell(cell) => {
                assert_eq!(cell.col_span, 2);
                assert_eq!(cell.valign, VAlign::Bottom);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(content.stream.scan_structure(0, content.stream.len()).is_balanced());
    }

    #[test]
    fn lists_mark_their_items() {
        let (content, _) = build("<list type='ordered' start='3'><li>a</li><li value='9'>b</li></list>");
        match &records_of(&content.stream, RecordKind::ListStart)[0] {
            Record::ListStart(list) => {
                assert_eq!(list.kind, ListKind::Ordered);
                assert_eq!(list.start, 3);
                assert_eq!(list.vspacing, 0.5);
            }
            other => panic!("unexpected {other:?}"),
        }
        let paras = records_of(&content.stream, RecordKind::ParagraphStart);
        match (&paras[0], &paras[1]) {
            (Record::ParagraphStart(a), Record::ParagraphStart(b)) => {
                assert!(a.list_item && b.list_item);
                assert_eq!(b.value, "9");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_pictures_become_placeholders() {
        let (content, report) = build("<p>x<image src='no/such/file.png' layout='square'/></p>");
        assert_eq!(content.objects.len(), 1);
        let entry = content.objects.get(0).unwrap();
        assert_eq!(entry.object.name(), "no/such/file.png");
        assert_eq!(entry.options(), LayoutOptions::SQUARE);
        assert_eq!(report.resource_failures, 1);
        assert!(matches!(report.warnings[0], RippleError::Resource(_)));
        assert_eq!(records_of(&content.stream, RecordKind::Object), [Record::Object(0)]);
    }

    #[test]
    fn items_record_keys_and_defer_menus() {
        let (content, _) = build(
            "<item id='open' text='Open' key='o' qualifier='ctrl' toggle='yes'>\
             <menu><item text='Recent'/></menu></item>",
        );
        assert_eq!(content.items.len(), 1);
        let item = &content.items[0];
        assert_eq!(item.id, "open");
        assert!(item.toggle);
        assert_eq!(item.key, keymap::resolve_binding("o", Some("ctrl")));
        assert_eq!(item.fragment, Some(0));
        assert!(content.fragments[0].starts_with("<menu>"));
        assert_eq!(plain(&content.stream), "Open");
        assert_eq!(
            content.stream.element_id(item.stream_index),
            Some(item.element_id)
        );
    }

    #[test]
    fn editdefs_and_hidden_indices() {
        let (content, _) = build(
            "<ripple><editdef name='Name' maxchars='10' onchange='check'/>\
             <index name='more' hide='yes'>x</index></ripple>",
        );
        let def = content.edits.get(&records::name_hash("name")).unwrap();
        assert_eq!(def.max_chars, Some(10));
        assert_eq!(def.on_change.as_deref(), Some("check"));
        match &records_of(&content.stream, RecordKind::IndexStart)[0] {
            Record::IndexStart(start) => {
                assert!(!start.visible);
                assert_eq!(start.name_hash, records::name_hash("more"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn links_wrap_their_content() {
        let (content, report) = build("<p><a href='#top'>up</a> <link>plain</link></p>");
        assert_eq!(
            outline(&content.stream),
            ["paragraph-start", "link", "'up'", "link-end", "' plain'", "paragraph-end"]
        );
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn fragments_without_a_root_are_wrapped() {
        let (content, _) = build("Hello <b>there</b>");
        assert_eq!(plain(&content.stream), "Hello there");
    }

    #[test]
    fn malformed_markup_is_a_parse_error() {
        let mut content = Content::new();
        let style = base();
        let mut target = CompileTarget::new(&mut content, &style);
        let err = compile("<p>unclosed", &mut target).unwrap_err();
        assert!(matches!(err, RippleError::Parse(_)));
        assert!(content.stream.is_empty());
    }

    #[test]
    fn statements_compare_numbers_and_strings() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "bob".to_string());
        assert_eq!(evaluate("10 > 9", &vars), Some(true));
        assert_eq!(evaluate("'abc' < 'abd'", &vars), Some(true));
        assert_eq!(evaluate("name == bob", &vars), Some(true));
        assert_eq!(evaluate("name != 'bob'", &vars), Some(false));
        assert_eq!(evaluate("2 <= 2", &vars), Some(true));
        assert_eq!(evaluate("0", &vars), Some(false));
        assert_eq!(evaluate("name", &vars), Some(true));
        assert_eq!(evaluate(" == ", &vars), None);
    }

    #[test]
    fn substitution_leaves_unclosed_markers() {
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), "1".to_string());
        assert_eq!(substitute("x[@a]y[@b]z", &vars), "x1yz");
        assert_eq!(substitute("[@a", &vars), "[@a");
    }
}
