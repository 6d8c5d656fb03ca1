//! Typed payloads for stream control records.
//!
//! Every record kind has a fixed one-byte code and a payload encoded big-endian. Payloads are
//! self-contained so a record can be decoded from its byte slice alone.

use crate::types::{Color, HAlign, Length, Px, VAlign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    FontStyle = 1,
    FontColour = 2,
    Underline = 3,
    Background = 4,
    Inverse = 5,
    Object = 6,
    Link = 7,
    LinkEnd = 8,
    TabDef = 9,
    ParagraphStart = 10,
    ParagraphEnd = 11,
    Advance = 12,
    ListStart = 13,
    ListEnd = 14,
    TableStart = 15,
    TableEnd = 16,
    Row = 17,
    RowEnd = 18,
    Cell = 19,
    CellEnd = 20,
    SetMargins = 21,
    IndexStart = 22,
    IndexEnd = 23,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<RecordKind> {
        use RecordKind::*;
        Some(match value {
            1 => FontStyle,
            2 => FontColour,
            3 => Underline,
            4 => Background,
            5 => Inverse,
            6 => Object,
            7 => Link,
            8 => LinkEnd,
            9 => TabDef,
            10 => ParagraphStart,
            11 => ParagraphEnd,
            12 => Advance,
            13 => ListStart,
            14 => ListEnd,
            15 => TableStart,
            16 => TableEnd,
            17 => Row,
            18 => RowEnd,
            19 => Cell,
            20 => CellEnd,
            21 => SetMargins,
            22 => IndexStart,
            23 => IndexEnd,
            _ => return None,
        })
    }

    /// The end kind that closes this start kind.
    pub fn closing(self) -> Option<RecordKind> {
        use RecordKind::*;
        match self {
            Link => Some(LinkEnd),
            ParagraphStart => Some(ParagraphEnd),
            ListStart => Some(ListEnd),
            TableStart => Some(TableEnd),
            Row => Some(RowEnd),
            Cell => Some(CellEnd),
            IndexStart => Some(IndexEnd),
            _ => None,
        }
    }

    pub fn opening(self) -> Option<RecordKind> {
        use RecordKind::*;
        match self {
            LinkEnd => Some(Link),
            ParagraphEnd => Some(ParagraphStart),
            ListEnd => Some(ListStart),
            TableEnd => Some(TableStart),
            RowEnd => Some(Row),
            CellEnd => Some(Cell),
            IndexEnd => Some(IndexStart),
            _ => None,
        }
    }

    /// Records that only change the text style carried into later runs.
    pub fn is_style(self) -> bool {
        matches!(
            self,
            RecordKind::FontStyle
                | RecordKind::FontColour
                | RecordKind::Underline
                | RecordKind::Background
                | RecordKind::Inverse
                | RecordKind::TabDef
                | RecordKind::Link
                | RecordKind::LinkEnd
        )
    }

    pub fn name(self) -> &'static str {
        use RecordKind::*;
        match self {
            FontStyle => "font-style",
            FontColour => "font-colour",
            Underline => "underline",
            Background => "background",
            Inverse => "inverse",
            Object => "object",
            Link => "link",
            LinkEnd => "link-end",
            TabDef => "tab-def",
            ParagraphStart => "paragraph-start",
            ParagraphEnd => "paragraph-end",
            Advance => "advance",
            ListStart => "list-start",
            ListEnd => "list-end",
            TableStart => "table-start",
            TableEnd => "table-end",
            Row => "row",
            RowEnd => "row-end",
            Cell => "cell",
            CellEnd => "cell-end",
            SetMargins => "set-margins",
            IndexStart => "index-start",
            IndexEnd => "index-end",
        }
    }
}

pub const FONT_BOLD: u8 = 0x01;
pub const FONT_ITALIC: u8 = 0x02;

#[derive(Debug, Clone, PartialEq)]
pub struct FontStyle {
    pub face: String,
    pub size: Px,
    pub flags: u8,
    pub align: HAlign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Href,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub kind: LinkKind,
    pub target: String,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParagraphStart {
    /// Minimum gap from the previous paragraph, as a ratio of the line height.
    pub leading: f32,
    /// Vertical advance between wrapped lines, as a ratio of the line height.
    pub spacing: f32,
    pub indent: Px,
    pub trim: bool,
    pub list_item: bool,
    pub value: String,
}

impl Default for ParagraphStart {
    fn default() -> Self {
        Self {
            leading: 1.0,
            spacing: 1.0,
            indent: Px::ZERO,
            trim: false,
            list_item: false,
            value: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Bullet,
    Ordered,
    Custom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListStart {
    pub kind: ListKind,
    pub start: i32,
    pub item_indent: Px,
    pub block_indent: Px,
    pub vspacing: f32,
    pub colour: Option<Color>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableStart {
    pub columns: Vec<Length>,
    pub width: Length,
    pub min_height: Px,
    pub padding: Px,
    pub hspacing: Px,
    pub vspacing: Px,
    pub thickness: Px,
    pub align: HAlign,
    pub colour: Option<Color>,
    pub border: Option<Color>,
    pub highlight: Option<Color>,
    pub shadow: Option<Color>,
}

impl Default for TableStart {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            width: Length::Auto,
            min_height: Px::ZERO,
            padding: Px::from_i32(2),
            hspacing: Px::ZERO,
            vspacing: Px::ZERO,
            thickness: Px::ZERO,
            align: HAlign::Left,
            colour: None,
            border: None,
            highlight: None,
            shadow: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub min_height: Px,
    pub colour: Option<Color>,
    pub highlight: Option<Color>,
    pub shadow: Option<Color>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub col_span: u16,
    pub valign: VAlign,
    pub colour: Option<Color>,
    pub border: Option<Color>,
    /// Name of the edit definition that makes this cell editable; empty when read-only.
    pub edit: String,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            col_span: 1,
            valign: VAlign::Top,
            colour: None,
            border: None,
            edit: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SetMargins {
    pub left: Px,
    pub top: Px,
    pub right: Px,
    pub bottom: Px,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStart {
    pub name_hash: u32,
    pub id: u32,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    FontStyle(FontStyle),
    FontColour(Color),
    Underline(Option<Color>),
    Background(Option<Color>),
    Inverse(bool),
    Object(u32),
    Link(Link),
    LinkEnd,
    TabDef(Vec<Px>),
    ParagraphStart(ParagraphStart),
    ParagraphEnd,
    Advance { x: Px, y: Px },
    ListStart(ListStart),
    ListEnd,
    TableStart(TableStart),
    TableEnd,
    Row(Row),
    RowEnd,
    Cell(Cell),
    CellEnd,
    SetMargins(SetMargins),
    IndexStart(IndexStart),
    IndexEnd { id: u32 },
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::FontStyle(_) => RecordKind::FontStyle,
            Record::FontColour(_) => RecordKind::FontColour,
            Record::Underline(_) => RecordKind::Underline,
            Record::Background(_) => RecordKind::Background,
            Record::Inverse(_) => RecordKind::Inverse,
            Record::Object(_) => RecordKind::Object,
            Record::Link(_) => RecordKind::Link,
            Record::LinkEnd => RecordKind::LinkEnd,
            Record::TabDef(_) => RecordKind::TabDef,
            Record::ParagraphStart(_) => RecordKind::ParagraphStart,
            Record::ParagraphEnd => RecordKind::ParagraphEnd,
            Record::Advance { .. } => RecordKind::Advance,
            Record::ListStart(_) => RecordKind::ListStart,
            Record::ListEnd => RecordKind::ListEnd,
            Record::TableStart(_) => RecordKind::TableStart,
            Record::TableEnd => RecordKind::TableEnd,
            Record::Row(_) => RecordKind::Row,
            Record::RowEnd => RecordKind::RowEnd,
            Record::Cell(_) => RecordKind::Cell,
            Record::CellEnd => RecordKind::CellEnd,
            Record::SetMargins(_) => RecordKind::SetMargins,
            Record::IndexStart(_) => RecordKind::IndexStart,
            Record::IndexEnd { .. } => RecordKind::IndexEnd,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = PayloadWriter::default();
        match self {
            Record::FontStyle(style) => {
                w.string(&style.face);
                w.px(style.size);
                w.u8(style.flags);
                w.u8(style.align.to_u8());
            }
            Record::FontColour(colour) => w.colour(*colour),
            Record::Underline(colour) | Record::Background(colour) => w.opt_colour(*colour),
            Record::Inverse(enabled) => w.bool(*enabled),
            Record::Object(id) => w.u32(*id),
            Record::Link(link) => {
                w.u8(match link.kind {
                    LinkKind::Href => 0,
                    LinkKind::Function => 1,
                });
                w.string(&link.target);
                w.string(&link.hint);
            }
            Record::TabDef(stops) => {
                w.u16(stops.len().min(u16::MAX as usize) as u16);
                for stop in stops.iter().take(u16::MAX as usize) {
                    w.px(*stop);
                }
            }
            Record::ParagraphStart(para) => {
                w.f32(para.leading);
                w.f32(para.spacing);
                w.px(para.indent);
                w.bool(para.trim);
                w.bool(para.list_item);
                w.string(&para.value);
            }
            Record::Advance { x, y } => {
                w.px(*x);
                w.px(*y);
            }
            Record::ListStart(list) => {
                w.u8(match list.kind {
                    ListKind::Bullet => 0,
                    ListKind::Ordered => 1,
                    ListKind::Custom => 2,
                });
                w.i32(list.start);
                w.px(list.item_indent);
                w.px(list.block_indent);
                w.f32(list.vspacing);
                w.opt_colour(list.colour);
            }
            Record::TableStart(table) => {
                w.u16(table.columns.len().min(u16::MAX as usize) as u16);
                for column in table.columns.iter().take(u16::MAX as usize) {
                    w.length(*column);
                }
                w.length(table.width);
                w.px(table.min_height);
                w.px(table.padding);
                w.px(table.hspacing);
                w.px(table.vspacing);
                w.px(table.thickness);
                w.u8(table.align.to_u8());
                w.opt_colour(table.colour);
                w.opt_colour(table.border);
                w.opt_colour(table.highlight);
                w.opt_colour(table.shadow);
            }
            Record::Row(row) => {
                w.px(row.min_height);
                w.opt_colour(row.colour);
                w.opt_colour(row.highlight);
                w.opt_colour(row.shadow);
            }
            Record::Cell(cell) => {
                w.u16(cell.col_span);
                w.u8(cell.valign.to_u8());
                w.opt_colour(cell.colour);
                w.opt_colour(cell.border);
                w.string(&cell.edit);
            }
            Record::SetMargins(m) => {
                w.px(m.left);
                w.px(m.top);
                w.px(m.right);
                w.px(m.bottom);
            }
            Record::IndexStart(index) => {
                w.u32(index.name_hash);
                w.u32(index.id);
                w.bool(index.visible);
            }
            Record::IndexEnd { id } => w.u32(*id),
            Record::LinkEnd
            | Record::ParagraphEnd
            | Record::ListEnd
            | Record::TableEnd
            | Record::RowEnd
            | Record::CellEnd => {}
        }
        w.finish()
    }

    /// Decodes a payload of the given kind. `None` means the payload is truncated or carries an
    /// out-of-range value.
    pub fn decode(kind: RecordKind, payload: &[u8]) -> Option<Record> {
        let mut r = PayloadReader::new(payload);
        let record = match kind {
            RecordKind::FontStyle => Record::FontStyle(FontStyle {
                face: r.string()?,
                size: r.px()?,
                flags: r.u8()?,
                align: HAlign::from_u8(r.u8()?),
            }),
            RecordKind::FontColour => Record::FontColour(r.colour()?),
            RecordKind::Underline => Record::Underline(r.opt_colour()?),
            RecordKind::Background => Record::Background(r.opt_colour()?),
            RecordKind::Inverse => Record::Inverse(r.bool()?),
            RecordKind::Object => Record::Object(r.u32()?),
            RecordKind::Link => {
                let kind = match r.u8()? {
                    0 => LinkKind::Href,
                    1 => LinkKind::Function,
                    _ => return None,
                };
                Record::Link(Link {
                    kind,
                    target: r.string()?,
                    hint: r.string()?,
                })
            }
            RecordKind::LinkEnd => Record::LinkEnd,
            RecordKind::TabDef => {
                let count = r.u16()? as usize;
                let mut stops = Vec::with_capacity(count);
                for _ in 0..count {
                    stops.push(r.px()?);
                }
                Record::TabDef(stops)
            }
            RecordKind::ParagraphStart => Record::ParagraphStart(ParagraphStart {
                leading: r.f32()?,
                spacing: r.f32()?,
                indent: r.px()?,
                trim: r.bool()?,
                list_item: r.bool()?,
                value: r.string()?,
            }),
            RecordKind::ParagraphEnd => Record::ParagraphEnd,
            RecordKind::Advance => Record::Advance {
                x: r.px()?,
                y: r.px()?,
            },
            RecordKind::ListStart => {
                let kind = match r.u8()? {
                    0 => ListKind::Bullet,
                    1 => ListKind::Ordered,
                    2 => ListKind::Custom,
                    _ => return None,
                };
                Record::ListStart(ListStart {
                    kind,
                    start: r.i32()?,
                    item_indent: r.px()?,
                    block_indent: r.px()?,
                    vspacing: r.f32()?,
                    colour: r.opt_colour()?,
                })
            }
            RecordKind::ListEnd => Record::ListEnd,
            RecordKind::TableStart => {
                let count = r.u16()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(r.length()?);
                }
                Record::TableStart(TableStart {
                    columns,
                    width: r.length()?,
                    min_height: r.px()?,
                    padding: r.px()?,
                    hspacing: r.px()?,
                    vspacing: r.px()?,
                    thickness: r.px()?,
                    align: HAlign::from_u8(r.u8()?),
                    colour: r.opt_colour()?,
                    border: r.opt_colour()?,
                    highlight: r.opt_colour()?,
                    shadow: r.opt_colour()?,
                })
            }
            RecordKind::TableEnd => Record::TableEnd,
            RecordKind::Row => Record::Row(Row {
                min_height: r.px()?,
                colour: r.opt_colour()?,
                highlight: r.opt_colour()?,
                shadow: r.opt_colour()?,
            }),
            RecordKind::RowEnd => Record::RowEnd,
            RecordKind::Cell => Record::Cell(Cell {
                col_span: r.u16()?.max(1),
                valign: VAlign::from_u8(r.u8()?),
                colour: r.opt_colour()?,
                border: r.opt_colour()?,
                edit: r.string()?,
            }),
            RecordKind::CellEnd => Record::CellEnd,
            RecordKind::SetMargins => Record::SetMargins(SetMargins {
                left: r.px()?,
                top: r.px()?,
                right: r.px()?,
                bottom: r.px()?,
            }),
            RecordKind::IndexStart => Record::IndexStart(IndexStart {
                name_hash: r.u32()?,
                id: r.u32()?,
                visible: r.bool()?,
            }),
            RecordKind::IndexEnd => Record::IndexEnd { id: r.u32()? },
        };
        if !r.is_exhausted() {
            return None;
        }
        Some(record)
    }
}

/// Case-insensitive FNV-1a hash used for index and edit names.
pub fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.trim().bytes() {
        hash ^= byte.to_ascii_lowercase() as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Default)]
struct PayloadWriter {
    out: Vec<u8>,
}

impl PayloadWriter {
    fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.out.push(value as u8);
    }

    fn u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.u32(value.to_bits());
    }

    fn px(&mut self, value: Px) {
        self.i32(value.to_milli_i32());
    }

    fn string(&mut self, value: &str) {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.u16(end as u16);
        self.out.extend_from_slice(&value.as_bytes()[..end]);
    }

    fn colour(&mut self, colour: Color) {
        self.out.extend_from_slice(&colour.to_rgba8());
    }

    fn opt_colour(&mut self, colour: Option<Color>) {
        match colour {
            Some(colour) => {
                self.u8(1);
                self.colour(colour);
            }
            None => self.u8(0),
        }
    }

    fn length(&mut self, length: Length) {
        match length {
            Length::Auto => {
                self.u8(0);
                self.i32(0);
            }
            Length::Px(px) => {
                self.u8(1);
                self.px(px);
            }
            Length::Percent(pct) => {
                self.u8(2);
                self.i32((pct * 1000.0).round() as i32);
            }
        }
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn bool(&mut self) -> Option<bool> {
        match self.u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn f32(&mut self) -> Option<f32> {
        let value = f32::from_bits(self.u32()?);
        value.is_finite().then_some(value)
    }

    fn px(&mut self) -> Option<Px> {
        self.i32().map(|milli| Px::from_milli_i64(milli as i64))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).ok().map(|s| s.to_string())
    }

    fn colour(&mut self) -> Option<Color> {
        let b = self.take(4)?;
        Some(Color::from_rgba8(b[0], b[1], b[2], b[3]))
    }

    fn opt_colour(&mut self) -> Option<Option<Color>> {
        match self.u8()? {
            0 => Some(None),
            1 => Some(Some(self.colour()?)),
            _ => None,
        }
    }

    fn length(&mut self) -> Option<Length> {
        let tag = self.u8()?;
        let value = self.i32()?;
        match tag {
            0 => Some(Length::Auto),
            1 => Some(Length::Px(Px::from_milli_i64(value as i64))),
            2 => Some(Length::Percent(value as f32 / 1000.0)),
            _ => None,
        }
    }
}
