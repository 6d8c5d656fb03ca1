//! Layout Engine: turns a stream into positioned segments.
//!
//! One forward walk per flow (the page, or a table cell). Text is placed word by word and a word
//! that does not fit rewinds the line to its last whitespace. Tables are measured with unbounded
//! width first, their columns negotiated, and then laid out cell by cell. Lists and tables restart
//! themselves a bounded number of times when a marker or a cell turns out wider than planned.
//!
//! Top-level block boundaries are checkpointed so that an edit can be re-laid from the nearest
//! boundary before it instead of from the top of the stream.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::json;

use crate::debug::DebugLogger;
use crate::error::RippleError;
use crate::font::FontMetrics;
use crate::metrics::LayoutMetrics;
use crate::object::{LayoutOptions, ObjectTable};
use crate::records::{
    self, Cell, IndexStart, Link, LinkKind, ListKind, ListStart, ParagraphStart, Record,
    RecordKind, Row, SetMargins, TableStart,
};
use crate::segments::{
    BoxKind, BoxPlacement, Clip, EditRegion, IndexMark, LinkRegion, Marker, ObjectLayer,
    ObjectPlacement, Segment, SegmentFlags, SegmentIndex, TextRun,
};
use crate::stream::{RecordView, Stream, StructureMap, Unit};
use crate::style::{TextStyle, replay};
use crate::table::{self, ColumnRequest};
use crate::types::{Color, HAlign, Length, Margins, Px, Rect, Size};

pub const MIN_PAGE_WIDTH: i32 = 20;
pub const MAX_PAGE_WIDTH: i32 = 30000;
pub const MAX_DEPTH: usize = 40;
pub const MAX_REPASS: usize = 8;

const BULLET: &str = "\u{2022}";
const ZERO: Px = Px::ZERO;

/// A named edit definition referenced by editable cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EditDef {
    pub name: String,
    pub max_chars: Option<usize>,
    pub line_breaks: bool,
    pub on_enter: Option<String>,
    pub on_exit: Option<String>,
    pub on_change: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub width: Px,
    /// The page is never reported shorter than this.
    pub min_height: Px,
    pub margins: Margins,
    pub base_style: TextStyle,
    /// Default tab stop interval when the style defines no explicit stops.
    pub tab_width: Px,
    pub max_depth: usize,
    pub max_repass: usize,
}

impl LayoutConfig {
    pub fn new(width: Px, base_style: TextStyle) -> Self {
        Self {
            width,
            min_height: ZERO,
            margins: Margins::default(),
            base_style,
            tab_width: Px::from_i32(40),
            max_depth: MAX_DEPTH,
            max_repass: MAX_REPASS,
        }
    }
}

/// Everything a layout pass reads.
pub struct LayoutContext<'a> {
    pub stream: &'a Stream,
    pub metrics: &'a dyn FontMetrics,
    pub objects: &'a ObjectTable,
    pub edits: &'a HashMap<u32, EditDef>,
    pub config: &'a LayoutConfig,
    pub(crate) debug: Option<&'a DebugLogger>,
}

impl<'a> LayoutContext<'a> {
    pub fn new(
        stream: &'a Stream,
        metrics: &'a dyn FontMetrics,
        objects: &'a ObjectTable,
        edits: &'a HashMap<u32, EditDef>,
        config: &'a LayoutConfig,
    ) -> Self {
        Self {
            stream,
            metrics,
            objects,
            edits,
            config,
            debug: None,
        }
    }

    pub(crate) fn with_debug(mut self, debug: Option<&'a DebugLogger>) -> Self {
        self.debug = debug;
        self
    }
}

/// Result of laying out a whole stream.
#[derive(Debug, Default)]
pub struct Layout {
    index: SegmentIndex,
    errors: Vec<RippleError>,
    checkpoints: Vec<Checkpoint>,
    plans: HashMap<usize, Plan>,
    width: Px,
    height: Px,
    metrics: LayoutMetrics,
}

impl Layout {
    pub fn run(ctx: &LayoutContext<'_>) -> Layout {
        let started = Instant::now();
        let mut engine = Engine::new(ctx, Layout::default());
        engine.execute(None);
        engine.finish(started)
    }

    /// Re-lays the stream after an edit at `edit_index`, resuming from the last checkpoint at or
    /// before it. Everything before that checkpoint is kept as is.
    pub fn relayout_from(&mut self, ctx: &LayoutContext<'_>, edit_index: usize) {
        let started = Instant::now();
        let keep = self.checkpoints.partition_point(|c| c.pos <= edit_index);
        let Some(checkpoint) = keep
            .checked_sub(1)
            .and_then(|i| self.checkpoints.get(i))
            .cloned()
        else {
            *self = Layout::run(ctx);
            return;
        };
        let mut previous = std::mem::take(self);
        previous.checkpoints.truncate(keep);
        previous.index.rollback(checkpoint.mark);
        previous.errors.truncate(checkpoint.errors);
        previous.plans.retain(|start, _| *start < checkpoint.pos);

        let mut engine = Engine::new(ctx, previous);
        engine.metrics.resumed_passes += 1;
        engine.metrics.resumed_from = Some(checkpoint.pos);
        engine.execute(Some(checkpoint));
        *self = engine.finish(started);
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    pub fn errors(&self) -> &[RippleError] {
        &self.errors
    }

    /// Laid-out width: the configured page width, or wider when unbreakable content overflows.
    pub fn width(&self) -> Px {
        self.width
    }

    pub fn height(&self) -> Px {
        self.height
    }

    pub fn metrics(&self) -> &LayoutMetrics {
        &self.metrics
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// The last checkpoint at or before `index` with the text style in force there. Style replay
    /// can start from it instead of the top of the stream.
    pub fn style_seed(&self, index: usize) -> Option<(usize, &TextStyle)> {
        let keep = self.checkpoints.partition_point(|c| c.pos <= index);
        let checkpoint = self.checkpoints.get(keep.checked_sub(1)?)?;
        Some((checkpoint.pos, &checkpoint.flow.style))
    }
}

#[derive(Debug, Clone)]
struct Checkpoint {
    pos: usize,
    flow: Box<Flow>,
    mark: IndexMark,
    errors: usize,
}

/// Decisions carried from one pass of a construct into the next.
#[derive(Debug, Clone, Default)]
struct Plan {
    item_indent: Option<Px>,
    repasses: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Paragraph,
    List,
    Table,
    Index,
}

impl FrameKind {
    fn name(self) -> &'static str {
        match self {
            FrameKind::Paragraph => "paragraph",
            FrameKind::List => "list",
            FrameKind::Table => "table",
            FrameKind::Index => "index",
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    start: usize,
    parent: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Area {
    left: Px,
    width: Px,
    top: Px,
    /// Clips recorded before this flow started do not push its text.
    clip_floor: usize,
    edit: bool,
    top_level: bool,
}

impl Area {
    fn bounded(&self) -> bool {
        self.width < Px::UNBOUNDED
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FlowExtent {
    height: Px,
    widest: Px,
    min_width: Px,
}

#[derive(Debug, Clone)]
struct Para {
    trim: bool,
    spacing: f32,
}

#[derive(Debug, Clone)]
struct OpenLink {
    record_index: usize,
    element_id: u32,
    kind: LinkKind,
    target: String,
    start_x: Option<Px>,
}

#[derive(Debug, Clone)]
struct ListState {
    start: usize,
    kind: ListKind,
    counter: i32,
    item_indent: Px,
    block_indent: Px,
    vspacing: f32,
    colour: Option<Color>,
    /// Widest marker seen that did not fit the item indent.
    widen: Px,
    snapshot: Box<Flow>,
    mark: IndexMark,
    errors: usize,
    frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
struct PendingMarker {
    stream_index: usize,
    x: Px,
    text: String,
    colour: Option<Color>,
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    x: Px,
}

#[derive(Debug, Clone)]
struct PendingRun {
    start: usize,
    stop: usize,
    x: Px,
    width: Px,
    piece: usize,
}

#[derive(Debug, Clone)]
struct PendingObject {
    stream_index: usize,
    object_id: u32,
    x: Px,
    width: Px,
    height: Px,
    piece: usize,
}

#[derive(Debug, Clone)]
struct PendingLink {
    record_index: usize,
    element_id: u32,
    kind: LinkKind,
    target: String,
    x0: Px,
    x1: Px,
}

/// Line state saved after each whitespace so an overflowing word can be pushed to the next line.
#[derive(Debug, Clone)]
struct WrapPoint {
    pos: usize,
    x: Px,
    content_x: Px,
    content_stop: usize,
    ascent: Px,
    descent: Px,
    words: usize,
    runs: usize,
    last_run: Option<PendingRun>,
    objects: usize,
    links: usize,
    pieces: usize,
    style: TextStyle,
    link: Option<OpenLink>,
    float_bottom: Px,
    mark: IndexMark,
    errors: usize,
    frames: Vec<Frame>,
}

/// The line being filled.
#[derive(Debug, Clone, Default)]
struct Line {
    start: usize,
    y: Px,
    left: Px,
    x: Px,
    align: HAlign,
    ascent: Px,
    descent: Px,
    started: bool,
    words: usize,
    has_text: bool,
    has_controls: bool,
    has_objects: bool,
    /// Right edge and stream end of the last non-whitespace content.
    content_x: Px,
    content_stop: usize,
    /// Horizontal pieces; a new one starts when content jumps past a clip.
    pieces: Vec<Piece>,
    runs: Vec<PendingRun>,
    objects: Vec<PendingObject>,
    links: Vec<PendingLink>,
    wrap: Option<WrapPoint>,
}

impl Line {
    fn new(start: usize, y: Px, left: Px) -> Self {
        Self {
            start,
            y,
            left,
            x: left,
            content_x: left,
            content_stop: start,
            pieces: vec![Piece { start, x: left }],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Flow {
    area: Area,
    margins: SetMargins,
    style: TextStyle,
    line: Line,
    para: Option<Para>,
    last_para_end: Option<Px>,
    link: Option<OpenLink>,
    lists: Vec<ListState>,
    marker: Option<PendingMarker>,
    widest: Px,
    min_width: Px,
    float_bottom: Px,
}

impl Flow {
    fn new(area: Area, margins: SetMargins, style: TextStyle, start: usize) -> Self {
        let line = Line::new(start, area.top + margins.top, area.left + margins.left);
        Self {
            area,
            margins,
            style,
            line,
            para: None,
            last_para_end: None,
            link: None,
            lists: Vec::new(),
            marker: None,
            widest: ZERO,
            min_width: ZERO,
            float_bottom: ZERO,
        }
    }
}

enum Fit {
    Place(Px),
    /// The line was closed; continue from this stream position.
    Restart(usize),
    /// Nothing fits even on an empty line.
    Overflow(Px),
}

/// Cell measurements depend on where the cell starts and the width it may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MeasureKey {
    content_start: usize,
    ceiling: Px,
    edit: bool,
}

#[derive(Debug, Clone)]
struct CellSpec {
    index: usize,
    element_id: u32,
    record: Cell,
    content_start: usize,
    content_end: usize,
}

impl CellSpec {
    fn span(&self) -> usize {
        usize::from(self.record.col_span.max(1))
    }
}

#[derive(Debug, Clone)]
struct RowSpec {
    index: usize,
    record: Row,
    cells: Vec<CellSpec>,
}

struct TableGeometry {
    index: usize,
    body: usize,
    after: usize,
    covered_from: usize,
    left: Px,
    width: Px,
    top: Px,
    edit: bool,
}

struct PlacedTable {
    width: Px,
    height: Px,
    min_width: Px,
}

struct TablePass {
    height: Px,
    grow: Vec<(usize, Px)>,
}

struct Engine<'c> {
    ctx: &'c LayoutContext<'c>,
    structure: StructureMap,
    /// Layout stops at the first undecodable unit.
    end: usize,
    index: SegmentIndex,
    errors: Vec<RippleError>,
    frames: Vec<Frame>,
    plans: HashMap<usize, Plan>,
    measured: HashMap<MeasureKey, (TextStyle, FlowExtent, TextStyle)>,
    measuring: usize,
    checkpoints: Vec<Checkpoint>,
    metrics: LayoutMetrics,
    width: Px,
    height: Px,
}

impl<'c> Engine<'c> {
    fn new(ctx: &'c LayoutContext<'c>, prior: Layout) -> Self {
        let len = ctx.stream.len();
        let structure = ctx.stream.scan_structure(0, len);
        let end = match structure.fault() {
            Some(RippleError::Structural { index, .. }) => (*index).min(len),
            _ => len,
        };
        Self {
            ctx,
            structure,
            end,
            index: prior.index,
            errors: prior.errors,
            frames: Vec::new(),
            plans: prior.plans,
            measured: HashMap::new(),
            measuring: 0,
            checkpoints: prior.checkpoints,
            metrics: LayoutMetrics::default(),
            width: ZERO,
            height: ZERO,
        }
    }

    fn execute(&mut self, resume: Option<Checkpoint>) {
        self.metrics.passes += 1;
        let (pos, mut flow) = match resume {
            Some(checkpoint) => (checkpoint.pos, *checkpoint.flow),
            None => (0, self.page_flow()),
        };
        let extent = self.flow(&mut flow, pos, self.end);
        let fault = self.structure.fault().map(|fault| match fault {
            RippleError::Structural { index, message } => {
                RippleError::structural(*index, message.clone())
            }
            other => RippleError::structural(self.end, other.to_string()),
        });
        if let Some(fault) = fault {
            self.report(fault);
        }
        let config = self.ctx.config;
        self.height = extent.height.max(config.min_height);
        self.width = config.width.max(extent.min_width);
    }

    fn finish(mut self, started: Instant) -> Layout {
        self.index.rebuild_y_order();
        self.metrics.segments = self.index.segments().len();
        self.metrics.runs = self.index.runs().len();
        self.metrics.clips = self.index.clips().len();
        self.metrics.errors = self.errors.len();
        self.metrics.layout_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(debug) = self.ctx.debug {
            debug.event(
                "layout.pass",
                json!({
                    "resumed_from": self.metrics.resumed_from,
                    "segments": self.metrics.segments,
                    "errors": self.metrics.errors,
                    "height": self.height.to_f32(),
                    "table_passes": self.metrics.table_passes,
                }),
            );
        }
        log::debug!(
            "layout: {} segments, {} errors, height {:.1}",
            self.metrics.segments,
            self.metrics.errors,
            self.height.to_f32()
        );
        Layout {
            index: self.index,
            errors: self.errors,
            checkpoints: self.checkpoints,
            plans: self.plans,
            width: self.width,
            height: self.height,
            metrics: self.metrics,
        }
    }

    fn page_flow(&self) -> Flow {
        let config = self.ctx.config;
        let area = Area {
            left: ZERO,
            width: config.width,
            top: ZERO,
            clip_floor: 0,
            edit: false,
            top_level: true,
        };
        let margins = SetMargins {
            left: config.margins.left,
            top: config.margins.top,
            right: config.margins.right,
            bottom: config.margins.bottom,
        };
        Flow::new(area, margins, config.base_style.clone(), 0)
    }

    fn report(&mut self, err: RippleError) {
        if self.measuring == 0 {
            log::debug!("layout: {err}");
            if let Some(debug) = self.ctx.debug {
                let index = match &err {
                    RippleError::Structural { index, .. } => Some(*index),
                    _ => None,
                };
                debug.event(
                    "layout.error",
                    json!({ "index": index, "message": err.to_string() }),
                );
            }
        }
        self.errors.push(err);
    }

    // ---- flow walk ---------------------------------------------------------------------------

    fn flow(&mut self, flow: &mut Flow, start: usize, end: usize) -> FlowExtent {
        let stream = self.ctx.stream;
        let mut pos = start;
        while pos < end {
            let unit = match stream.units(pos, end).next() {
                Some(Ok(unit)) => unit,
                Some(Err(err)) => {
                    self.report(err);
                    break;
                }
                None => break,
            };
            pos = match unit {
                Unit::Text { index, text } => self.text(flow, index, text),
                Unit::Record(view) => {
                    self.checkpoint(flow, &view);
                    self.record(flow, view)
                }
            };
        }
        self.close_line(flow, pos.min(end));
        FlowExtent {
            height: (flow.line.y.max(flow.float_bottom) + flow.margins.bottom - flow.area.top)
                .max(ZERO),
            widest: flow.widest,
            min_width: flow.min_width,
        }
    }

    fn checkpoint(&mut self, flow: &Flow, view: &RecordView<'_>) {
        if !matches!(
            view.kind,
            RecordKind::ParagraphStart | RecordKind::TableStart | RecordKind::ListStart
        ) {
            return;
        }
        if self.measuring > 0
            || !flow.area.top_level
            || !self.frames.is_empty()
            || !flow.lists.is_empty()
            || flow.link.is_some()
            || flow.para.is_some()
            || flow.line.started
        {
            return;
        }
        if self.checkpoints.last().is_some_and(|c| c.pos >= view.index) {
            return;
        }
        self.checkpoints.push(Checkpoint {
            pos: view.index,
            flow: Box::new(flow.clone()),
            mark: self.index.mark(),
            errors: self.errors.len(),
        });
    }

    fn text(&mut self, flow: &mut Flow, index: usize, text: &str) -> usize {
        let metrics = self.ctx.metrics;
        let mut offset = 0;
        while offset < text.len() {
            let at = index + offset;
            let rest = &text[offset..];
            let Some(ch) = rest.chars().next() else {
                break;
            };
            match ch {
                '\n' => {
                    self.begin(flow);
                    self.touch_font(flow);
                    flow.line.has_text = true;
                    self.close_line(flow, at + 1);
                    offset += 1;
                }
                '\r' => offset += 1,
                ' ' => {
                    let width = metrics.text_width(&flow.style.face, " ");
                    self.begin(flow);
                    self.touch_font(flow);
                    self.push_run(flow, at, at + 1, width);
                    self.mark_wrap(flow, at + 1);
                    offset += 1;
                }
                '\t' => {
                    let width = self.tab_advance(flow);
                    self.begin(flow);
                    self.touch_font(flow);
                    flow.line.has_text = true;
                    flow.line.x += width;
                    self.mark_wrap(flow, at + 1);
                    offset += 1;
                }
                _ => {
                    let len = rest.find([' ', '\t', '\n', '\r']).unwrap_or(rest.len());
                    let word = &rest[..len];
                    let width = metrics.text_width(&flow.style.face, word);
                    match self.fit(flow, at, width) {
                        Fit::Place(x) => {
                            self.move_to(flow, at, x);
                            self.push_word(flow, at, len, width);
                            offset += len;
                        }
                        Fit::Restart(pos) => return pos,
                        Fit::Overflow(x) => {
                            let cut = self.split_word(flow, word, x);
                            let cut_width = if cut == len {
                                width
                            } else {
                                metrics.text_width(&flow.style.face, &word[..cut])
                            };
                            self.move_to(flow, at, x);
                            self.push_word(flow, at, cut, cut_width);
                            if cut < len {
                                self.close_line(flow, at + cut);
                                return at + cut;
                            }
                            offset += len;
                        }
                    }
                }
            }
        }
        index + text.len()
    }

    /// Largest prefix of `word` that fits from `x`, at least one character.
    fn split_word(&self, flow: &Flow, word: &str, x: Px) -> usize {
        let available = self.right_limit(flow) - x;
        let mut cut = 0;
        for (i, ch) in word.char_indices() {
            let end = i + ch.len_utf8();
            if cut > 0 && self.ctx.metrics.text_width(&flow.style.face, &word[..end]) > available
            {
                break;
            }
            cut = end;
        }
        cut
    }

    fn tab_advance(&self, flow: &Flow) -> Px {
        let rel = flow.line.x - flow.line.left;
        if let Some(stop) = flow.style.tabs.iter().copied().find(|stop| *stop > rel) {
            return stop - rel;
        }
        let step = self.ctx.config.tab_width.to_milli_i64();
        if step <= 0 {
            return ZERO;
        }
        let rel_milli = rel.to_milli_i64().max(0);
        Px::from_milli_i64((rel_milli / step + 1) * step) - rel
    }

    fn begin(&self, flow: &mut Flow) {
        let line = &mut flow.line;
        if !line.started {
            line.started = true;
            line.align = flow.style.align;
            if let Some(first) = line.pieces.first_mut() {
                first.x = line.x;
            }
        }
    }

    fn touch_font(&self, flow: &mut Flow) {
        let face = &flow.style.face;
        let ascent = self.ctx.metrics.ascent(face);
        let height = self.ctx.metrics.line_height(face);
        flow.line.ascent = flow.line.ascent.max(ascent);
        flow.line.descent = flow.line.descent.max((height - ascent).max(ZERO));
    }

    fn move_to(&self, flow: &mut Flow, at: usize, x: Px) {
        let line = &mut flow.line;
        if x <= line.x {
            return;
        }
        if line.words > 0 {
            line.pieces.push(Piece { start: at, x });
        }
        line.x = x;
    }

    fn push_word(&mut self, flow: &mut Flow, at: usize, len: usize, width: Px) {
        self.begin(flow);
        self.touch_font(flow);
        self.push_run(flow, at, at + len, width);
        let line = &mut flow.line;
        line.words += 1;
        line.content_x = line.x;
        line.content_stop = at + len;
        let offset = line.left - flow.area.left;
        flow.min_width = flow.min_width.max(offset + width + flow.margins.right);
    }

    fn push_run(&mut self, flow: &mut Flow, start: usize, stop: usize, width: Px) {
        let x = flow.line.x;
        if let Some(link) = flow.link.as_mut() {
            if link.start_x.is_none() {
                link.start_x = Some(x);
            }
        }
        let line = &mut flow.line;
        let piece = line.pieces.len().saturating_sub(1);
        line.has_text = true;
        line.x += width;
        if let Some(last) = line.runs.last_mut() {
            if last.stop == start && last.piece == piece && last.x + last.width == x {
                last.stop = stop;
                last.width += width;
                return;
            }
        }
        line.runs.push(PendingRun {
            start,
            stop,
            x,
            width,
            piece,
        });
    }

    fn mark_wrap(&mut self, flow: &mut Flow, pos: usize) {
        if flow.line.words == 0 || !flow.area.bounded() {
            return;
        }
        let line = &flow.line;
        let wrap = WrapPoint {
            pos,
            x: line.x,
            content_x: line.content_x,
            content_stop: line.content_stop,
            ascent: line.ascent,
            descent: line.descent,
            words: line.words,
            runs: line.runs.len(),
            last_run: line.runs.last().cloned(),
            objects: line.objects.len(),
            links: line.links.len(),
            pieces: line.pieces.len(),
            style: flow.style.clone(),
            link: flow.link.clone(),
            float_bottom: flow.float_bottom,
            mark: self.index.mark(),
            errors: self.errors.len(),
            frames: self.frames.clone(),
        };
        flow.line.wrap = Some(wrap);
    }

    fn rewind(&mut self, flow: &mut Flow, wrap: WrapPoint) {
        let line = &mut flow.line;
        line.x = wrap.x;
        line.content_x = wrap.content_x;
        line.content_stop = wrap.content_stop;
        line.ascent = wrap.ascent;
        line.descent = wrap.descent;
        line.words = wrap.words;
        line.runs.truncate(wrap.runs);
        if let (Some(saved), Some(last)) = (wrap.last_run, line.runs.last_mut()) {
            *last = saved;
        }
        line.objects.truncate(wrap.objects);
        line.has_objects = !line.objects.is_empty();
        line.links.truncate(wrap.links);
        line.pieces.truncate(wrap.pieces);
        flow.style = wrap.style;
        flow.link = wrap.link;
        flow.float_bottom = wrap.float_bottom;
        self.index.rollback(wrap.mark);
        self.errors.truncate(wrap.errors);
        self.frames = wrap.frames;
    }

    fn band(&self, flow: &Flow) -> Px {
        (flow.line.ascent + flow.line.descent).max(self.ctx.metrics.line_height(&flow.style.face))
    }

    /// Moves `x` right past every opaque clip that overlaps `[x, x + width)` on the line's band.
    fn clear_clips(&self, flow: &Flow, mut x: Px, width: Px, band: Px) -> Px {
        let top = flow.line.y;
        let bottom = top + band;
        let clips = self.index.clips_from(flow.area.clip_floor);
        loop {
            let mut moved = false;
            for clip in clips
                .iter()
                .filter(|c| !c.transparent && c.rect.overlaps_band(top, bottom))
            {
                if clip.rect.x < x + width && x < clip.rect.right() {
                    x = clip.rect.right();
                    moved = true;
                }
            }
            if !moved {
                return x;
            }
        }
    }

    /// Bottom of the highest opaque clip crossing the line's band.
    fn blocking_bottom(&self, flow: &Flow, band: Px) -> Option<Px> {
        let top = flow.line.y;
        let bottom = top + band;
        let left = flow.line.left;
        let right = self.right_limit(flow);
        self.index
            .clips_from(flow.area.clip_floor)
            .iter()
            .filter(|c| {
                !c.transparent
                    && c.rect.overlaps_band(top, bottom)
                    && c.rect.x < right
                    && left < c.rect.right()
            })
            .map(|c| c.rect.bottom())
            .min()
    }

    fn fit(&mut self, flow: &mut Flow, at: usize, width: Px) -> Fit {
        loop {
            let band = self.band(flow);
            let x = self.clear_clips(flow, flow.line.x, width, band);
            if x + width <= self.right_limit(flow) {
                return Fit::Place(x);
            }
            if let Some(wrap) = flow.line.wrap.take() {
                let pos = wrap.pos;
                self.rewind(flow, wrap);
                self.close_line(flow, pos);
                return Fit::Restart(pos);
            }
            if flow.line.words > 0 {
                self.close_line(flow, at);
                return Fit::Restart(at);
            }
            match self.blocking_bottom(flow, band) {
                Some(bottom) if bottom > flow.line.y => flow.line.y = bottom,
                _ => return Fit::Overflow(x),
            }
        }
    }

    fn line_left(&self, flow: &Flow) -> Px {
        let lists: Px = flow
            .lists
            .iter()
            .map(|l| l.block_indent + l.item_indent)
            .sum();
        flow.area.left + flow.margins.left + lists
    }

    fn right_limit(&self, flow: &Flow) -> Px {
        flow.area.left + flow.area.width - flow.margins.right
    }

    /// Re-derives the left edge of a line that has no content yet.
    fn refresh_line(&self, flow: &mut Flow) {
        if flow.line.started {
            return;
        }
        let left = self.line_left(flow);
        let line = &mut flow.line;
        line.left = left;
        line.x = left;
        line.content_x = left;
        if let Some(first) = line.pieces.first_mut() {
            first.x = left;
        }
    }

    fn table_depth(&self) -> u8 {
        let depth = self
            .frames
            .iter()
            .filter(|f| f.kind == FrameKind::Table)
            .count();
        u8::try_from(depth).unwrap_or(u8::MAX)
    }

    fn close_line(&mut self, flow: &mut Flow, stop: usize) {
        if stop <= flow.line.start && !flow.line.started {
            return;
        }
        let next_left = self.line_left(flow);
        let line = std::mem::take(&mut flow.line);
        let stop = stop.max(line.start);
        let content = line.started;
        let height = if content {
            line.ascent + line.descent
        } else {
            ZERO
        };
        let right = self.right_limit(flow);
        let trim = flow.para.as_ref().is_some_and(|p| p.trim);
        let offset = if content && flow.area.bounded() && line.pieces.len() == 1 {
            line.align
                .offset(right - line.left, line.content_x - line.left)
        } else {
            ZERO
        };
        let depth = self.table_depth();
        let last = line.pieces.len().saturating_sub(1);
        let mut first_segment = None;

        for (k, piece) in line.pieces.iter().enumerate() {
            let seg_start = if k == 0 { line.start } else { piece.start };
            let seg_stop = line.pieces.get(k + 1).map_or(stop, |p| p.start);
            let has_runs = line.runs.iter().any(|r| r.piece == k);
            let has_objects = line.objects.iter().any(|o| o.piece == k);
            let mut extent = line
                .runs
                .iter()
                .filter(|r| r.piece == k)
                .map(|r| r.x + r.width)
                .chain(
                    line.objects
                        .iter()
                        .filter(|o| o.piece == k)
                        .map(|o| o.x + o.width),
                )
                .fold(piece.x, Px::max);
            let (trim_stop, content_end) = if k == last {
                if content {
                    extent = extent.max(line.x);
                }
                (
                    line.content_stop.clamp(seg_start, seg_stop),
                    line.content_x.max(piece.x),
                )
            } else {
                (seg_stop, extent)
            };
            let full = extent - piece.x;
            let align_width = content_end - piece.x;
            let width = if trim {
                align_width
            } else {
                full.min((right - piece.x).max(align_width))
            };
            let has_text = line.has_text && (has_runs || k == 0);
            let flags = SegmentFlags {
                edit: flow.area.edit,
                has_text,
                has_controls: line.has_controls,
                has_objects,
                mergeable: !has_text && !has_objects,
            };
            let segment = self.index.push_segment(Segment {
                stream_start: seg_start,
                stream_stop: seg_stop,
                trim_stop,
                x: piece.x + offset,
                y: line.y,
                width,
                align_width,
                height,
                baseline: line.ascent,
                depth,
                flags,
            });
            first_segment.get_or_insert(segment);
            for run in line.runs.iter().filter(|r| r.piece == k) {
                self.index.push_run(TextRun {
                    start: run.start,
                    stop: run.stop,
                    x: run.x + offset,
                    width: run.width,
                    segment,
                });
            }
            for object in line.objects.iter().filter(|o| o.piece == k) {
                self.index.push_object(ObjectPlacement {
                    stream_index: object.stream_index,
                    object_id: object.object_id,
                    rect: Rect::new(
                        object.x + offset,
                        line.y + line.ascent - object.height,
                        object.width,
                        object.height,
                    ),
                    layer: ObjectLayer::Inline,
                });
            }
        }

        let segment = first_segment.unwrap_or(0);
        for link in &line.links {
            self.index.push_link(LinkRegion {
                record_index: link.record_index,
                element_id: link.element_id,
                rect: Rect::new(link.x0 + offset, line.y, link.x1 - link.x0, height),
                segment,
                kind: link.kind,
                target: link.target.clone(),
            });
        }
        if let Some(open) = flow.link.as_mut() {
            if let Some(x0) = open.start_x.take() {
                let x1 = line.content_x.max(x0);
                if x1 > x0 {
                    self.index.push_link(LinkRegion {
                        record_index: open.record_index,
                        element_id: open.element_id,
                        rect: Rect::new(x0 + offset, line.y, x1 - x0, height),
                        segment,
                        kind: open.kind,
                        target: open.target.clone(),
                    });
                }
            }
        }
        if content {
            if let Some(marker) = flow.marker.take() {
                self.index.push_marker(Marker {
                    stream_index: marker.stream_index,
                    x: marker.x,
                    baseline: line.y + line.ascent,
                    text: marker.text,
                    colour: marker.colour,
                });
            }
            let used = line.content_x.max(line.x.min(right)) - flow.area.left;
            flow.widest = flow.widest.max(used + offset + flow.margins.right);
        }

        let spacing = flow.para.as_ref().map_or(1.0, |p| p.spacing);
        let advance = if spacing == 1.0 {
            height
        } else {
            height * spacing.max(0.0)
        };
        flow.line = Line::new(stop, line.y + advance, next_left);
    }

    // ---- records -----------------------------------------------------------------------------

    fn record(&mut self, flow: &mut Flow, view: RecordView<'_>) -> usize {
        let next = view.end();
        flow.line.has_controls = true;
        let record = match view.record() {
            Ok(record) => record,
            Err(err) => {
                self.report(err);
                return next;
            }
        };
        if view.kind.is_style() {
            flow.style.apply(view.index, &record);
        }
        match &record {
            Record::Link(link) => self.open_link(flow, &view, link),
            Record::LinkEnd => self.close_link(flow, view.index),
            Record::Object(id) => return self.object(flow, view.index, *id, next),
            Record::ParagraphStart(para) => self.paragraph_start(flow, view.index, para),
            Record::ParagraphEnd => self.paragraph_end(flow, view.index, next),
            Record::Advance { x, y } => self.advance(flow, view.index, *x, *y),
            Record::SetMargins(margins) => self.set_margins(flow, view.index, *margins),
            Record::ListStart(list) => return self.list_start(flow, view.index, list, next),
            Record::ListEnd => return self.list_end(flow, view.index, next),
            Record::TableStart(table) => return self.table(flow, view.index, table, next),
            Record::IndexStart(start) => return self.index_start(flow, view.index, *start, next),
            Record::IndexEnd { .. } => {
                self.pop_frame(FrameKind::Index, view.index);
            }
            Record::Row(_) | Record::Cell(_) => {
                let stop = self.construct_end(view.index, next);
                let message = format!("{} outside a table", view.kind.name());
                return self.skip(flow, view.index, stop, message);
            }
            Record::TableEnd | Record::RowEnd | Record::CellEnd => {
                let message = format!("{} without a matching start", view.kind.name());
                self.report(RippleError::structural(view.index, message));
            }
            _ => {}
        }
        next
    }

    fn after(&self, index: usize) -> usize {
        self.ctx
            .stream
            .decode(index)
            .map(|view| view.end())
            .unwrap_or(index)
    }

    fn construct_end(&self, index: usize, next: usize) -> usize {
        let stop = match self.structure.closing_of(index) {
            Some(end) => self.after(end),
            None => self.structure.cut_of(index).unwrap_or(next),
        };
        stop.max(next)
    }

    fn nesting(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| matches!(f.kind, FrameKind::Table | FrameKind::List))
            .count()
    }

    fn push_frame(&mut self, kind: FrameKind, start: usize) {
        let parent = self.frames.len().checked_sub(1);
        self.frames.push(Frame {
            kind,
            start,
            parent,
        });
    }

    /// Pops the innermost frame of `kind` above the nearest enclosing table.
    fn pop_frame(&mut self, kind: FrameKind, index: usize) -> bool {
        let floor = self
            .frames
            .iter()
            .rposition(|f| f.kind == FrameKind::Table)
            .map_or(0, |i| i + 1);
        match self.frames[floor..].iter().rposition(|f| f.kind == kind) {
            Some(pos) => {
                self.frames.truncate(floor + pos);
                true
            }
            None => {
                let message = format!("{} end without a matching start", kind.name());
                self.report(RippleError::structural(index, message));
                false
            }
        }
    }

    fn depth_message(&self, what: &str) -> String {
        let mut path = Vec::new();
        let mut cursor = self.frames.len().checked_sub(1);
        while let Some(i) = cursor {
            let frame = &self.frames[i];
            path.push(format!("{}@{}", frame.kind.name(), frame.start));
            cursor = frame.parent;
        }
        path.reverse();
        format!(
            "{what} nesting exceeds {} levels ({})",
            self.ctx.config.max_depth,
            path.join(" > ")
        )
    }

    /// Reports a construct that cannot be laid out and covers it with a zero-height segment.
    fn skip(&mut self, flow: &mut Flow, index: usize, stop: usize, message: String) -> usize {
        self.report(RippleError::structural(index, message));
        if flow.line.started {
            self.close_line(flow, index);
        }
        flow.line.has_controls = true;
        self.close_line(flow, stop);
        stop
    }

    fn open_link(&mut self, flow: &mut Flow, view: &RecordView<'_>, link: &Link) {
        if self.structure.closing_of(view.index).is_none() {
            self.report(RippleError::structural(view.index, "link is not terminated"));
        }
        if flow.link.is_some() {
            self.finish_link(flow);
        }
        flow.link = Some(OpenLink {
            record_index: view.index,
            element_id: view.element_id,
            kind: link.kind,
            target: link.target.clone(),
            start_x: None,
        });
    }

    fn close_link(&mut self, flow: &mut Flow, index: usize) {
        if flow.link.is_none() {
            self.report(RippleError::structural(index, "link end without a link"));
            return;
        }
        self.finish_link(flow);
    }

    fn finish_link(&mut self, flow: &mut Flow) {
        let Some(open) = flow.link.take() else {
            return;
        };
        let Some(x0) = open.start_x else {
            return;
        };
        let x1 = flow.line.x;
        if x1 > x0 {
            flow.line.links.push(PendingLink {
                record_index: open.record_index,
                element_id: open.element_id,
                kind: open.kind,
                target: open.target,
                x0,
                x1,
            });
        }
    }

    fn object(&mut self, flow: &mut Flow, index: usize, id: u32, next: usize) -> usize {
        let objects = self.ctx.objects;
        let Some(entry) = objects.get(id) else {
            self.report(RippleError::Resource(format!(
                "object {id} referenced at {index} is not registered"
            )));
            return next;
        };
        let options = entry.options();
        let content_left = self.line_left(flow);
        let right = self.right_limit(flow);
        let measured = entry
            .object
            .measure(Size::new((right - content_left).max(ZERO), Px::UNBOUNDED));
        let width = measured.width.max(ZERO);
        let height = measured.height.max(ZERO);
        let background = options.contains(LayoutOptions::BACKGROUND);

        if background || options.is_floating() {
            if !flow.area.bounded() {
                let offset = content_left - flow.area.left;
                flow.min_width = flow.min_width.max(offset + width + flow.margins.right);
                flow.widest = flow
                    .widest
                    .max(flow.line.x - flow.area.left + width + flow.margins.right);
                flow.float_bottom = flow.float_bottom.max(flow.line.y + height);
                return next;
            }
            let aligned = match flow.style.align {
                HAlign::Left if background => content_left,
                HAlign::Left => flow.line.x,
                HAlign::Center => content_left + HAlign::Center.offset(right - content_left, width),
                HAlign::Right => right - width,
            };
            let (x, y) = fixed_origin(flow, options, entry.position(), aligned, flow.line.y);
            let rect = Rect::new(x, y, width, height);
            let layer = if background {
                ObjectLayer::Background
            } else if options.contains(LayoutOptions::FOREGROUND) {
                ObjectLayer::Foreground
            } else {
                ObjectLayer::Inline
            };
            self.index.push_object(ObjectPlacement {
                stream_index: index,
                object_id: id,
                rect,
                layer,
            });
            if !background {
                if measured.clip {
                    let line_bottom = flow.line.y + self.band(flow);
                    let clip = extend_clip(rect, options, content_left, right, line_bottom);
                    self.index.push_clip(Clip {
                        rect: clip,
                        stream_index: index,
                        transparent: options.contains(LayoutOptions::FOREGROUND),
                        name: "object",
                    });
                }
                flow.float_bottom = flow.float_bottom.max(rect.bottom());
            }
            return next;
        }

        let x = match self.fit(flow, index, width) {
            Fit::Place(x) | Fit::Overflow(x) => x,
            Fit::Restart(pos) => return pos,
        };
        self.move_to(flow, index, x);
        self.begin(flow);
        let x = flow.line.x;
        if let Some(link) = flow.link.as_mut() {
            if link.start_x.is_none() {
                link.start_x = Some(x);
            }
        }
        let line = &mut flow.line;
        let piece = line.pieces.len().saturating_sub(1);
        line.objects.push(PendingObject {
            stream_index: index,
            object_id: id,
            x,
            width,
            height,
            piece,
        });
        line.x += width;
        line.content_x = line.x;
        line.content_stop = next;
        line.words += 1;
        line.has_objects = true;
        line.ascent = line.ascent.max(height);
        let offset = line.left - flow.area.left;
        flow.min_width = flow.min_width.max(offset + width + flow.margins.right);
        next
    }

    fn paragraph_start(&mut self, flow: &mut Flow, index: usize, para: &ParagraphStart) {
        if flow.line.started {
            self.close_line(flow, index);
        }
        if self.structure.closing_of(index).is_none() {
            self.report(RippleError::structural(index, "paragraph is not terminated"));
        }
        self.push_frame(FrameKind::Paragraph, index);
        self.refresh_line(flow);
        let line_height = self.ctx.metrics.line_height(&flow.style.face);
        let list = if para.list_item {
            flow.lists.last()
        } else {
            None
        };
        let ratio = list.map_or(para.leading, |l| l.vspacing);
        if let Some(end) = flow.last_para_end {
            let target = end + line_height * ratio.max(0.0);
            if flow.line.y < target {
                flow.line.y = target;
            }
        }
        flow.line.x = flow.line.left + para.indent;
        flow.para = Some(Para {
            trim: para.trim,
            spacing: para.spacing,
        });
        if para.list_item {
            self.list_marker(flow, index, para);
        }
    }

    fn list_marker(&mut self, flow: &mut Flow, index: usize, para: &ParagraphStart) {
        let metrics = self.ctx.metrics;
        let face = flow.style.face.clone();
        let left = flow.line.left;
        let Some(list) = flow.lists.last_mut() else {
            return;
        };
        let text = match list.kind {
            ListKind::Bullet => BULLET.to_string(),
            ListKind::Ordered => {
                if let Ok(value) = para.value.trim().parse::<i32>() {
                    list.counter = value;
                }
                let text = format!("{}.", list.counter);
                list.counter = list.counter.saturating_add(1);
                text
            }
            ListKind::Custom if para.value.is_empty() => BULLET.to_string(),
            ListKind::Custom => para.value.clone(),
        };
        let width = metrics.text_width(&face, &text) + metrics.text_width(&face, " ");
        if width > list.item_indent {
            list.widen = list.widen.max(width);
        }
        flow.marker = Some(PendingMarker {
            stream_index: index,
            x: left - list.item_indent,
            text,
            colour: list.colour,
        });
    }

    fn paragraph_end(&mut self, flow: &mut Flow, index: usize, next: usize) {
        if flow.line.started {
            self.close_line(flow, next);
        }
        if let Some(marker) = flow.marker.take() {
            let ascent = self.ctx.metrics.ascent(&flow.style.face);
            self.index.push_marker(Marker {
                stream_index: marker.stream_index,
                x: marker.x,
                baseline: flow.line.y + ascent,
                text: marker.text,
                colour: marker.colour,
            });
        }
        self.pop_frame(FrameKind::Paragraph, index);
        flow.para = None;
        flow.last_para_end = Some(flow.line.y);
    }

    fn advance(&mut self, flow: &mut Flow, index: usize, x: Px, y: Px) {
        if y.is_positive() {
            if flow.line.started {
                self.close_line(flow, index);
            }
            flow.line.y += y;
        }
        if x != ZERO {
            flow.line.x = (flow.line.x + x).max(flow.line.left);
        }
    }

    fn set_margins(&mut self, flow: &mut Flow, index: usize, margins: SetMargins) {
        if flow.line.started {
            self.close_line(flow, index);
        }
        flow.margins.left += margins.left;
        flow.margins.top += margins.top;
        flow.margins.right += margins.right;
        flow.margins.bottom += margins.bottom;
        flow.line.y += margins.top;
        self.refresh_line(flow);
    }

    fn list_start(&mut self, flow: &mut Flow, index: usize, list: &ListStart, next: usize) -> usize {
        if flow.line.started {
            self.close_line(flow, index);
        }
        let Some(end) = self.structure.closing_of(index) else {
            let stop = self.construct_end(index, next);
            return self.skip(flow, index, stop, "list is not terminated".to_string());
        };
        if self.nesting() >= self.ctx.config.max_depth {
            let stop = self.after(end).max(next);
            let message = self.depth_message("list");
            return self.skip(flow, index, stop, message);
        }
        let planned = self.plans.get(&index).and_then(|p| p.item_indent);
        let state = ListState {
            start: index,
            kind: list.kind,
            counter: list.start,
            item_indent: planned.unwrap_or(list.item_indent).max(list.item_indent),
            block_indent: list.block_indent,
            vspacing: list.vspacing,
            colour: list.colour,
            widen: ZERO,
            snapshot: Box::new(flow.clone()),
            mark: self.index.mark(),
            errors: self.errors.len(),
            frames: self.frames.clone(),
        };
        flow.lists.push(state);
        self.push_frame(FrameKind::List, index);
        self.refresh_line(flow);
        next
    }

    fn list_end(&mut self, flow: &mut Flow, index: usize, next: usize) -> usize {
        if flow.line.started {
            self.close_line(flow, index);
        }
        let Some(list) = flow.lists.pop() else {
            self.report(RippleError::structural(index, "list end without a list"));
            return next;
        };
        self.pop_frame(FrameKind::List, index);
        if list.widen > list.item_indent {
            let limit = self.ctx.config.max_repass;
            let plan = self.plans.entry(list.start).or_default();
            if plan.repasses < limit {
                plan.repasses += 1;
                plan.item_indent = Some(list.widen);
                self.metrics.list_repasses += 1;
                self.index.rollback(list.mark);
                self.errors.truncate(list.errors);
                self.frames = list.frames;
                *flow = *list.snapshot;
                return list.start;
            }
        }
        self.refresh_line(flow);
        next
    }

    fn index_start(&mut self, flow: &mut Flow, index: usize, start: IndexStart, next: usize) -> usize {
        let Some(end) = self.structure.closing_of(index) else {
            let stop = self.construct_end(index, next);
            return self.skip(flow, index, stop, "index is not terminated".to_string());
        };
        if start.visible {
            self.push_frame(FrameKind::Index, index);
            return next;
        }
        let stop = self.after(end).max(next);
        if !flow.line.started {
            self.close_line(flow, stop);
        }
        stop
    }

    // ---- tables ------------------------------------------------------------------------------

    fn table(&mut self, flow: &mut Flow, index: usize, table: &TableStart, next: usize) -> usize {
        if flow.line.started {
            self.close_line(flow, index);
        }
        let Some(end) = self.structure.closing_of(index) else {
            let stop = self.construct_end(index, next);
            return self.skip(flow, index, stop, "table is not terminated".to_string());
        };
        let after = self.after(end).max(next);
        if self.nesting() >= self.ctx.config.max_depth {
            let message = self.depth_message("table");
            return self.skip(flow, index, after, message);
        }
        let rows = self.collect_rows(next, end);
        let frames = self.frames.len();
        self.push_frame(FrameKind::Table, index);
        let left = self.line_left(flow);
        let geometry = TableGeometry {
            index,
            body: next,
            after,
            covered_from: flow.line.start,
            left,
            width: (self.right_limit(flow) - left).max(ZERO),
            top: flow.line.y,
            edit: flow.area.edit,
        };
        let placed = self.place_table(table, &rows, &geometry, &mut flow.style);
        self.frames.truncate(frames);

        let offset = left - flow.area.left;
        flow.widest = flow.widest.max(offset + placed.width + flow.margins.right);
        flow.min_width = flow
            .min_width
            .max(offset + placed.min_width + flow.margins.right);
        flow.line = Line::new(after, geometry.top + placed.height, left);
        flow.last_para_end = Some(flow.line.y);
        after
    }

    /// Past a record and, for start records, past its matching end.
    fn step_over(&self, view: &RecordView<'_>) -> usize {
        if view.kind.closing().is_some() {
            if let Some(end) = self.structure.closing_of(view.index) {
                return self.after(end).max(view.end());
            }
        }
        view.end()
    }

    fn collect_rows(&mut self, body: usize, end: usize) -> Vec<RowSpec> {
        let stream = self.ctx.stream;
        let mut rows = Vec::new();
        let mut pos = body;
        while pos < end {
            let view = match stream.units(pos, end).next() {
                Some(Ok(Unit::Record(view))) => view,
                Some(Ok(unit)) => {
                    pos = unit.end();
                    continue;
                }
                _ => break,
            };
            if view.kind != RecordKind::Row {
                pos = self.step_over(&view);
                continue;
            }
            let record = match view.record() {
                Ok(Record::Row(row)) => row,
                Ok(_) => Row::default(),
                Err(err) => {
                    self.report(err);
                    pos = view.end();
                    continue;
                }
            };
            match self.structure.closing_of(view.index) {
                Some(row_end) => {
                    let cells = self.collect_cells(view.end(), row_end);
                    rows.push(RowSpec {
                        index: view.index,
                        record,
                        cells,
                    });
                    pos = self.after(row_end).max(view.end());
                }
                None => {
                    self.report(RippleError::structural(view.index, "row is not terminated"));
                    pos = self
                        .structure
                        .cut_of(view.index)
                        .unwrap_or(end)
                        .max(view.end());
                }
            }
        }
        rows
    }

    fn collect_cells(&mut self, start: usize, end: usize) -> Vec<CellSpec> {
        let stream = self.ctx.stream;
        let mut cells = Vec::new();
        let mut pos = start;
        while pos < end {
            let view = match stream.units(pos, end).next() {
                Some(Ok(Unit::Record(view))) => view,
                Some(Ok(unit)) => {
                    pos = unit.end();
                    continue;
                }
                _ => break,
            };
            if view.kind != RecordKind::Cell {
                pos = self.step_over(&view);
                continue;
            }
            let record = match view.record() {
                Ok(Record::Cell(cell)) => cell,
                Ok(_) => Cell::default(),
                Err(err) => {
                    self.report(err);
                    pos = view.end();
                    continue;
                }
            };
            match self.structure.closing_of(view.index) {
                Some(cell_end) => {
                    cells.push(CellSpec {
                        index: view.index,
                        element_id: view.element_id,
                        record,
                        content_start: view.end(),
                        content_end: cell_end,
                    });
                    pos = self.after(cell_end).max(view.end());
                }
                None => {
                    self.report(RippleError::structural(view.index, "cell is not terminated"));
                    pos = self
                        .structure
                        .cut_of(view.index)
                        .unwrap_or(end)
                        .max(view.end());
                }
            }
        }
        cells
    }

    fn place_table(
        &mut self,
        table: &TableStart,
        rows: &[RowSpec],
        geometry: &TableGeometry,
        style: &mut TextStyle,
    ) -> PlacedTable {
        let spans = rows
            .iter()
            .map(|r| r.cells.iter().map(CellSpec::span).sum::<usize>())
            .max()
            .unwrap_or(0);
        let ncols = spans.max(table.columns.len());
        let bounded = geometry.width < Px::UNBOUNDED;
        let overhead = table::overhead(ncols, table.hspacing, table.thickness);
        let resolve = |length: Length| match length {
            Length::Percent(_) if !bounded => None,
            other => other.resolve(geometry.width),
        };

        let start_style = style.clone();
        let mut requests =
            self.measure_columns(table, rows, ncols, geometry.body, &start_style, geometry.edit);
        for (i, request) in requests.iter_mut().enumerate() {
            request.preset = table.columns.get(i).copied().and_then(resolve);
        }
        let explicit = resolve(table.width).map(|width| {
            let width = if bounded {
                width.min(geometry.width)
            } else {
                width
            };
            (width - overhead).max(ZERO)
        });
        let available = if bounded {
            (geometry.width - overhead).max(ZERO)
        } else {
            Px::UNBOUNDED
        };

        let mut repasses = 0;
        loop {
            let widths = table::negotiate(&requests, available, explicit);
            let width = overhead + widths.iter().sum::<Px>();
            let left = if bounded {
                geometry.left + table.align.offset(geometry.width, width)
            } else {
                geometry.left
            };
            let mark = self.index.mark();
            let errors = self.errors.len();
            *style = start_style.clone();
            self.metrics.table_passes += 1;
            let pass = self.table_pass(table, rows, &widths, left, width, geometry, style);
            if !pass.grow.is_empty() && repasses < self.ctx.config.max_repass {
                for (col, needed) in pass.grow {
                    if let Some(request) = requests.get_mut(col) {
                        request.min = request.min.max(needed);
                        request.max = request.max.max(needed);
                    }
                }
                self.index.rollback(mark);
                self.errors.truncate(errors);
                repasses += 1;
                self.metrics.table_repasses += 1;
                continue;
            }

            self.index.push_clip(Clip {
                rect: Rect::new(left, geometry.top, width, pass.height),
                stream_index: geometry.index,
                transparent: false,
                name: "table",
            });
            if self.measuring == 0 {
                if let Some(debug) = self.ctx.debug {
                    debug.event(
                        "layout.table_pass",
                        json!({
                            "index": geometry.index,
                            "columns": widths.iter().map(|w| w.to_f32()).collect::<Vec<_>>(),
                            "width": width.to_f32(),
                            "height": pass.height.to_f32(),
                            "repasses": repasses,
                        }),
                    );
                }
            }
            let min_width = overhead + requests.iter().map(|r| r.min).sum::<Px>();
            return PlacedTable {
                width,
                height: pass.height,
                min_width,
            };
        }
    }

    fn measure_columns(
        &mut self,
        table: &TableStart,
        rows: &[RowSpec],
        ncols: usize,
        body: usize,
        style: &TextStyle,
        edit: bool,
    ) -> Vec<ColumnRequest> {
        let stream = self.ctx.stream;
        let pad = table.padding * 2;
        let mut requests = vec![ColumnRequest::default(); ncols];
        let mut spanning = Vec::new();
        let mut style = style.clone();
        let mut cursor = body;
        for row in rows {
            let mut col = 0;
            for cell in &row.cells {
                style = replay(stream, cursor, cell.content_start, &style);
                let (extent, after) = self.measure_cell(cell, &style, Px::UNBOUNDED, edit);
                style = after;
                cursor = cell.content_end;
                let min = extent.min_width + pad;
                let max = extent.widest.max(extent.min_width) + pad;
                let span = cell.span();
                if span == 1 {
                    if let Some(request) = requests.get_mut(col) {
                        request.min = request.min.max(min);
                        request.max = request.max.max(max);
                    }
                } else {
                    spanning.push((col, span, min, max));
                }
                col += span;
            }
        }
        for (col, span, min, max) in spanning {
            let end = (col + span).min(ncols);
            if col >= end {
                continue;
            }
            let n = (end - col) as i32;
            let inner = table.hspacing * (n - 1);
            let have_min = requests[col..end].iter().map(|r| r.min).sum::<Px>() + inner;
            if min > have_min {
                let extra = (min - have_min) / n;
                for request in &mut requests[col..end] {
                    request.min += extra;
                }
            }
            let have_max = requests[col..end].iter().map(|r| r.max).sum::<Px>() + inner;
            if max > have_max {
                let extra = (max - have_max) / n;
                for request in &mut requests[col..end] {
                    request.max += extra;
                }
            }
        }
        for request in &mut requests {
            request.max = request.max.max(request.min);
        }
        requests
    }

    /// Lays a cell out within `ceiling` and discards the result, keeping only its extent.
    fn measure_cell(
        &mut self,
        cell: &CellSpec,
        style: &TextStyle,
        ceiling: Px,
        edit: bool,
    ) -> (FlowExtent, TextStyle) {
        let key = MeasureKey {
            content_start: cell.content_start,
            ceiling,
            edit,
        };
        if let Some((start, extent, after)) = self.measured.get(&key) {
            if start == style {
                self.metrics.measure_cache_hits += 1;
                return (*extent, after.clone());
            }
        }
        self.metrics.measured_cells += 1;
        let mark = self.index.mark();
        let errors = self.errors.len();
        let frames = self.frames.clone();
        self.measuring += 1;
        let area = Area {
            left: ZERO,
            width: ceiling,
            top: ZERO,
            clip_floor: self.index.clips().len(),
            edit,
            top_level: false,
        };
        let mut flow = Flow::new(area, SetMargins::default(), style.clone(), cell.content_start);
        let extent = self.flow(&mut flow, cell.content_start, cell.content_end);
        self.measuring -= 1;
        self.index.rollback(mark);
        self.errors.truncate(errors);
        self.frames = frames;
        self.measured
            .insert(key, (style.clone(), extent, flow.style.clone()));
        (extent, flow.style)
    }

    #[allow(clippy::too_many_arguments)]
    fn table_pass(
        &mut self,
        table: &TableStart,
        rows: &[RowSpec],
        widths: &[Px],
        left: Px,
        width: Px,
        geometry: &TableGeometry,
        style: &mut TextStyle,
    ) -> TablePass {
        let stream = self.ctx.stream;
        let pad = table.padding * 2;
        let depth = self.table_depth();
        let table_box = self.index.boxes().len();
        self.index.push_box(BoxPlacement {
            kind: BoxKind::Table,
            stream_index: geometry.index,
            rect: Rect::new(left, geometry.top, width, ZERO),
            fill: table.colour,
            border: table.border,
            thickness: table.thickness,
            highlight: table.highlight,
            shadow: table.shadow,
        });
        let inner_left = left + table.thickness;
        let inner_width = (width - table.thickness * 2).max(ZERO);
        let mut covered = geometry.covered_from;
        let mut cursor = geometry.body;
        let mut y = geometry.top + table.thickness + table.vspacing;
        let mut grow = Vec::new();

        for row in rows {
            let mark = self.index.mark();
            let errors = self.errors.len();
            let saved = (style.clone(), covered, cursor);
            let mut offsets = vec![ZERO; row.cells.len()];
            let mut shifted = false;
            let row_height = loop {
                let row_box = self.index.boxes().len();
                self.index.push_box(BoxPlacement {
                    kind: BoxKind::Row,
                    stream_index: row.index,
                    rect: Rect::new(inner_left, y, inner_width, ZERO),
                    fill: row.record.colour,
                    border: None,
                    thickness: ZERO,
                    highlight: row.record.highlight,
                    shadow: row.record.shadow,
                });
                let mut x = inner_left + table.hspacing;
                let mut col = 0;
                let mut placed = Vec::with_capacity(row.cells.len());
                for (i, cell) in row.cells.iter().enumerate() {
                    let span = cell.span();
                    let end = (col + span).min(widths.len());
                    let first = col.min(end);
                    let joined = (end - first).max(1) as i32 - 1;
                    let cell_width =
                        widths[first..end].iter().sum::<Px>() + table.hspacing * joined;
                    *style = replay(stream, cursor, cell.content_start, style);
                    self.cover(covered, cell.content_start, x, y, depth, geometry.edit);
                    let cell_box = self.index.boxes().len();
                    self.index.push_box(BoxPlacement {
                        kind: BoxKind::Cell,
                        stream_index: cell.index,
                        rect: Rect::new(x, y, cell_width, ZERO),
                        fill: cell.record.colour,
                        border: cell.record.border,
                        thickness: if cell.record.border.is_some() {
                            Px::from_i32(1)
                        } else {
                            ZERO
                        },
                        highlight: None,
                        shadow: None,
                    });
                    let content_width = (cell_width - pad).max(ZERO);
                    let area = Area {
                        left: x + table.padding,
                        width: content_width,
                        top: y + table.padding + offsets[i],
                        clip_floor: self.index.clips().len(),
                        edit: geometry.edit || !cell.record.edit.is_empty(),
                        top_level: false,
                    };
                    let mut flow =
                        Flow::new(area, SetMargins::default(), style.clone(), cell.content_start);
                    let extent = self.flow(&mut flow, cell.content_start, cell.content_end);
                    *style = flow.style;
                    let needed = extent.widest.max(extent.min_width);
                    if span == 1 && needed > content_width {
                        grow.push((col, needed + pad));
                    }
                    placed.push((cell_box, x, cell_width, extent.height));
                    covered = cell.content_end;
                    cursor = cell.content_end;
                    x += cell_width + table.hspacing;
                    col += span;
                }

                let content = placed
                    .iter()
                    .map(|p| p.3 + pad)
                    .fold(ZERO, Px::max);
                let row_height = row.record.min_height.max(content);
                let shifts: Vec<Px> = row
                    .cells
                    .iter()
                    .zip(&placed)
                    .map(|(cell, p)| cell.record.valign.offset(row_height - pad, p.3))
                    .collect();
                if !shifted && shifts.iter().any(|s| s.is_positive()) {
                    shifted = true;
                    offsets = shifts;
                    self.index.rollback(mark);
                    self.errors.truncate(errors);
                    (*style, covered, cursor) = saved.clone();
                    self.metrics.row_repasses += 1;
                    continue;
                }
                for (cell, (cell_box, x, cell_width, _)) in row.cells.iter().zip(&placed) {
                    if let Some(placement) = self.index.box_mut(*cell_box) {
                        placement.rect.height = row_height;
                    }
                    if !cell.record.edit.is_empty() {
                        self.edit_region(cell, Rect::new(*x, y, *cell_width, row_height));
                    }
                }
                if let Some(placement) = self.index.box_mut(row_box) {
                    placement.rect.height = row_height;
                }
                break row_height;
            };
            y += row_height + table.vspacing;
        }

        *style = replay(stream, cursor, geometry.after, style);
        self.cover(covered, geometry.after, left, y, depth, geometry.edit);
        let height = (y - geometry.top + table.thickness).max(table.min_height);
        if let Some(placement) = self.index.box_mut(table_box) {
            placement.rect.height = height;
        }
        TablePass { height, grow }
    }

    /// Zero-height segment over records between cells so the stream stays fully covered.
    fn cover(&mut self, from: usize, to: usize, x: Px, y: Px, depth: u8, edit: bool) {
        if to <= from {
            return;
        }
        self.index.push_segment(Segment {
            stream_start: from,
            stream_stop: to,
            trim_stop: to,
            x,
            y,
            width: ZERO,
            align_width: ZERO,
            height: ZERO,
            baseline: ZERO,
            depth,
            flags: SegmentFlags {
                edit,
                has_controls: true,
                mergeable: true,
                ..SegmentFlags::default()
            },
        });
    }

    fn edit_region(&mut self, cell: &CellSpec, rect: Rect) {
        let edits = self.ctx.edits;
        let hash = records::name_hash(&cell.record.edit);
        let def = edits.get(&hash);
        if def.is_none() && self.measuring == 0 {
            log::warn!(
                "cell at {} references unknown edit definition '{}'",
                cell.index,
                cell.record.edit
            );
        }
        let segment = self.index.find_segment(cell.content_start).unwrap_or(0);
        self.index.push_edit(EditRegion {
            record_index: cell.index,
            element_id: cell.element_id,
            rect,
            segment,
            name: def.map_or_else(|| cell.record.edit.clone(), |d| d.name.clone()),
            name_hash: hash,
            max_chars: def.and_then(|d| d.max_chars),
            line_breaks: def.is_some_and(|d| d.line_breaks),
            on_enter: def.and_then(|d| d.on_enter.clone()),
            on_exit: def.and_then(|d| d.on_exit.clone()),
            on_change: def.and_then(|d| d.on_change.clone()),
            content_start: cell.content_start,
            content_end: cell.content_end,
        });
    }
}

/// Position of a floating object after applying its fixed-placement options. Fixed coordinates
/// are relative to the container origin.
fn fixed_origin(
    flow: &Flow,
    options: LayoutOptions,
    position: Option<(Px, Px)>,
    x: Px,
    y: Px,
) -> (Px, Px) {
    let (fx, fy) = position.unwrap_or((ZERO, ZERO));
    let (ox, oy) = (flow.area.left, flow.area.top);
    if options.contains(LayoutOptions::FIXED) {
        (ox + fx, oy + fy)
    } else if options.contains(LayoutOptions::HFIXED) {
        (ox + fx, y)
    } else if options.contains(LayoutOptions::VFIXED) {
        (x, oy + fy)
    } else {
        (x, y)
    }
}

fn extend_clip(rect: Rect, options: LayoutOptions, left: Px, right: Px, line_bottom: Px) -> Rect {
    let mut clip = rect;
    if options.contains(LayoutOptions::WIDE) {
        clip.x = left;
        clip.width = (right - left).max(rect.width);
    }
    if options.contains(LayoutOptions::LEFT) {
        clip.width = (clip.right() - left).max(ZERO);
        clip.x = left;
    }
    if options.contains(LayoutOptions::RIGHT) {
        clip.width = (right - clip.x).max(clip.width);
    }
    if options.contains(LayoutOptions::BOTTOM) {
        clip.height = clip.height.max(line_bottom - clip.y);
    }
    clip
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::font::FontFace;
    use crate::font::testing::TableMetrics;
    use crate::object::ObjectEntry;
    use crate::object::testing::BoxObject;
    use crate::records::FontStyle;
    use crate::types::VAlign;

    fn px(v: i32) -> Px {
        Px::from_i32(v)
    }

    struct Fixture {
        stream: Stream,
        objects: ObjectTable,
        edits: HashMap<u32, EditDef>,
        config: LayoutConfig,
        metrics: TableMetrics,
    }

    impl Fixture {
        fn new(width: i32) -> Self {
            let style = TextStyle::new(
                FontFace::new("Sans", px(14), 0),
                Color::BLACK,
                Color::rgb(0.0, 0.0, 1.0),
            );
            Self {
                stream: Stream::new(),
                objects: ObjectTable::new(),
                edits: HashMap::new(),
                config: LayoutConfig::new(px(width), style),
                metrics: TableMetrics::new(5, 10),
            }
        }

        fn text(&mut self, text: &str) -> usize {
            let at = self.stream.len();
            self.stream.push_text(text).unwrap();
            at
        }

        fn rec(&mut self, record: Record) -> usize {
            let at = self.stream.len();
            self.stream.push_record(&record).unwrap();
            at
        }

        fn object(&mut self, object: BoxObject) -> u32 {
            let id = self
                .objects
                .insert(ObjectEntry {
                    object: Arc::new(object),
                    options: None,
                    position: None,
                })
                .unwrap();
            self.rec(Record::Object(id));
            id
        }

        fn para(&mut self, text: &str) -> usize {
            self.rec(Record::ParagraphStart(ParagraphStart::default()));
            let at = self.text(text);
            self.rec(Record::ParagraphEnd);
            at
        }

        fn ctx(&self) -> LayoutContext<'_> {
            LayoutContext::new(
                &self.stream,
                &self.metrics,
                &self.objects,
                &self.edits,
                &self.config,
            )
        }

        fn layout(&self) -> Layout {
            Layout::run(&self.ctx())
        }

        fn row(&mut self, cells: &[&str]) {
            self.rec(Record::Row(Row::default()));
            for text in cells {
                self.rec(Record::Cell(Cell::default()));
                self.text(text);
                self.rec(Record::CellEnd);
            }
            self.rec(Record::RowEnd);
        }
    }

    fn assert_partition(layout: &Layout, len: usize) {
        let mut pos = 0;
        for segment in layout.index().segments() {
            assert_eq!(segment.stream_start, pos, "gap or overlap at {pos}");
            assert!(segment.stream_stop >= segment.stream_start);
            pos = segment.stream_stop;
        }
        assert_eq!(pos, len);
    }

    fn text_segments(layout: &Layout) -> Vec<&Segment> {
        layout
            .index()
            .segments()
            .iter()
            .filter(|s| s.flags.has_text)
            .collect()
    }

    #[test]
    fn word_wraps_at_whitespace() {
        let mut f = Fixture::new(40);
        f.metrics = TableMetrics::new(5, 10).with_word("Hello", 38);
        f.text("Hello World");
        let layout = f.layout();
        let segments = layout.index().segments();
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].stream_start, segments[0].stream_stop), (0, 6));
        assert_eq!(segments[0].trim_stop, 5);
        assert_eq!(segments[0].width, px(40));
        assert_eq!(segments[0].align_width, px(38));
        assert_eq!((segments[1].stream_start, segments[1].stream_stop), (6, 11));
        assert_eq!(segments[1].y, px(10));
        assert!(layout.errors().is_empty());
    }

    #[test]
    fn lines_never_exceed_the_page() {
        let mut f = Fixture::new(60);
        f.text("the quick brown fox jumps over the lazy dog");
        let layout = f.layout();
        assert_partition(&layout, f.stream.len());
        let segments = layout.index().segments();
        assert_eq!(segments.len(), 4);
        for segment in segments {
            assert!(segment.x + segment.width <= px(60));
        }
        assert_eq!(segments[3].y, px(30));
        assert_eq!(layout.height(), px(40));
    }

    #[test]
    fn long_token_is_split_mid_word() {
        let mut f = Fixture::new(23);
        f.text("abcdefghij");
        let layout = f.layout();
        let bounds: Vec<(usize, usize)> = layout
            .index()
            .segments()
            .iter()
            .map(|s| (s.stream_start, s.stream_stop))
            .collect();
        assert_eq!(bounds, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn newline_forces_a_break() {
        let mut f = Fixture::new(200);
        f.text("one\ntwo");
        let layout = f.layout();
        let segments = text_segments(&layout);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].stream_start, 4);
        assert_eq!(segments[1].y, px(10));
    }

    #[test]
    fn paragraphs_are_separated_by_leading() {
        let mut f = Fixture::new(200);
        f.para("one");
        f.para("two");
        let layout = f.layout();
        let segments = text_segments(&layout);
        assert_eq!(segments[0].y, ZERO);
        assert_eq!(segments[1].y, px(20));
        assert_partition(&layout, f.stream.len());
        assert_eq!(layout.checkpoint_count(), 2);
    }

    #[test]
    fn style_seeds_come_from_the_nearest_checkpoint() {
        let mut f = Fixture::new(200);
        f.para("one");
        let red = Color::rgb(1.0, 0.0, 0.0);
        f.rec(Record::FontColour(red));
        f.para("two");
        let late = f.para("three");
        let layout = f.layout();
        let base = f.config.base_style.clone();
        assert!(layout.style_seed(0).is_some_and(|(pos, _)| pos == 0));
        let (pos, seeded) = layout.style_seed(late).unwrap();
        assert!(pos > 0 && pos <= late);
        assert_eq!(seeded.colour, red);
        assert_eq!(
            replay(&f.stream, pos, late, seeded),
            replay(&f.stream, 0, late, &base)
        );
    }

    #[test]
    fn centred_line_is_offset() {
        let mut f = Fixture::new(100);
        f.rec(Record::FontStyle(FontStyle {
            face: "Sans".to_string(),
            size: px(14),
            flags: 0,
            align: HAlign::Center,
        }));
        f.text("abcd");
        let layout = f.layout();
        let segment = text_segments(&layout)[0];
        assert_eq!(segment.x, px(40));
        assert_eq!(layout.index().runs()[0].x, px(40));
    }

    #[test]
    fn tab_advances_to_next_stop() {
        let mut f = Fixture::new(200);
        f.rec(Record::TabDef(vec![px(30), px(90)]));
        f.text("a\tb\tc");
        let layout = f.layout();
        let xs: Vec<Px> = layout.index().runs().iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![ZERO, px(30), px(90)]);
    }

    #[test]
    fn margins_shift_the_text() {
        let mut f = Fixture::new(100);
        f.rec(Record::SetMargins(SetMargins {
            left: px(10),
            top: px(5),
            right: ZERO,
            bottom: ZERO,
        }));
        f.text("x");
        let layout = f.layout();
        let segment = text_segments(&layout)[0];
        assert_eq!((segment.x, segment.y), (px(10), px(5)));
    }

    #[test]
    fn cell_measurements_are_cached_per_width_ceiling() {
        let mut f = Fixture::new(200);
        f.text("aaa bbb ccc");
        let ctx = f.ctx();
        let mut engine = Engine::new(&ctx, Layout::default());
        let cell = CellSpec {
            index: 0,
            element_id: 0,
            record: Cell::default(),
            content_start: 0,
            content_end: f.stream.len(),
        };
        let style = f.config.base_style.clone();
        let (wide, _) = engine.measure_cell(&cell, &style, Px::UNBOUNDED, false);
        let (narrow, _) = engine.measure_cell(&cell, &style, px(30), false);
        assert_eq!(wide.height, px(10));
        assert_eq!(narrow.height, px(30));
        let (again, _) = engine.measure_cell(&cell, &style, px(30), false);
        assert_eq!(again.height, px(30));
        assert_eq!(engine.metrics.measured_cells, 2);
        assert_eq!(engine.metrics.measure_cache_hits, 1);
    }

    #[test]
    fn table_columns_fit_their_content() {
        let mut f = Fixture::new(200);
        f.metrics = TableMetrics::new(5, 10)
            .with_word("A", 10)
            .with_word("Averylongword", 120);
        f.rec(Record::TableStart(TableStart::default()));
        f.row(&["A", "Averylongword"]);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let boxes = layout.index().boxes();
        let cells: Vec<Px> = boxes
            .iter()
            .filter(|b| b.kind == BoxKind::Cell)
            .map(|b| b.rect.width)
            .collect();
        assert_eq!(cells, vec![px(14), px(124)]);
        let table = boxes.iter().find(|b| b.kind == BoxKind::Table).unwrap();
        assert_eq!(table.rect.width, px(138));
        assert_eq!(table.rect.height, px(14));
        assert_partition(&layout, f.stream.len());
        assert!(text_segments(&layout).iter().all(|s| s.depth == 1));
        assert_eq!(layout.index().clips().len(), 1);
    }

    #[test]
    fn table_width_adds_spacing_and_borders() {
        let mut f = Fixture::new(300);
        f.rec(Record::TableStart(TableStart {
            hspacing: px(3),
            thickness: px(1),
            ..TableStart::default()
        }));
        f.row(&["aa", "bbbb", "c"]);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let boxes = layout.index().boxes();
        let cells: Px = boxes
            .iter()
            .filter(|b| b.kind == BoxKind::Cell)
            .map(|b| b.rect.width)
            .sum();
        let table = boxes.iter().find(|b| b.kind == BoxKind::Table).unwrap();
        assert_eq!(table.rect.width, cells + px(3) * 4 + px(2));
        assert!(table.rect.width <= px(300));
    }

    #[test]
    fn explicit_table_width_is_filled() {
        let mut f = Fixture::new(300);
        f.rec(Record::TableStart(TableStart {
            columns: vec![Length::Px(px(50)), Length::Auto],
            width: Length::Percent(100.0),
            ..TableStart::default()
        }));
        f.row(&["a", "b"]);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let cells: Vec<Px> = layout
            .index()
            .boxes()
            .iter()
            .filter(|b| b.kind == BoxKind::Cell)
            .map(|b| b.rect.width)
            .collect();
        assert_eq!(cells, vec![px(50), px(250)]);
    }

    #[test]
    fn narrow_page_wraps_cell_text() {
        let mut f = Fixture::new(60);
        f.rec(Record::TableStart(TableStart::default()));
        f.row(&["aaa bbb ccc ddd", "x"]);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let table = layout
            .index()
            .boxes()
            .iter()
            .find(|b| b.kind == BoxKind::Table)
            .unwrap();
        assert!(table.rect.width <= px(60));
        assert!(table.rect.height > px(14));
        for segment in text_segments(&layout) {
            assert!(segment.x + segment.width <= px(60));
        }
    }

    #[test]
    fn unterminated_table_is_reported_and_covered() {
        let mut f = Fixture::new(200);
        f.text("before ");
        let table = f.rec(Record::TableStart(TableStart::default()));
        f.rec(Record::Row(Row::default()));
        f.rec(Record::Cell(Cell::default()));
        f.text("inside");
        let layout = f.layout();
        assert_eq!(layout.errors().len(), 1);
        assert!(matches!(
            layout.errors()[0],
            RippleError::Structural { index, .. } if index == table
        ));
        assert_partition(&layout, f.stream.len());
        let segments = layout.index().segments();
        assert!(segments[0].flags.has_text);
        assert!(segments[1..].iter().all(|s| s.height == ZERO));
    }

    #[test]
    fn hidden_index_takes_no_space() {
        let mut f = Fixture::new(200);
        f.para("shown");
        f.rec(Record::IndexStart(IndexStart {
            name_hash: records::name_hash("notes"),
            id: 1,
            visible: false,
        }));
        let hidden = f.para("hidden");
        f.rec(Record::IndexEnd { id: 1 });
        let after = f.para("after");
        let layout = f.layout();
        assert_partition(&layout, f.stream.len());
        let index = layout.index();
        let segment = index.find_segment(hidden).unwrap();
        assert_eq!(index.segments()[segment].height, ZERO);
        assert!(!index.y_order().contains(&segment));
        let after = index.find_segment(after).unwrap();
        assert_eq!(index.segments()[after].y, px(20));
        assert!(layout.errors().is_empty());
    }

    #[test]
    fn layout_is_deterministic() {
        let mut f = Fixture::new(120);
        f.para("some words that wrap around the page");
        f.rec(Record::TableStart(TableStart::default()));
        f.row(&["one two", "three"]);
        f.row(&["four", "five six seven"]);
        f.rec(Record::TableEnd);
        let first = f.layout();
        let second = f.layout();
        assert_eq!(first.index().segments(), second.index().segments());
        assert_eq!(first.index().runs(), second.index().runs());
        assert_eq!(first.index().boxes(), second.index().boxes());
        assert_eq!(first.height(), second.height());
    }

    #[test]
    fn resumed_layout_matches_full_layout() {
        let mut f = Fixture::new(100);
        f.para("first paragraph of text");
        let second = f.para("second paragraph");
        f.rec(Record::TableStart(TableStart::default()));
        f.row(&["cell", "another cell"]);
        f.rec(Record::TableEnd);
        f.para("closing words");
        let mut layout = f.layout();
        f.stream.insert_text(second + 7, "edited ").unwrap();
        layout.relayout_from(&f.ctx(), second + 7);
        let full = f.layout();
        assert_eq!(layout.metrics().resumed_passes, 1);
        assert_eq!(layout.index().segments(), full.index().segments());
        assert_eq!(layout.index().runs(), full.index().runs());
        assert_eq!(layout.index().boxes(), full.index().boxes());
        assert_eq!(layout.index().y_order(), full.index().y_order());
        assert_eq!(layout.height(), full.height());
        assert_partition(&layout, f.stream.len());
    }

    #[test]
    fn ordered_list_numbers_items() {
        let mut f = Fixture::new(200);
        f.rec(Record::ListStart(ListStart {
            kind: ListKind::Ordered,
            start: 1,
            item_indent: px(15),
            block_indent: px(10),
            vspacing: 0.0,
            colour: None,
        }));
        for text in ["a", "b"] {
            f.rec(Record::ParagraphStart(ParagraphStart {
                list_item: true,
                ..ParagraphStart::default()
            }));
            f.text(text);
            f.rec(Record::ParagraphEnd);
        }
        f.rec(Record::ListEnd);
        let layout = f.layout();
        let markers: Vec<(&str, Px)> = layout
            .index()
            .markers()
            .iter()
            .map(|m| (m.text.as_str(), m.x))
            .collect();
        assert_eq!(markers, vec![("1.", px(10)), ("2.", px(10))]);
        let segments = text_segments(&layout);
        assert_eq!(segments[0].x, px(25));
        assert_eq!(segments[1].y, px(10));
        assert_eq!(layout.metrics().list_repasses, 0);
    }

    #[test]
    fn wide_marker_widens_the_list() {
        let mut f = Fixture::new(200);
        f.rec(Record::ListStart(ListStart {
            kind: ListKind::Custom,
            start: 1,
            item_indent: px(15),
            block_indent: ZERO,
            vspacing: 0.0,
            colour: None,
        }));
        f.rec(Record::ParagraphStart(ParagraphStart {
            list_item: true,
            value: "Step".to_string(),
            ..ParagraphStart::default()
        }));
        f.text("go");
        f.rec(Record::ParagraphEnd);
        f.rec(Record::ListEnd);
        let layout = f.layout();
        assert_eq!(layout.metrics().list_repasses, 1);
        assert_eq!(layout.index().markers().len(), 1);
        assert_eq!(layout.index().markers()[0].x, ZERO);
        assert_eq!(text_segments(&layout)[0].x, px(25));
        assert_partition(&layout, f.stream.len());
    }

    #[test]
    fn square_float_pushes_text_aside() {
        let mut f = Fixture::new(200);
        f.object(BoxObject::new(20, 20, LayoutOptions::SQUARE));
        f.text("ab cd");
        let layout = f.layout();
        let index = layout.index();
        assert_eq!(index.objects()[0].rect, Rect::new(ZERO, ZERO, px(20), px(20)));
        assert_eq!(index.clips().len(), 1);
        assert_eq!(index.runs()[0].x, px(20));
    }

    #[test]
    fn background_object_reserves_nothing() {
        let mut f = Fixture::new(200);
        f.object(BoxObject::new(50, 50, LayoutOptions::BACKGROUND));
        f.text("ab");
        let layout = f.layout();
        let index = layout.index();
        assert!(index.clips().is_empty());
        assert_eq!(index.objects()[0].layer, ObjectLayer::Background);
        assert_eq!(index.runs()[0].x, ZERO);
    }

    #[test]
    fn inline_object_raises_the_line() {
        let mut f = Fixture::new(200);
        f.text("a");
        f.object(BoxObject::new(10, 30, LayoutOptions::NONE));
        f.text("b");
        let layout = f.layout();
        let index = layout.index();
        assert_eq!(index.segments()[0].height, px(32));
        assert_eq!(index.objects()[0].rect, Rect::new(px(5), ZERO, px(10), px(30)));
        assert_eq!(index.runs()[1].x, px(15));
    }

    #[test]
    fn missing_object_is_a_resource_error() {
        let mut f = Fixture::new(200);
        f.rec(Record::Object(7));
        f.text("x");
        let layout = f.layout();
        assert!(matches!(layout.errors()[0], RippleError::Resource(_)));
        assert_partition(&layout, f.stream.len());
    }

    #[test]
    fn nesting_beyond_limit_is_rejected() {
        let mut f = Fixture::new(200);
        f.config.max_depth = 1;
        f.rec(Record::TableStart(TableStart::default()));
        f.rec(Record::Row(Row::default()));
        f.rec(Record::Cell(Cell::default()));
        f.rec(Record::TableStart(TableStart::default()));
        f.row(&["deep"]);
        f.rec(Record::TableEnd);
        f.rec(Record::CellEnd);
        f.rec(Record::RowEnd);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        assert_eq!(layout.errors().len(), 1);
        assert!(layout.errors()[0].to_string().contains("nesting"));
        assert_partition(&layout, f.stream.len());
    }

    #[test]
    fn bottom_aligned_cell_is_shifted_down() {
        let mut f = Fixture::new(200);
        f.rec(Record::TableStart(TableStart {
            padding: ZERO,
            ..TableStart::default()
        }));
        f.rec(Record::Row(Row::default()));
        f.rec(Record::Cell(Cell::default()));
        f.text("a\nb");
        f.rec(Record::CellEnd);
        f.rec(Record::Cell(Cell {
            valign: VAlign::Bottom,
            ..Cell::default()
        }));
        let low = f.text("c");
        f.rec(Record::CellEnd);
        f.rec(Record::RowEnd);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let index = layout.index();
        let segment = index.find_segment(low).unwrap();
        assert_eq!(index.segments()[segment].y, px(10));
        assert_eq!(layout.metrics().row_repasses, 1);
    }

    #[test]
    fn editable_cell_gets_an_edit_region() {
        let mut f = Fixture::new(200);
        f.edits.insert(
            records::name_hash("name"),
            EditDef {
                name: "name".to_string(),
                max_chars: Some(5),
                ..EditDef::default()
            },
        );
        f.rec(Record::TableStart(TableStart::default()));
        f.rec(Record::Row(Row::default()));
        f.rec(Record::Cell(Cell {
            edit: "name".to_string(),
            ..Cell::default()
        }));
        let content = f.text("Ann");
        f.rec(Record::CellEnd);
        f.rec(Record::RowEnd);
        f.rec(Record::TableEnd);
        let layout = f.layout();
        let edits = layout.index().edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].max_chars, Some(5));
        assert_eq!(edits[0].content_start, content);
        let segment = layout.index().find_segment(content).unwrap();
        assert!(layout.index().segments()[segment].flags.edit);
    }

    #[test]
    fn link_region_follows_a_wrap() {
        let mut f = Fixture::new(30);
        f.rec(Record::Link(Link {
            kind: LinkKind::Href,
            target: "#top".to_string(),
            hint: String::new(),
        }));
        f.text("aaa bbb");
        f.rec(Record::LinkEnd);
        let layout = f.layout();
        let links = layout.index().links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].rect, Rect::new(ZERO, ZERO, px(15), px(10)));
        assert_eq!(links[1].rect, Rect::new(ZERO, px(10), px(15), px(10)));
        assert!(links.iter().all(|l| l.target == "#top"));
    }
}
