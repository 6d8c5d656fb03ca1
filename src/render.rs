//! Render Walker: replays a finished layout into draw commands.
//!
//! Drawing happens in three passes so that stacking follows the layout options: table/row/cell
//! boxes and background objects first, then text runs, list markers and inline objects, then
//! foreground objects. The text style for each run is rebuilt by replaying style records forward
//! from the previous run, so a render never re-runs layout.

use crate::canvas::Canvas;
use crate::font::FontMetrics;
use crate::layout::Layout;
use crate::object::ObjectTable;
use crate::segments::{BoxPlacement, ObjectLayer, TextRun, run_text};
use crate::stream::Stream;
use crate::style::{TextStyle, replay};
use crate::types::{Color, Px, Rect};

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Vertical band `[top, bottom)` to draw; everything when `None`.
    pub viewport: Option<(Px, Px)>,
    /// Stream range drawn with the selection colour behind it.
    pub selection: Option<(usize, usize)>,
    pub selection_colour: Color,
    pub page_colour: Option<Color>,
    pub shadow_offset: Px,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            viewport: None,
            selection: None,
            selection_colour: Color::from_rgba8(0x33, 0x99, 0xff, 0x80),
            page_colour: None,
            shadow_offset: Px::from_i32(2),
        }
    }
}

pub struct RenderContext<'a> {
    pub stream: &'a Stream,
    pub layout: &'a Layout,
    pub objects: &'a ObjectTable,
    pub metrics: &'a dyn FontMetrics,
    pub base_style: &'a TextStyle,
}

/// Incremental style replay. Going backwards restarts from the nearest layout checkpoint.
struct StyleCursor<'a> {
    stream: &'a Stream,
    layout: &'a Layout,
    base: &'a TextStyle,
    pos: usize,
    style: TextStyle,
}

impl<'a> StyleCursor<'a> {
    fn new(ctx: &RenderContext<'a>) -> Self {
        Self {
            stream: ctx.stream,
            layout: ctx.layout,
            base: ctx.base_style,
            pos: 0,
            style: ctx.base_style.clone(),
        }
    }

    fn at(&mut self, index: usize) -> &TextStyle {
        if index < self.pos {
            let (pos, style) = self.layout.style_seed(index).unwrap_or((0, self.base));
            self.pos = pos;
            self.style = style.clone();
        }
        if index > self.pos {
            self.style = replay(self.stream, self.pos, index, &self.style);
            self.pos = index;
        }
        &self.style
    }
}

/// Draws the layout onto `canvas`. Returns the number of commands emitted.
pub fn render(ctx: &RenderContext<'_>, canvas: &mut Canvas, options: &RenderOptions) -> usize {
    let before = canvas.command_count();
    let index = ctx.layout.index();
    let (top, bottom) = options
        .viewport
        .unwrap_or((Px::ZERO, ctx.layout.height().max(index.content_height())));
    let band = Rect::new(Px::ZERO, top, ctx.layout.width(), (bottom - top).max(Px::ZERO));

    canvas.save_state();
    if options.viewport.is_some() {
        canvas.clip_rect(band);
    }
    if let Some(colour) = options.page_colour {
        canvas.set_fill_color(colour);
        canvas.fill_rect(band);
    }

    for placement in index.boxes() {
        if placement.rect.overlaps_band(top, bottom) {
            draw_box(canvas, placement, options.shadow_offset);
        }
    }
    draw_objects(ctx, canvas, ObjectLayer::Background, top, bottom);

    let mut styles = StyleCursor::new(ctx);
    let segments = index.segments();
    for run in index.runs() {
        let Some(segment) = segments.get(run.segment) else {
            continue;
        };
        if !segment.height.is_positive() || !segment.rect().overlaps_band(top, bottom) {
            continue;
        }
        let style = styles.at(run.start).clone();
        let Some(text) = run_text(ctx.stream, run) else {
            continue;
        };
        let line = Rect::new(run.x, segment.y, run.width, segment.height);
        draw_run(ctx, canvas, options, &style, run, text, line, segment.y + segment.baseline);
    }

    let mut marker_styles = StyleCursor::new(ctx);
    for marker in index.markers() {
        if marker.baseline < top || marker.baseline - Px::from_i32(1) >= bottom {
            continue;
        }
        let style = marker_styles.at(marker.stream_index);
        set_font(canvas, style);
        canvas.set_fill_color(marker.colour.unwrap_or(style.colour));
        canvas.draw_string(marker.x, marker.baseline, marker.text.clone());
    }
    draw_objects(ctx, canvas, ObjectLayer::Inline, top, bottom);
    draw_objects(ctx, canvas, ObjectLayer::Foreground, top, bottom);
    canvas.restore_state();

    canvas.command_count() - before
}

fn draw_box(canvas: &mut Canvas, placement: &BoxPlacement, shadow_offset: Px) {
    let rect = placement.rect;
    if let Some(shadow) = placement.shadow {
        canvas.set_fill_color(shadow);
        canvas.fill_rect(rect.translate(shadow_offset, shadow_offset));
    }
    if let Some(fill) = placement.fill {
        canvas.set_fill_color(fill);
        canvas.fill_rect(rect);
    }
    if let Some(highlight) = placement.highlight {
        let one = Px::from_i32(1);
        canvas.set_fill_color(highlight);
        canvas.fill_rect(Rect::new(rect.x, rect.y, rect.width, one));
        canvas.fill_rect(Rect::new(rect.x, rect.y, one, rect.height));
    }
    if let Some(border) = placement.border {
        if placement.thickness.is_positive() {
            let half = placement.thickness / 2;
            canvas.set_stroke_color(border);
            canvas.set_line_width(placement.thickness);
            canvas.stroke_rect(Rect::new(
                rect.x + half,
                rect.y + half,
                (rect.width - placement.thickness).max(Px::ZERO),
                (rect.height - placement.thickness).max(Px::ZERO),
            ));
        }
    }
}

fn set_font(canvas: &mut Canvas, style: &TextStyle) {
    canvas.set_font_name(&style.face.name);
    canvas.set_font_size(style.face.size);
    canvas.set_font_flags(style.face.flags);
}

#[allow(clippy::too_many_arguments)]
fn draw_run(
    ctx: &RenderContext<'_>,
    canvas: &mut Canvas,
    options: &RenderOptions,
    style: &TextStyle,
    run: &TextRun,
    text: &str,
    line: Rect,
    baseline: Px,
) {
    let (fg, bg) = style.paint_colours();
    if let Some(bg) = bg {
        canvas.set_fill_color(bg);
        canvas.fill_rect(line);
    }
    if let Some((start, stop)) = options.selection {
        let (start, stop) = (start.min(stop), start.max(stop));
        let from = start.max(run.start);
        let to = stop.min(run.stop);
        if from < to {
            let x0 = run.x + prefix_width(ctx, style, text, from - run.start);
            let x1 = run.x + prefix_width(ctx, style, text, to - run.start);
            canvas.set_fill_color(options.selection_colour);
            canvas.fill_rect(Rect::new(x0, line.y, x1 - x0, line.height));
        }
    }
    set_font(canvas, style);
    canvas.set_fill_color(fg);
    canvas.draw_string(run.x, baseline, text);
    if let Some(colour) = style.underline_colour() {
        let one = Px::from_i32(1);
        canvas.set_fill_color(colour);
        canvas.fill_rect(Rect::new(run.x, baseline + one, run.width, one));
    }
}

fn prefix_width(ctx: &RenderContext<'_>, style: &TextStyle, text: &str, len: usize) -> Px {
    match text.get(..len) {
        Some(prefix) => ctx.metrics.text_width(&style.face, prefix),
        None => ctx.metrics.text_width(&style.face, text),
    }
}

fn draw_objects(ctx: &RenderContext<'_>, canvas: &mut Canvas, layer: ObjectLayer, top: Px, bottom: Px) {
    for placement in ctx.layout.index().objects() {
        if placement.layer != layer || !placement.rect.overlaps_band(top, bottom) {
            continue;
        }
        let Some(entry) = ctx.objects.get(placement.object_id) else {
            continue;
        };
        canvas.save_state();
        canvas.meta("object", entry.object.name());
        canvas.clip_rect(placement.rect);
        entry.object.draw(canvas, placement.rect);
        canvas.restore_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::canvas::Command;
    use crate::font::FontFace;
    use crate::font::testing::TableMetrics;
    use crate::layout::{LayoutConfig, LayoutContext};
    use crate::object::testing::BoxObject;
    use crate::object::{LayoutOptions, ObjectEntry};
    use crate::records::{Record, Row, Cell, TableStart};
    use crate::types::Size;

    fn px(v: i32) -> Px {
        Px::from_i32(v)
    }

    struct Page {
        stream: Stream,
        objects: ObjectTable,
        config: LayoutConfig,
        metrics: TableMetrics,
    }

    impl Page {
        fn new(width: i32) -> Self {
            let style = TextStyle::new(
                FontFace::new("Sans", px(14), 0),
                Color::BLACK,
                Color::rgb(0.0, 0.0, 1.0),
            );
            Self {
                stream: Stream::new(),
                objects: ObjectTable::new(),
                config: LayoutConfig::new(px(width), style),
                metrics: TableMetrics::new(5, 10),
            }
        }

        fn draw(&self, options: &RenderOptions) -> Vec<Command> {
            let edits = HashMap::new();
            let layout = Layout::run(&LayoutContext::new(
                &self.stream,
                &self.metrics,
                &self.objects,
                &edits,
                &self.config,
            ));
            let ctx = RenderContext {
                stream: &self.stream,
                layout: &layout,
                objects: &self.objects,
                metrics: &self.metrics,
                base_style: &self.config.base_style,
            };
            let mut canvas = Canvas::new(Size::new(layout.width(), layout.height()));
            let count = render(&ctx, &mut canvas, options);
            let list = canvas.finish();
            assert_eq!(count, list.commands.len());
            list.commands
        }
    }

    fn strings(commands: &[Command]) -> Vec<(String, Px)> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::DrawString { text, y, .. } => Some((text.clone(), *y)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wrapped_text_is_drawn_on_its_baselines() {
        let mut page = Page::new(40);
        page.stream.push_text("Hello World").unwrap();
        let drawn = strings(&page.draw(&RenderOptions::default()));
        assert_eq!(
            drawn,
            vec![("Hello ".to_string(), px(8)), ("World".to_string(), px(18))]
        );
    }

    #[test]
    fn viewport_skips_lines_outside_the_band() {
        let mut page = Page::new(40);
        page.stream.push_text("one two three four").unwrap();
        let options = RenderOptions {
            viewport: Some((px(10), px(20))),
            ..RenderOptions::default()
        };
        let drawn = strings(&page.draw(&options));
        assert_eq!(drawn.len(), 1);
        assert_eq!(drawn[0].0, "three ");
    }

    #[test]
    fn style_records_change_colour_and_underline() {
        let mut page = Page::new(200);
        page.stream.push_text("a").unwrap();
        page.stream
            .push_record(&Record::FontColour(Color::rgb(1.0, 0.0, 0.0)))
            .unwrap();
        page.stream
            .push_record(&Record::Underline(Some(Color::BLACK)))
            .unwrap();
        page.stream.push_text("b").unwrap();
        let commands = page.draw(&RenderOptions::default());
        let red = commands
            .iter()
            .position(|c| matches!(c, Command::SetFillColor(c) if *c == Color::rgb(1.0, 0.0, 0.0)))
            .unwrap();
        let b = commands
            .iter()
            .position(|c| matches!(c, Command::DrawString { text, .. } if text == "b"))
            .unwrap();
        assert!(red < b);
        let underline = commands[b..]
            .iter()
            .any(|c| matches!(c, Command::FillRect { height, .. } if *height == px(1)));
        assert!(underline);
    }

    #[test]
    fn selection_is_filled_behind_the_text() {
        let mut page = Page::new(200);
        page.stream.push_text("abcdef").unwrap();
        let options = RenderOptions {
            selection: Some((4, 2)),
            ..RenderOptions::default()
        };
        let commands = page.draw(&options);
        let fill = commands
            .iter()
            .find_map(|c| match c {
                Command::FillRect { x, width, .. } => Some((*x, *width)),
                _ => None,
            })
            .unwrap();
        assert_eq!(fill, (px(10), px(10)));
    }

    #[test]
    fn boxes_come_before_text_and_foreground_after() {
        let mut page = Page::new(200);
        page.stream
            .push_record(&Record::TableStart(TableStart {
                colour: Some(Color::WHITE),
                ..TableStart::default()
            }))
            .unwrap();
        page.stream.push_record(&Record::Row(Row::default())).unwrap();
        page.stream.push_record(&Record::Cell(Cell::default())).unwrap();
        page.stream.push_text("cell").unwrap();
        page.stream.push_record(&Record::CellEnd).unwrap();
        page.stream.push_record(&Record::RowEnd).unwrap();
        page.stream.push_record(&Record::TableEnd).unwrap();
        let id = page
            .objects
            .insert(ObjectEntry {
                object: Arc::new(BoxObject::new(
                    5,
                    5,
                    LayoutOptions::FOREGROUND.union(LayoutOptions::SQUARE),
                )),
                options: None,
                position: None,
            })
            .unwrap();
        page.stream.push_record(&Record::Object(id)).unwrap();

        let commands = page.draw(&RenderOptions::default());
        let table_fill = commands
            .iter()
            .position(|c| matches!(c, Command::FillRect { .. }))
            .unwrap();
        let text = commands
            .iter()
            .position(|c| matches!(c, Command::DrawString { .. }))
            .unwrap();
        let object = commands
            .iter()
            .position(|c| matches!(c, Command::Meta { value, .. } if value == "box"))
            .unwrap();
        assert!(table_fill < text);
        assert!(text < object);
    }

    #[test]
    fn markers_are_drawn_with_the_list() {
        use crate::records::{ListKind, ListStart, ParagraphStart};
        let mut page = Page::new(200);
        page.stream
            .push_record(&Record::ListStart(ListStart {
                kind: ListKind::Ordered,
                start: 3,
                item_indent: px(20),
                block_indent: Px::ZERO,
                vspacing: 0.0,
                colour: Some(Color::WHITE),
            }))
            .unwrap();
        page.stream
            .push_record(&Record::ParagraphStart(ParagraphStart {
                list_item: true,
                ..ParagraphStart::default()
            }))
            .unwrap();
        page.stream.push_text("x").unwrap();
        page.stream.push_record(&Record::ParagraphEnd).unwrap();
        page.stream.push_record(&Record::ListEnd).unwrap();
        let drawn = strings(&page.draw(&RenderOptions::default()));
        let texts: Vec<&str> = drawn.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(texts, vec!["x", "3."]);
    }
}
