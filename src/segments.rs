//! Layout output and the queries that map between stream positions and screen positions.

use crate::font::FontMetrics;
use crate::records::LinkKind;
use crate::stream::{Stream, Unit};
use crate::style::{TextStyle, replay};
use crate::types::{Color, Px, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    /// The segment lies inside an editable cell.
    pub edit: bool,
    pub has_text: bool,
    pub has_controls: bool,
    pub has_objects: bool,
    /// Control-only segment that may absorb a contiguous neighbour on the same line.
    pub mergeable: bool,
}

/// One positioned line fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub stream_start: usize,
    pub stream_stop: usize,
    /// End of the segment's content with trailing whitespace removed.
    pub trim_stop: usize,
    pub x: Px,
    pub y: Px,
    pub width: Px,
    /// Width used for horizontal alignment (trailing whitespace excluded).
    pub align_width: Px,
    pub height: Px,
    /// Distance from `y` to the text baseline.
    pub baseline: Px,
    pub depth: u8,
    pub flags: SegmentFlags,
}

impl Segment {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn is_control_only(&self) -> bool {
        !self.flags.has_text && !self.flags.has_objects
    }
}

/// A run of text drawn at one position inside a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub start: usize,
    pub stop: usize,
    pub x: Px,
    pub width: Px,
    pub segment: usize,
}

/// Screen space reserved by a table or object.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub rect: Rect,
    pub stream_index: usize,
    /// Recorded for hit-testing only; text is not pushed out of it.
    pub transparent: bool,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRegion {
    /// Stream index of the link record.
    pub record_index: usize,
    pub element_id: u32,
    pub rect: Rect,
    pub segment: usize,
    pub kind: LinkKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRegion {
    /// Stream index of the cell record.
    pub record_index: usize,
    pub element_id: u32,
    pub rect: Rect,
    pub segment: usize,
    pub name: String,
    pub name_hash: u32,
    pub max_chars: Option<usize>,
    pub line_breaks: bool,
    pub on_enter: Option<String>,
    pub on_exit: Option<String>,
    pub on_change: Option<String>,
    /// Content between the cell record and its end record.
    pub content_start: usize,
    pub content_end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Table,
    Row,
    Cell,
}

/// Background and border geometry for tables, rows and cells.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxPlacement {
    pub kind: BoxKind,
    pub stream_index: usize,
    pub rect: Rect,
    pub fill: Option<Color>,
    pub border: Option<Color>,
    pub thickness: Px,
    pub highlight: Option<Color>,
    pub shadow: Option<Color>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLayer {
    Background,
    Inline,
    Foreground,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPlacement {
    pub stream_index: usize,
    pub object_id: u32,
    pub rect: Rect,
    pub layer: ObjectLayer,
}

/// A list item marker (bullet or number) drawn left of the item text.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub stream_index: usize,
    pub x: Px,
    pub baseline: Px,
    pub text: String,
    pub colour: Option<Color>,
}

/// Everything one layout pass produces for a stream range.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    segments: Vec<Segment>,
    by_y: Vec<usize>,
    max_height: Px,
    runs: Vec<TextRun>,
    clips: Vec<Clip>,
    links: Vec<LinkRegion>,
    edits: Vec<EditRegion>,
    boxes: Vec<BoxPlacement>,
    objects: Vec<ObjectPlacement>,
    markers: Vec<Marker>,
}

/// Entry counts used to roll the index back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexMark {
    segments: usize,
    runs: usize,
    clips: usize,
    links: usize,
    edits: usize,
    boxes: usize,
    objects: usize,
    markers: usize,
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn links(&self) -> &[LinkRegion] {
        &self.links
    }

    pub fn edits(&self) -> &[EditRegion] {
        &self.edits
    }

    pub fn boxes(&self) -> &[BoxPlacement] {
        &self.boxes
    }

    pub fn objects(&self) -> &[ObjectPlacement] {
        &self.objects
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn mark(&self) -> IndexMark {
        IndexMark {
            segments: self.segments.len(),
            runs: self.runs.len(),
            clips: self.clips.len(),
            links: self.links.len(),
            edits: self.edits.len(),
            boxes: self.boxes.len(),
            objects: self.objects.len(),
            markers: self.markers.len(),
        }
    }

    /// Drops everything recorded after `mark`.
    pub fn rollback(&mut self, mark: IndexMark) {
        self.segments.truncate(mark.segments);
        self.runs.truncate(mark.runs);
        self.clips.truncate(mark.clips);
        self.links.truncate(mark.links);
        self.edits.truncate(mark.edits);
        self.boxes.truncate(mark.boxes);
        self.objects.truncate(mark.objects);
        self.markers.truncate(mark.markers);
    }

    /// Appends a segment, merging contiguous control-only segments on the same line.
    pub fn push_segment(&mut self, segment: Segment) -> usize {
        if segment.is_control_only() && segment.flags.mergeable {
            if let Some(last) = self.segments.last_mut() {
                if last.is_control_only()
                    && last.flags.mergeable
                    && last.stream_stop == segment.stream_start
                    && last.y == segment.y
                    && last.height == segment.height
                {
                    last.stream_stop = segment.stream_stop;
                    last.trim_stop = segment.trim_stop;
                    last.width = last.width.max(segment.x + segment.width - last.x);
                    last.flags.has_controls |= segment.flags.has_controls;
                    return self.segments.len() - 1;
                }
            }
        }
        self.segments.push(segment);
        self.segments.len() - 1
    }

    pub fn push_run(&mut self, run: TextRun) {
        self.runs.push(run);
    }

    pub fn push_clip(&mut self, clip: Clip) {
        self.clips.push(clip);
    }

    pub fn clips_from(&self, start: usize) -> &[Clip] {
        &self.clips[start.min(self.clips.len())..]
    }

    pub fn push_link(&mut self, link: LinkRegion) {
        self.links.push(link);
    }

    pub fn push_edit(&mut self, edit: EditRegion) {
        self.edits.push(edit);
    }

    pub fn push_box(&mut self, placement: BoxPlacement) {
        self.boxes.push(placement);
    }

    /// Boxes are pushed before their height is known and patched afterwards.
    pub fn box_mut(&mut self, index: usize) -> Option<&mut BoxPlacement> {
        self.boxes.get_mut(index)
    }

    pub fn push_object(&mut self, placement: ObjectPlacement) {
        self.objects.push(placement);
    }

    pub fn push_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    /// Rebuilds the Y-sorted order. Zero-height segments are left out of it.
    pub fn rebuild_y_order(&mut self) {
        let mut order: Vec<usize> = (0..self.segments.len())
            .filter(|&i| self.segments[i].height.is_positive())
            .collect();
        order.sort_by(|&a, &b| {
            let sa = &self.segments[a];
            let sb = &self.segments[b];
            sa.y.cmp(&sb.y)
                .then(sa.x.cmp(&sb.x))
                .then(sa.stream_start.cmp(&sb.stream_start))
        });
        self.max_height = order
            .iter()
            .map(|&i| self.segments[i].height)
            .fold(Px::ZERO, Px::max);
        self.by_y = order;
    }

    pub fn y_order(&self) -> &[usize] {
        &self.by_y
    }

    /// Bottom edge of the lowest segment, box or clip.
    pub fn content_height(&self) -> Px {
        let segments = self.segments.iter().map(|s| s.y + s.height);
        let boxes = self.boxes.iter().map(|b| b.rect.bottom());
        let objects = self.objects.iter().map(|o| o.rect.bottom());
        segments
            .chain(boxes)
            .chain(objects)
            .fold(Px::ZERO, Px::max)
    }

    /// Segment containing `byte_index`. An index at the very end maps to the last segment.
    pub fn find_segment(&self, byte_index: usize) -> Option<usize> {
        if self.segments.is_empty() {
            return None;
        }
        let pos = self
            .segments
            .partition_point(|s| s.stream_stop <= byte_index);
        if pos < self.segments.len() && self.segments[pos].stream_start <= byte_index {
            return Some(pos);
        }
        let last = self.segments.len() - 1;
        (byte_index >= self.segments[last].stream_stop).then_some(last)
    }

    /// Segments whose vertical extent contains `y`, in Y order.
    pub fn find_segments_by_y(&self, y: Px) -> Vec<usize> {
        let upper = self.by_y.partition_point(|&i| self.segments[i].y <= y);
        let mut hits = Vec::new();
        for &i in self.by_y[..upper].iter().rev() {
            let s = &self.segments[i];
            if s.y + self.max_height <= y {
                break;
            }
            if y < s.y + s.height {
                hits.push(i);
            }
        }
        hits.reverse();
        hits
    }

    /// Segment under a point, preferring the one whose horizontal extent contains `x`.
    pub fn segment_at(&self, x: Px, y: Px) -> Option<usize> {
        let hits = self.find_segments_by_y(y);
        hits.iter()
            .copied()
            .find(|&i| {
                let s = &self.segments[i];
                x >= s.x && x < s.x + s.width.max(Px::from_i32(1))
            })
            .or_else(|| hits.first().copied())
    }

    fn runs_of(&self, segment: usize) -> &[TextRun] {
        let start = self.runs.partition_point(|r| r.segment < segment);
        let end = self.runs.partition_point(|r| r.segment <= segment);
        &self.runs[start..end]
    }

    /// Maps a pointer x inside a segment to the nearest character boundary and its x.
    ///
    /// `seed` is a stream offset at or before the segment together with the style in force there;
    /// run styles are replayed forward from it.
    pub fn resolve_screen_position(
        &self,
        stream: &Stream,
        metrics: &dyn FontMetrics,
        seed: (usize, &TextStyle),
        segment: usize,
        pixel_x: Px,
    ) -> Option<(usize, Px)> {
        let (seed_pos, seed_style) = seed;
        let seg = self.segments.get(segment)?;
        let runs = self.runs_of(segment);
        let Some(first) = runs.first() else {
            return Some((seg.stream_start, seg.x));
        };
        if pixel_x <= first.x {
            return Some((first.start, first.x));
        }
        for run in runs {
            if pixel_x > run.x + run.width {
                continue;
            }
            let style = replay(stream, seed_pos, run.start, seed_style);
            let text = run_text(stream, run)?;
            let mut best = (run.start, run.x);
            let mut best_dist = (pixel_x - run.x).abs();
            for (offset, ch) in text.char_indices() {
                let end = offset + ch.len_utf8();
                let x = run.x + metrics.text_width(&style.face, &text[..end]);
                let dist = (pixel_x - x).abs();
                if dist < best_dist {
                    best = (run.start + end, x);
                    best_dist = dist;
                }
            }
            return Some(best);
        }
        let last = runs.last()?;
        let stop = if seg.trim_stop > last.stop { last.stop } else { seg.trim_stop.max(last.start) };
        if stop == last.stop {
            Some((last.stop, last.x + last.width))
        } else {
            let style = replay(stream, seed_pos, last.start, seed_style);
            let text = run_text(stream, last)?;
            let prefix = text.get(..stop - last.start)?;
            Some((stop, last.x + metrics.text_width(&style.face, prefix)))
        }
    }

    /// Link region under a point.
    pub fn link_at(&self, x: Px, y: Px) -> Option<usize> {
        self.links.iter().position(|l| l.rect.contains(x, y))
    }

    pub fn edit_at(&self, x: Px, y: Px) -> Option<usize> {
        self.edits.iter().position(|e| e.rect.contains(x, y))
    }

}

pub(crate) fn run_text<'a>(stream: &'a Stream, run: &TextRun) -> Option<&'a str> {
    match stream.units(run.start, run.stop).next()? {
        Ok(Unit::Text { text, .. }) => Some(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::FontFace;
    use crate::font::testing::TableMetrics;

    fn seg(start: usize, stop: usize, y: i32, height: i32) -> Segment {
        Segment {
            stream_start: start,
            stream_stop: stop,
            trim_stop: stop,
            x: Px::ZERO,
            y: Px::from_i32(y),
            width: Px::from_i32(50),
            align_width: Px::from_i32(50),
            height: Px::from_i32(height),
            baseline: Px::from_i32(8),
            depth: 0,
            flags: SegmentFlags {
                has_text: true,
                ..SegmentFlags::default()
            },
        }
    }

    fn control(start: usize, stop: usize, y: i32) -> Segment {
        Segment {
            flags: SegmentFlags {
                has_controls: true,
                mergeable: true,
                ..SegmentFlags::default()
            },
            width: Px::ZERO,
            ..seg(start, stop, y, 0)
        }
    }

    #[test]
    fn find_segment_skips_zero_width_segments() {
        let mut index = SegmentIndex::new();
        index.push_segment(seg(0, 6, 0, 10));
        index.push_segment(control(6, 6, 10));
        index.push_segment(seg(6, 11, 10, 10));
        assert_eq!(index.find_segment(0), Some(0));
        assert_eq!(index.find_segment(5), Some(0));
        assert_eq!(index.find_segment(6), Some(2));
        assert_eq!(index.find_segment(11), Some(2));
        assert_eq!(SegmentIndex::new().find_segment(0), None);
    }

    #[test]
    fn contiguous_control_segments_merge() {
        let mut index = SegmentIndex::new();
        index.push_segment(control(0, 11, 0));
        index.push_segment(control(11, 22, 0));
        index.push_segment(control(22, 33, 5));
        assert_eq!(index.segments().len(), 2);
        assert_eq!(index.segments()[0].stream_stop, 22);
    }

    #[test]
    fn y_lookup_excludes_zero_height_segments() {
        let mut index = SegmentIndex::new();
        index.push_segment(seg(0, 5, 0, 10));
        index.push_segment(seg(5, 9, 10, 0));
        index.push_segment(seg(9, 15, 10, 30));
        index.push_segment(seg(15, 20, 20, 10));
        index.rebuild_y_order();
        assert_eq!(index.find_segments_by_y(Px::from_i32(5)), vec![0]);
        assert_eq!(index.find_segments_by_y(Px::from_i32(25)), vec![2, 3]);
        assert!(!index.find_segments_by_y(Px::from_i32(10)).contains(&1));
        assert!(index.find_segments_by_y(Px::from_i32(100)).is_empty());
    }

    #[test]
    fn screen_position_snaps_to_nearest_character() {
        let mut stream = Stream::new();
        stream.push_text("abcd").unwrap();
        let mut index = SegmentIndex::new();
        index.push_segment(seg(0, 4, 0, 10));
        index.push_run(TextRun {
            start: 0,
            stop: 4,
            x: Px::from_i32(10),
            width: Px::from_i32(40),
            segment: 0,
        });
        let metrics = TableMetrics::new(10, 10);
        let base = TextStyle::new(
            FontFace::new("Sans", Px::from_i32(14), 0),
            Color::BLACK,
            Color::BLACK,
        );
        let at = |x: i32| {
            index
                .resolve_screen_position(&stream, &metrics, (0, &base), 0, Px::from_i32(x))
                .unwrap()
        };
        assert_eq!(at(0), (0, Px::from_i32(10)));
        assert_eq!(at(24), (1, Px::from_i32(20)));
        assert_eq!(at(26), (2, Px::from_i32(30)));
        assert_eq!(at(200), (4, Px::from_i32(50)));
    }
}
