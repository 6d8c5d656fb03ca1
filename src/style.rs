//! Running text style carried through layout and rendering.
//!
//! Style records are not nested; each one overwrites part of the current state. Reconstructing
//! the style at any stream offset is a replay of every style record before it.

use std::sync::Arc;

use crate::font::FontFace;
use crate::records::Record;
use crate::stream::{Stream, Unit};
use crate::types::{Color, HAlign, Px};

#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub face: FontFace,
    pub align: HAlign,
    pub colour: Color,
    pub link_colour: Color,
    pub underline: Option<Color>,
    pub background: Option<Color>,
    pub inverse: bool,
    pub tabs: Arc<[Px]>,
    /// Stream index of the enclosing link record, if any.
    pub link: Option<usize>,
}

impl TextStyle {
    pub fn new(face: FontFace, colour: Color, link_colour: Color) -> Self {
        Self {
            face,
            align: HAlign::Left,
            colour,
            link_colour,
            underline: None,
            background: None,
            inverse: false,
            tabs: Arc::from(Vec::new()),
            link: None,
        }
    }

    /// Applies a style-affecting record. Returns false for records that do not touch the style.
    pub fn apply(&mut self, index: usize, record: &Record) -> bool {
        match record {
            Record::FontStyle(font) => {
                self.face = FontFace::new(&font.face, font.size, font.flags);
                self.align = font.align;
            }
            Record::FontColour(colour) => self.colour = *colour,
            Record::Underline(colour) => self.underline = *colour,
            Record::Background(colour) => self.background = *colour,
            Record::Inverse(enabled) => self.inverse = *enabled,
            Record::TabDef(stops) => self.tabs = Arc::from(stops.clone()),
            Record::Link(_) => self.link = Some(index),
            Record::LinkEnd => self.link = None,
            _ => return false,
        }
        true
    }

    /// Colour text is drawn in: links use the link colour and underline.
    pub fn text_colour(&self) -> Color {
        if self.link.is_some() {
            self.link_colour
        } else {
            self.colour
        }
    }

    pub fn underline_colour(&self) -> Option<Color> {
        match (self.underline, self.link) {
            (Some(colour), _) => Some(colour),
            (None, Some(_)) => Some(self.link_colour),
            (None, None) => None,
        }
    }

    /// Foreground and background after applying inverse video.
    pub fn paint_colours(&self) -> (Color, Option<Color>) {
        let fg = self.text_colour();
        if self.inverse {
            (self.background.unwrap_or(Color::WHITE), Some(fg))
        } else {
            (fg, self.background)
        }
    }
}

/// Style in effect at `end`, replaying style records from `start` onto `base`. Replay stops at
/// the first malformed unit.
pub fn replay(stream: &Stream, start: usize, end: usize, base: &TextStyle) -> TextStyle {
    let mut style = base.clone();
    for unit in stream.units(start, end) {
        let Ok(unit) = unit else {
            break;
        };
        if let Unit::Record(view) = unit {
            if !view.kind.is_style() {
                continue;
            }
            if let Ok(record) = view.record() {
                style.apply(view.index, &record);
            }
        }
    }
    style
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{FONT_BOLD, FontStyle, Link, LinkKind};

    fn base() -> TextStyle {
        TextStyle::new(
            FontFace::new("Sans", Px::from_i32(14), 0),
            Color::BLACK,
            Color::rgb(0.0, 0.0, 1.0),
        )
    }

    #[test]
    fn replay_applies_records_in_order() {
        let mut stream = Stream::new();
        stream
            .push_record(&Record::FontStyle(FontStyle {
                face: "Serif".to_string(),
                size: Px::from_i32(20),
                flags: FONT_BOLD,
                align: HAlign::Center,
            }))
            .unwrap();
        stream.push_text("abc").unwrap();
        stream.push_record(&Record::Inverse(true)).unwrap();
        let mid = stream.len();
        stream.push_record(&Record::Inverse(false)).unwrap();

        let style = replay(&stream, 0, mid, &base());
        assert_eq!(&*style.face.name, "Serif");
        assert_eq!(style.face.flags, FONT_BOLD);
        assert_eq!(style.align, HAlign::Center);
        assert!(style.inverse);
        assert!(!replay(&stream, 0, stream.len(), &base()).inverse);
    }

    #[test]
    fn links_switch_colour_and_underline() {
        let mut stream = Stream::new();
        stream
            .push_record(&Record::Link(Link {
                kind: LinkKind::Href,
                target: "#top".to_string(),
                hint: String::new(),
            }))
            .unwrap();
        let inside = stream.len();
        stream.push_record(&Record::LinkEnd).unwrap();

        let style = replay(&stream, 0, inside, &base());
        assert_eq!(style.link, Some(0));
        assert_eq!(style.text_colour(), style.link_colour);
        assert_eq!(style.underline_colour(), Some(style.link_colour));
        let after = replay(&stream, 0, stream.len(), &base());
        assert_eq!(after.text_colour(), Color::BLACK);
    }

    #[test]
    fn inverse_swaps_paint_colours() {
        let mut style = base();
        style.apply(0, &Record::Inverse(true));
        let (fg, bg) = style.paint_colours();
        assert_eq!(fg, Color::WHITE);
        assert_eq!(bg, Some(Color::BLACK));
        assert!(!style.apply(0, &Record::ParagraphEnd));
    }
}
