use std::sync::Arc;

use image::RgbaImage;

use crate::types::{Color, Px, Rect, Size};

/// Draw primitive recorded by the render walker. Coordinates are in document pixels with y
/// growing downwards; `DrawString` positions the text baseline.
#[derive(Debug, Clone)]
pub enum Command {
    SaveState,
    RestoreState,
    // Non-rendered metadata (segment ranges, object names). Ignored by the rasteriser.
    Meta {
        key: String,
        value: String,
    },
    SetFillColor(Color),
    SetStrokeColor(Color),
    SetLineWidth(Px),
    SetFontName(String),
    SetFontSize(Px),
    SetFontFlags(u8),
    ClipRect {
        x: Px,
        y: Px,
        width: Px,
        height: Px,
    },
    FillRect {
        x: Px,
        y: Px,
        width: Px,
        height: Px,
    },
    StrokeRect {
        x: Px,
        y: Px,
        width: Px,
        height: Px,
    },
    DrawString {
        x: Px,
        y: Px,
        text: String,
    },
    DrawImage {
        x: Px,
        y: Px,
        width: Px,
        height: Px,
        image: Arc<RgbaImage>,
    },
}

/// The finished command list for one render call.
#[derive(Debug, Clone)]
pub struct DisplayList {
    pub size: Size,
    pub commands: Vec<Command>,
}

impl DisplayList {
    /// Concatenated text of every `DrawString`, in draw order.
    pub fn text(&self) -> String {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::DrawString { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct GraphicsState {
    fill_color: Color,
    stroke_color: Color,
    line_width: Px,
    font_size: Px,
    font_name: String,
    font_flags: u8,
}

impl GraphicsState {
    fn initial() -> Self {
        Self {
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: Px::from_i32(1),
            font_size: Px::from_i32(crate::font::DEFAULT_FONT_SIZE),
            font_name: String::new(),
            font_flags: 0,
        }
    }
}

/// Bitmap sink that records draw calls; redundant state changes are dropped.
pub struct Canvas {
    size: Size,
    commands: Vec<Command>,
    state_stack: Vec<GraphicsState>,
    current_state: GraphicsState,
}

impl Canvas {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            commands: Vec::new(),
            state_stack: Vec::new(),
            current_state: GraphicsState::initial(),
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn save_state(&mut self) {
        self.state_stack.push(self.current_state.clone());
        self.commands.push(Command::SaveState);
    }

    pub fn restore_state(&mut self) {
        if let Some(state) = self.state_stack.pop() {
            self.current_state = state;
            self.commands.push(Command::RestoreState);
        }
    }

    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.commands.push(Command::Meta {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn set_fill_color(&mut self, color: Color) {
        if self.current_state.fill_color == color {
            return;
        }
        self.current_state.fill_color = color;
        self.commands.push(Command::SetFillColor(color));
    }

    pub fn set_stroke_color(&mut self, color: Color) {
        if self.current_state.stroke_color == color {
            return;
        }
        self.current_state.stroke_color = color;
        self.commands.push(Command::SetStrokeColor(color));
    }

    pub fn set_line_width(&mut self, width: Px) {
        let width = width.max(Px::ZERO);
        if self.current_state.line_width == width {
            return;
        }
        self.current_state.line_width = width;
        self.commands.push(Command::SetLineWidth(width));
    }

    pub fn set_font_name(&mut self, name: &str) {
        if self.current_state.font_name == name {
            return;
        }
        self.current_state.font_name = name.to_string();
        self.commands
            .push(Command::SetFontName(self.current_state.font_name.clone()));
    }

    pub fn set_font_size(&mut self, size: Px) {
        if self.current_state.font_size == size {
            return;
        }
        self.current_state.font_size = size;
        self.commands.push(Command::SetFontSize(size));
    }

    pub fn set_font_flags(&mut self, flags: u8) {
        if self.current_state.font_flags == flags {
            return;
        }
        self.current_state.font_flags = flags;
        self.commands.push(Command::SetFontFlags(flags));
    }

    pub fn clip_rect(&mut self, rect: Rect) {
        self.commands.push(Command::ClipRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }

    pub fn fill_rect(&mut self, rect: Rect) {
        if !rect.width.is_positive() || !rect.height.is_positive() {
            return;
        }
        self.commands.push(Command::FillRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }

    pub fn stroke_rect(&mut self, rect: Rect) {
        self.commands.push(Command::StrokeRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }

    pub fn draw_string(&mut self, x: Px, baseline: Px, text: impl Into<String>) {
        self.commands.push(Command::DrawString {
            x,
            y: baseline,
            text: text.into(),
        });
    }

    pub fn draw_image(&mut self, rect: Rect, image: Arc<RgbaImage>) {
        self.commands.push(Command::DrawImage {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            image,
        });
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn finish(self) -> DisplayList {
        DisplayList {
            size: self.size,
            commands: self.commands,
        }
    }
}
