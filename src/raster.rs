use crate::canvas::{Command, DisplayList};
use crate::error::RippleError;
use crate::font::{FontRegistry, shape_run};
use crate::types::{Color, Px};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::Arc;
use tiny_skia::{
    FillRule, FilterQuality, Mask, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Rect, Stroke,
    Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Clone)]
struct RasterState {
    fill_color: Color,
    stroke_color: Color,
    line_width: Px,
    font_name: String,
    font_size: Px,
    font_flags: u8,
    clip_mask: Option<Mask>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: Px::from_i32(1),
            font_name: String::new(),
            font_size: Px::from_i32(crate::font::DEFAULT_FONT_SIZE),
            font_flags: 0,
            clip_mask: None,
        }
    }
}

/// Replays a display list onto a white pixmap. `scale` is device pixels per document pixel.
/// Text is drawn only for faces found in `fonts`.
pub fn rasterize(
    list: &DisplayList,
    scale: f32,
    fonts: Option<&FontRegistry>,
) -> Result<Pixmap, RippleError> {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let width = device_px(list.size.width, scale)?;
    let height = device_px(list.size.height, scale)?;
    let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
        RippleError::InvalidConfiguration(format!(
            "invalid raster size {width}x{height} at scale {scale}"
        ))
    })?;
    pixmap.fill(tiny_skia::Color::WHITE);

    let transform = Transform::from_scale(scale, scale);
    let mut state = RasterState::default();
    let mut stack: Vec<RasterState> = Vec::new();
    let mut images: HashMap<usize, Option<Pixmap>> = HashMap::new();

    for command in &list.commands {
        match command {
            Command::SaveState => stack.push(state.clone()),
            Command::RestoreState => {
                if let Some(saved) = stack.pop() {
                    state = saved;
                }
            }
            Command::Meta { .. } => {}
            Command::SetFillColor(color) => state.fill_color = *color,
            Command::SetStrokeColor(color) => state.stroke_color = *color,
            Command::SetLineWidth(width) => state.line_width = *width,
            Command::SetFontName(name) => state.font_name = name.clone(),
            Command::SetFontSize(size) => state.font_size = *size,
            Command::SetFontFlags(flags) => state.font_flags = *flags,
            Command::ClipRect {
                x,
                y,
                width,
                height,
            } => {
                let Some(path) = rect_path(*x, *y, *width, *height) else {
                    // An empty clip hides everything until the state is restored.
                    state.clip_mask = Mask::new(pixmap.width(), pixmap.height());
                    continue;
                };
                apply_clip_path(&mut state, &path, transform, pixmap.width(), pixmap.height());
            }
            Command::FillRect {
                x,
                y,
                width,
                height,
            } => {
                let Some(rect) = sk_rect(*x, *y, *width, *height) else {
                    continue;
                };
                let paint = fill_paint(state.fill_color);
                pixmap.fill_rect(rect, &paint, transform, state.clip_mask.as_ref());
            }
            Command::StrokeRect {
                x,
                y,
                width,
                height,
            } => {
                let Some(path) = rect_path(*x, *y, *width, *height) else {
                    continue;
                };
                let paint = fill_paint(state.stroke_color);
                let stroke = Stroke {
                    width: state.line_width.to_f32().max(0.0),
                    ..Stroke::default()
                };
                pixmap.stroke_path(&path, &paint, &stroke, transform, state.clip_mask.as_ref());
            }
            Command::DrawString { x, y, text } => {
                draw_string(&mut pixmap, &state, x.to_f32(), y.to_f32(), text, transform, fonts);
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                image,
            } => {
                let key = Arc::as_ptr(image) as usize;
                let source = images
                    .entry(key)
                    .or_insert_with(|| image_to_pixmap(image));
                let Some(source) = source.as_ref() else {
                    continue;
                };
                if !width.is_positive() || !height.is_positive() {
                    continue;
                }
                let sx = width.to_f32() / source.width().max(1) as f32;
                let sy = height.to_f32() / source.height().max(1) as f32;
                let local = Transform::from_row(sx, 0.0, 0.0, sy, x.to_f32(), y.to_f32());
                let paint = PixmapPaint {
                    quality: FilterQuality::Bilinear,
                    ..PixmapPaint::default()
                };
                pixmap.draw_pixmap(
                    0,
                    0,
                    source.as_ref(),
                    &paint,
                    transform.pre_concat(local),
                    state.clip_mask.as_ref(),
                );
            }
        }
    }
    Ok(pixmap)
}

pub fn to_png(pixmap: &Pixmap) -> Result<Vec<u8>, RippleError> {
    pixmap
        .encode_png()
        .map_err(|e| RippleError::Resource(format!("png encode failed: {e}")))
}

fn device_px(value: Px, scale: f32) -> Result<u32, RippleError> {
    let px = (value.to_f32() * scale).ceil();
    if !px.is_finite() || px > u32::MAX as f32 {
        return Err(RippleError::InvalidConfiguration(format!(
            "raster dimension {px} is out of range"
        )));
    }
    Ok(px.max(1.0) as u32)
}

fn sk_rect(x: Px, y: Px, width: Px, height: Px) -> Option<Rect> {
    Rect::from_xywh(x.to_f32(), y.to_f32(), width.to_f32(), height.to_f32())
}

fn rect_path(x: Px, y: Px, width: Px, height: Px) -> Option<Path> {
    sk_rect(x, y, width, height).map(PathBuilder::from_rect)
}

fn apply_clip_path(state: &mut RasterState, path: &Path, transform: Transform, width: u32, height: u32) {
    if let Some(mask) = state.clip_mask.as_mut() {
        mask.intersect_path(path, FillRule::Winding, true, transform);
        return;
    }
    let Some(mut mask) = Mask::new(width, height) else {
        return;
    };
    mask.fill_path(path, FillRule::Winding, true, transform);
    state.clip_mask = Some(mask);
}

fn draw_string(
    pixmap: &mut Pixmap,
    state: &RasterState,
    x: f32,
    y: f32,
    text: &str,
    transform: Transform,
    fonts: Option<&FontRegistry>,
) {
    let font_size = state.font_size.to_f32().max(0.0);
    if font_size <= 0.0 || text.trim().is_empty() {
        return;
    }
    let Some(font) = fonts.and_then(|fonts| fonts.resolve_styled(&state.font_name, state.font_flags))
    else {
        log::debug!("raster: no outlines for font '{}'", state.font_name);
        return;
    };
    let data = font.data.as_slice();
    let Ok(face) = ttf_parser::Face::parse(data, 0) else {
        return;
    };
    let scale = font_size / face.units_per_em().max(1) as f32;
    let paint = fill_paint(state.fill_color);
    let mut pen = x;
    for glyph in shape_run(data, text) {
        let origin_x = pen + glyph.x_offset as f32 * scale;
        // Font units grow upwards, document pixels downwards.
        let origin_y = y - glyph.y_offset as f32 * scale;
        pen += glyph.advance as f32 * scale;
        if glyph.glyph_id == 0 {
            continue;
        }
        let mut outline = GlyphOutline::new(origin_x, origin_y, scale);
        if face
            .outline_glyph(GlyphId(glyph.glyph_id), &mut outline)
            .is_none()
        {
            continue;
        }
        let Some(path) = outline.finish() else {
            continue;
        };
        pixmap.fill_path(
            &path,
            &paint,
            FillRule::Winding,
            transform,
            state.clip_mask.as_ref(),
        );
    }
}

/// Converts glyph outlines (font units, y up) into a path in document pixels (y down).
struct GlyphOutline {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphOutline {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn point(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale, self.origin_y - y * self.scale)
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }
}

impl OutlineBuilder for GlyphOutline {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.point(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.point(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.point(x1, y1);
        let (x, y) = self.point(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.point(x1, y1);
        let (x2, y2) = self.point(x2, y2);
        let (x, y) = self.point(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn fill_paint(color: Color) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color));
    paint.anti_alias = true;
    paint
}

fn to_sk_color(color: Color) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        color.r.clamp(0.0, 1.0),
        color.g.clamp(0.0, 1.0),
        color.b.clamp(0.0, 1.0),
        color.a.clamp(0.0, 1.0),
    )
    .unwrap_or(tiny_skia::Color::BLACK)
}

fn image_to_pixmap(image: &RgbaImage) -> Option<Pixmap> {
    let (width, height) = image.dimensions();
    let mut pixmap = Pixmap::new(width, height)?;
    for (src, dst) in image
        .as_raw()
        .chunks_exact(4)
        .zip(pixmap.data_mut().chunks_exact_mut(4))
    {
        let a = src[3];
        dst[0] = premul_u8(src[0], a);
        dst[1] = premul_u8(src[1], a);
        dst[2] = premul_u8(src[2], a);
        dst[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Canvas;
    use crate::types::{Rect as PxRect, Size};

    fn px(v: i32) -> Px {
        Px::from_i32(v)
    }

    fn pixel(pixmap: &Pixmap, x: u32, y: u32) -> [u8; 4] {
        let p = pixmap.pixel(x, y).unwrap();
        [p.red(), p.green(), p.blue(), p.alpha()]
    }

    #[test]
    fn fills_are_scaled_to_device_pixels() {
        let mut canvas = Canvas::new(Size::new(px(10), px(10)));
        canvas.set_fill_color(Color::rgb(1.0, 0.0, 0.0));
        canvas.fill_rect(PxRect::new(px(0), px(0), px(5), px(5)));
        let pixmap = rasterize(&canvas.finish(), 2.0, None).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (20, 20));
        assert_eq!(pixel(&pixmap, 4, 4), [255, 0, 0, 255]);
        assert_eq!(pixel(&pixmap, 15, 15), [255, 255, 255, 255]);
    }

    #[test]
    fn clip_limits_fills_until_restored() {
        let mut canvas = Canvas::new(Size::new(px(10), px(10)));
        canvas.set_fill_color(Color::BLACK);
        canvas.save_state();
        canvas.clip_rect(PxRect::new(px(0), px(0), px(5), px(10)));
        canvas.fill_rect(PxRect::new(px(0), px(0), px(10), px(5)));
        canvas.restore_state();
        canvas.fill_rect(PxRect::new(px(0), px(6), px(10), px(4)));
        let pixmap = rasterize(&canvas.finish(), 1.0, None).unwrap();
        assert_eq!(pixel(&pixmap, 2, 2), [0, 0, 0, 255]);
        assert_eq!(pixel(&pixmap, 8, 2), [255, 255, 255, 255]);
        assert_eq!(pixel(&pixmap, 8, 8), [0, 0, 0, 255]);
    }

    #[test]
    fn images_are_stretched_into_their_rect() {
        let mut source = RgbaImage::new(1, 1);
        source.put_pixel(0, 0, image::Rgba([0, 0, 255, 255]));
        let mut canvas = Canvas::new(Size::new(px(8), px(8)));
        canvas.draw_image(PxRect::new(px(2), px(2), px(4), px(4)), Arc::new(source));
        let pixmap = rasterize(&canvas.finish(), 1.0, None).unwrap();
        assert_eq!(pixel(&pixmap, 4, 4), [0, 0, 255, 255]);
        assert_eq!(pixel(&pixmap, 0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn text_without_fonts_is_skipped_and_png_encodes() {
        let mut canvas = Canvas::new(Size::new(px(30), px(12)));
        canvas.set_font_name("Missing");
        canvas.draw_string(px(0), px(10), "Hi");
        let pixmap = rasterize(&canvas.finish(), 1.0, None).unwrap();
        assert!(pixmap.pixels().iter().all(|p| p.red() == 255));
        let png = to_png(&pixmap).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
