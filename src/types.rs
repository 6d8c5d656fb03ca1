use fixed::types::I32F32;

/// Device-independent pixel stored as I32F32 fixed point, quantized to 1/1000 px on arithmetic so
/// that repeated layout passes produce identical coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Px(I32F32);

impl Px {
    pub const ZERO: Px = Px(I32F32::from_bits(0));

    /// Stand-in for "no width constraint" during measuring passes.
    pub const UNBOUNDED: Px = Px(I32F32::from_bits(1_000_000i64 << 32));

    pub fn from_f32(value: f32) -> Px {
        if !value.is_finite() {
            return Px::ZERO;
        }
        let milli = (value as f64 * 1000.0).round();
        let milli = milli.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
        Px::from_milli_i64(milli)
    }

    pub fn from_i32(value: i32) -> Px {
        Px::from_milli_i64((value as i64) * 1000)
    }

    pub fn to_f32(self) -> f32 {
        self.0.to_num()
    }

    pub fn to_milli_i64(self) -> i64 {
        let bits = self.0.to_bits() as i128;
        let denom = 1i128 << 32;
        let scaled = bits * 1000;
        let adj = if scaled >= 0 { denom / 2 } else { -denom / 2 };
        let milli = (scaled + adj) / denom;
        milli.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Milli-pixels clamped into an i32, the representation used inside stream payloads.
    pub fn to_milli_i32(self) -> i32 {
        self.to_milli_i64().clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    pub fn max(self, other: Px) -> Px {
        if self >= other { self } else { other }
    }

    pub fn min(self, other: Px) -> Px {
        if self <= other { self } else { other }
    }

    pub fn clamp_to(self, low: Px, high: Px) -> Px {
        self.max(low).min(high)
    }

    pub fn abs(self) -> Px {
        if self.to_milli_i64() < 0 { -self } else { self }
    }

    pub fn is_positive(self) -> bool {
        self > Px::ZERO
    }

    pub fn mul_ratio(self, num: i32, denom: i32) -> Px {
        if denom == 0 {
            return Px::ZERO;
        }
        let milli = self.to_milli_i64() as i128;
        let value = div_round_i128(milli.saturating_mul(num as i128), denom as i128);
        Px::from_milli_i128(value)
    }

    pub fn from_milli_i64(milli: i64) -> Px {
        Px::from_milli_i128(milli as i128)
    }

    fn from_milli_i128(milli: i128) -> Px {
        let denom = 1i128 << 32;
        let adj = if milli >= 0 { 500 } else { -500 };
        let bits = (milli * denom + adj) / 1000;
        let bits = bits.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        Px(I32F32::from_bits(bits))
    }
}

impl std::ops::Add for Px {
    type Output = Px;
    fn add(self, rhs: Px) -> Px {
        Px::from_milli_i128(self.to_milli_i64() as i128 + rhs.to_milli_i64() as i128)
    }
}

impl std::ops::AddAssign for Px {
    fn add_assign(&mut self, rhs: Px) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Px {
    type Output = Px;
    fn sub(self, rhs: Px) -> Px {
        Px::from_milli_i128(self.to_milli_i64() as i128 - rhs.to_milli_i64() as i128)
    }
}

impl std::ops::SubAssign for Px {
    fn sub_assign(&mut self, rhs: Px) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<i32> for Px {
    type Output = Px;
    fn mul(self, rhs: i32) -> Px {
        let milli = self.to_milli_i64() as i128;
        Px::from_milli_i128(milli.saturating_mul(rhs as i128))
    }
}

impl std::ops::Div<i32> for Px {
    type Output = Px;
    fn div(self, rhs: i32) -> Px {
        if rhs == 0 {
            Px::ZERO
        } else {
            let milli = self.to_milli_i64() as i128;
            Px::from_milli_i128(div_round_i128(milli, rhs as i128))
        }
    }
}

impl std::ops::Mul<f32> for Px {
    type Output = Px;
    fn mul(self, rhs: f32) -> Px {
        if !rhs.is_finite() {
            return Px::ZERO;
        }
        Px::from_f32(self.to_f32() * rhs)
    }
}

impl std::ops::Neg for Px {
    type Output = Px;
    fn neg(self) -> Px {
        Px::from_milli_i128(-(self.to_milli_i64() as i128))
    }
}

impl std::iter::Sum for Px {
    fn sum<I: Iterator<Item = Px>>(iter: I) -> Px {
        iter.fold(Px::ZERO, |acc, v| acc + v)
    }
}

impl<'a> std::iter::Sum<&'a Px> for Px {
    fn sum<I: Iterator<Item = &'a Px>>(iter: I) -> Px {
        iter.fold(Px::ZERO, |acc, v| acc + *v)
    }
}

fn div_round_i128(num: i128, den: i128) -> i128 {
    if den == 0 {
        return 0;
    }
    let den_abs = den.abs();
    if num >= 0 {
        (num + (den_abs / 2)) / den
    } else {
        -(((-num) + (den_abs / 2)) / den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: Px,
    pub height: Px,
}

impl Size {
    pub fn new(width: Px, height: Px) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: Px,
    pub y: Px,
    pub width: Px,
    pub height: Px,
}

impl Rect {
    pub fn new(x: Px, y: Px, width: Px, height: Px) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> Px {
        self.x + self.width
    }

    pub fn bottom(&self) -> Px {
        self.y + self.height
    }

    pub fn contains(&self, x: Px, y: Px) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// True when the half-open band `[top, bottom)` overlaps this rectangle vertically.
    pub fn overlaps_band(&self, top: Px, bottom: Px) -> bool {
        self.y < bottom && top < self.bottom()
    }

    pub fn translate(&self, dx: Px, dy: Px) -> Rect {
        Rect {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Margins {
    pub top: Px,
    pub right: Px,
    pub bottom: Px,
    pub left: Px,
}

impl Margins {
    pub fn all(value: f32) -> Self {
        let v = Px::from_f32(value);
        Self {
            top: v,
            right: v,
            bottom: v,
            left: v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };

    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub fn from_rgba8(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }

    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }

    pub fn is_transparent(&self) -> bool {
        self.a <= 0.0
    }

    /// Parses `#rgb`, `#rrggbb`, `#rrggbbaa`, `rgb(r,g,b)` / `rgba(r,g,b,a)` and bare
    /// comma-separated decimals `r,g,b[,a]` in the 0-255 range.
    pub fn parse(raw: &str) -> Option<Color> {
        let value = raw.trim();
        if let Some(hex) = value.strip_prefix('#') {
            return parse_hex(hex);
        }
        let inner = value
            .strip_prefix("rgba(")
            .or_else(|| value.strip_prefix("rgb("))
            .and_then(|v| v.strip_suffix(')'))
            .unwrap_or(value);
        let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
        if parts.len() != 3 && parts.len() != 4 {
            return None;
        }
        let mut channels = [255u8; 4];
        for (slot, part) in channels.iter_mut().zip(parts.iter()) {
            let parsed: i32 = part.parse().ok()?;
            *slot = parsed.clamp(0, 255) as u8;
        }
        Some(Color::from_rgba8(
            channels[0],
            channels[1],
            channels[2],
            channels[3],
        ))
    }
}

fn parse_hex(hex: &str) -> Option<Color> {
    let digit = |idx: usize| -> Option<u8> {
        let ch = hex.as_bytes().get(idx).copied()? as char;
        ch.to_digit(16).map(|d| d as u8)
    };
    let pair = |idx: usize| -> Option<u8> { Some(digit(idx)? * 16 + digit(idx + 1)?) };
    match hex.len() {
        3 => Some(Color::from_rgba8(
            digit(0)? * 17,
            digit(1)? * 17,
            digit(2)? * 17,
            255,
        )),
        6 => Some(Color::from_rgba8(pair(0)?, pair(2)?, pair(4)?, 255)),
        8 => Some(Color::from_rgba8(pair(0)?, pair(2)?, pair(4)?, pair(6)?)),
        _ => None,
    }
}

/// Absolute pixels or a percentage of the containing width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Length {
    Auto,
    Px(Px),
    Percent(f32),
}

impl Length {
    pub fn parse(raw: &str) -> Option<Length> {
        let value = raw.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            return Some(Length::Auto);
        }
        if let Some(pct) = value.strip_suffix('%') {
            let pct: f32 = pct.trim().parse().ok()?;
            return Some(Length::Percent(pct.clamp(0.0, 100.0)));
        }
        let px = value.strip_suffix("px").unwrap_or(value);
        let px: f32 = px.trim().parse().ok()?;
        Some(Length::Px(Px::from_f32(px.max(0.0))))
    }

    pub fn resolve(self, total: Px) -> Option<Px> {
        match self {
            Length::Auto => None,
            Length::Px(px) => Some(px),
            Length::Percent(pct) => Some(total * (pct / 100.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HAlign {
    #[default]
    Left,
    Center,
    Right,
}

impl HAlign {
    pub fn parse(raw: &str) -> Option<HAlign> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" => Some(HAlign::Left),
            "center" | "centre" | "middle" => Some(HAlign::Center),
            "right" => Some(HAlign::Right),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            HAlign::Left => 0,
            HAlign::Center => 1,
            HAlign::Right => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> HAlign {
        match value {
            1 => HAlign::Center,
            2 => HAlign::Right,
            _ => HAlign::Left,
        }
    }

    /// Offset that moves content of `used` width inside a box of `available` width.
    pub fn offset(self, available: Px, used: Px) -> Px {
        let slack = (available - used).max(Px::ZERO);
        match self {
            HAlign::Left => Px::ZERO,
            HAlign::Center => slack / 2,
            HAlign::Right => slack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VAlign {
    #[default]
    Top,
    Middle,
    Bottom,
}

impl VAlign {
    pub fn parse(raw: &str) -> Option<VAlign> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "top" => Some(VAlign::Top),
            "middle" | "center" | "centre" => Some(VAlign::Middle),
            "bottom" => Some(VAlign::Bottom),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            VAlign::Top => 0,
            VAlign::Middle => 1,
            VAlign::Bottom => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> VAlign {
        match value {
            1 => VAlign::Middle,
            2 => VAlign::Bottom,
            _ => VAlign::Top,
        }
    }

    pub fn offset(self, available: Px, used: Px) -> Px {
        let slack = (available - used).max(Px::ZERO);
        match self {
            VAlign::Top => Px::ZERO,
            VAlign::Middle => slack / 2,
            VAlign::Bottom => slack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn px_arithmetic_is_quantized_to_milli() {
        let a = Px::from_f32(1.25);
        let b = Px::from_f32(2.5);
        assert_eq!((a + b).to_milli_i64(), 3750);
        assert_eq!((a - b).to_milli_i64(), -1250);
        assert_eq!(Px::from_i32(7) / 2, Px::from_f32(3.5));
        assert_eq!(Px::from_i32(10).mul_ratio(1, 3).to_milli_i64(), 3333);
    }

    #[test]
    fn colour_strings_parse_hex_and_decimal() {
        assert_eq!(Color::parse("#fff"), Some(Color::WHITE));
        assert_eq!(Color::parse("#000000"), Some(Color::BLACK));
        assert_eq!(
            Color::parse("255,0,0").map(|c| c.to_rgba8()),
            Some([255, 0, 0, 255])
        );
        assert_eq!(
            Color::parse("rgba(0, 128, 0, 128)").map(|c| c.to_rgba8()),
            Some([0, 128, 0, 128])
        );
        assert!(Color::parse("#12").is_none());
        assert!(Color::parse("red").is_none());
    }

    #[test]
    fn lengths_resolve_against_total() {
        let total = Px::from_i32(200);
        assert_eq!(Length::parse("50%").and_then(|l| l.resolve(total)), Some(Px::from_i32(100)));
        assert_eq!(Length::parse("30px").and_then(|l| l.resolve(total)), Some(Px::from_i32(30)));
        assert_eq!(Length::parse("auto").and_then(|l| l.resolve(total)), None);
    }

    #[test]
    fn alignment_offsets_split_slack() {
        let avail = Px::from_i32(100);
        let used = Px::from_i32(40);
        assert_eq!(HAlign::Center.offset(avail, used), Px::from_i32(30));
        assert_eq!(HAlign::Right.offset(avail, used), Px::from_i32(60));
        assert_eq!(VAlign::Bottom.offset(used, avail), Px::ZERO);
    }
}
