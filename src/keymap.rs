//! Key and qualifier names accepted by `key=` / `qualifier=` attributes.

pub const QUAL_SHIFT: u8 = 0x01;
pub const QUAL_CTRL: u8 = 0x02;
pub const QUAL_ALT: u8 = 0x04;
pub const QUAL_META: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyBinding {
    pub key: u16,
    pub qualifiers: u8,
}

const NAMED_KEYS: &[(&str, u16)] = &[
    ("backspace", 0x08),
    ("tab", 0x09),
    ("enter", 0x0D),
    ("return", 0x0D),
    ("escape", 0x1B),
    ("esc", 0x1B),
    ("space", 0x20),
    ("delete", 0x7F),
    ("insert", 0x100),
    ("home", 0x101),
    ("end", 0x102),
    ("page_up", 0x103),
    ("pageup", 0x103),
    ("page_down", 0x104),
    ("pagedown", 0x104),
    ("up", 0x105),
    ("down", 0x106),
    ("left", 0x107),
    ("right", 0x108),
    ("print", 0x109),
    ("pause", 0x10A),
    ("menu", 0x10B),
    ("help", 0x10C),
];

const FUNCTION_KEY_BASE: u16 = 0x200;

/// Resolves a key name (`"F5"`, `"page_down"`, `"q"`, `"7"`) to its key code.
pub fn resolve_key(name: &str) -> Option<u16> {
    let lower = name.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    if let Some((_, code)) = NAMED_KEYS.iter().find(|(key, _)| *key == lower) {
        return Some(*code);
    }
    if let Some(number) = lower.strip_prefix('f') {
        if let Ok(n) = number.parse::<u16>() {
            if (1..=24).contains(&n) {
                return Some(FUNCTION_KEY_BASE + n);
            }
        }
    }
    let mut chars = lower.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii_alphanumeric() || ch.is_ascii_punctuation() => {
            Some(ch.to_ascii_uppercase() as u16)
        }
        _ => None,
    }
}

/// Resolves a qualifier list such as `"ctrl+shift"` or `"alt, meta"`. Unknown names fail the
/// whole list.
pub fn resolve_qualifiers(list: &str) -> Option<u8> {
    let mut mask = 0u8;
    for part in list.split(['+', ',', '|', ' ']).filter(|p| !p.is_empty()) {
        mask |= match part.to_ascii_lowercase().as_str() {
            "shift" | "lshift" | "rshift" => QUAL_SHIFT,
            "ctrl" | "control" | "lctrl" | "rctrl" => QUAL_CTRL,
            "alt" | "lalt" | "ralt" | "option" => QUAL_ALT,
            "meta" | "cmd" | "command" | "super" => QUAL_META,
            _ => return None,
        };
    }
    Some(mask)
}

pub fn resolve_binding(key: &str, qualifiers: Option<&str>) -> Option<KeyBinding> {
    let key = resolve_key(key)?;
    let qualifiers = match qualifiers {
        Some(list) => resolve_qualifiers(list)?,
        None => 0,
    };
    Some(KeyBinding { key, qualifiers })
}
