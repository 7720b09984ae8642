//! Key name table.
//!
//! Maps the lowercase names used in configuration files and binding
//! expressions to Linux input keycodes. Names follow the kernel's
//! `KEY_*` constants with the prefix dropped; a handful of aliases cover
//! the spellings people actually type.

/// Keycode reserved for the synthetic button injected on scroll events.
///
/// It sits above every keycode the sink advertises, so it can never be
/// emitted; it only exists to run oneshot/overload clearing logic inside
/// an interpreter.
pub const EXTERNAL_MOUSE_BUTTON: u8 = 255;

static NAMES: &[(&str, u8)] = &[
    ("esc", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("minus", 12),
    ("equal", 13),
    ("backspace", 14),
    ("tab", 15),
    ("q", 16),
    ("w", 17),
    ("e", 18),
    ("r", 19),
    ("t", 20),
    ("y", 21),
    ("u", 22),
    ("i", 23),
    ("o", 24),
    ("p", 25),
    ("leftbrace", 26),
    ("rightbrace", 27),
    ("enter", 28),
    ("leftcontrol", 29),
    ("a", 30),
    ("s", 31),
    ("d", 32),
    ("f", 33),
    ("g", 34),
    ("h", 35),
    ("j", 36),
    ("k", 37),
    ("l", 38),
    ("semicolon", 39),
    ("apostrophe", 40),
    ("grave", 41),
    ("leftshift", 42),
    ("backslash", 43),
    ("z", 44),
    ("x", 45),
    ("c", 46),
    ("v", 47),
    ("b", 48),
    ("n", 49),
    ("m", 50),
    ("comma", 51),
    ("dot", 52),
    ("slash", 53),
    ("rightshift", 54),
    ("kpasterisk", 55),
    ("leftalt", 56),
    ("space", 57),
    ("capslock", 58),
    ("f1", 59),
    ("f2", 60),
    ("f3", 61),
    ("f4", 62),
    ("f5", 63),
    ("f6", 64),
    ("f7", 65),
    ("f8", 66),
    ("f9", 67),
    ("f10", 68),
    ("numlock", 69),
    ("scrolllock", 70),
    ("kp7", 71),
    ("kp8", 72),
    ("kp9", 73),
    ("kpminus", 74),
    ("kp4", 75),
    ("kp5", 76),
    ("kp6", 77),
    ("kpplus", 78),
    ("kp1", 79),
    ("kp2", 80),
    ("kp3", 81),
    ("kp0", 82),
    ("kpdot", 83),
    ("f11", 87),
    ("f12", 88),
    ("kpenter", 96),
    ("rightcontrol", 97),
    ("kpslash", 98),
    ("rightalt", 100),
    ("home", 102),
    ("up", 103),
    ("pageup", 104),
    ("left", 105),
    ("right", 106),
    ("end", 107),
    ("down", 108),
    ("pagedown", 109),
    ("insert", 110),
    ("delete", 111),
    ("mute", 113),
    ("volumedown", 114),
    ("volumeup", 115),
    ("pause", 119),
    ("leftmeta", 125),
    ("rightmeta", 126),
    ("compose", 127),
    ("print", 99),
    ("menu", 139),
];

static ALIASES: &[(&str, &str)] = &[
    ("escape", "esc"),
    ("control", "leftcontrol"),
    ("ctrl", "leftcontrol"),
    ("shift", "leftshift"),
    ("alt", "leftalt"),
    ("altgr", "rightalt"),
    ("meta", "leftmeta"),
    ("super", "leftmeta"),
    ("return", "enter"),
    ("period", "dot"),
];

/// Resolves a key name to its keycode.
pub fn keycode(name: &str) -> Option<u8> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, target)| *target);

    NAMES
        .iter()
        .find(|(n, _)| *n == canonical)
        .map(|(_, code)| *code)
}

/// Resolves a keycode back to its canonical name, for diagnostics.
pub fn key_name(code: u8) -> Option<&'static str> {
    NAMES.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_reverse() {
        assert_eq!(keycode("capslock"), Some(58));
        assert_eq!(keycode("a"), Some(30));
        assert_eq!(key_name(58), Some("capslock"));
        assert_eq!(keycode("no-such-key"), None);
    }

    #[test]
    fn aliases_resolve_to_canonical_codes() {
        assert_eq!(keycode("escape"), keycode("esc"));
        assert_eq!(keycode("ctrl"), Some(29));
        assert_eq!(keycode("super"), Some(125));
    }

    #[test]
    fn reverse_mapping_is_canonical() {
        // Aliases never show up in diagnostics.
        assert_eq!(key_name(29), Some("leftcontrol"));
    }
}
