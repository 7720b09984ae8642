//! Binding actions and the textual binding-expression parser.
//!
//! The same action syntax appears in two places: as the second argument
//! of `bind` nodes in configuration files, and on the right-hand side of
//! the `[layer.]key = action` expressions accepted by the control
//! socket's bind command.

use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;

use crate::keys;

bitflags! {
    /// Modifier prefixes understood inside macro tokens.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers : u8 {
        const CTRL = 1;
        const ALT = 1 << 1;
        const SHIFT = 1 << 2;
        const SUPER = 1 << 3;
        const ALTGR = 1 << 4;
    }
}

impl Modifiers {
    /// Keycodes that realize these modifiers, in a fixed press order.
    pub fn codes(self) -> impl Iterator<Item = u8> {
        [
            (Self::CTRL, 29u8),
            (Self::ALT, 56),
            (Self::SHIFT, 42),
            (Self::SUPER, 125),
            (Self::ALTGR, 100),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, code)| code)
    }
}

/// A key name resolved to its keycode during config decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec(pub u8);

impl FromStr for KeySpec {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        keys::keycode(s)
            .map(KeySpec)
            .ok_or_else(|| ExprError::UnknownKey(s.to_owned()))
    }
}

/// One element of a macro expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroToken {
    /// Press (with modifiers held) and release one key.
    Stroke {
        /// Modifiers wrapped around the stroke.
        mods: Modifiers,
        /// The key itself.
        code: u8,
    },
    /// Pause between strokes.
    Delay(Duration),
}

/// What a bound key does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Emit a different (or the same) keycode.
    Key(u8),
    /// Activate a layer while held.
    Layer(String),
    /// Activate a layer for exactly one following key press.
    Oneshot(String),
    /// Flip a layer on or off on each press.
    Toggle(String),
    /// Tap/hold: a layer when held, a key when tapped.
    Overload {
        /// Layer activated while the key is held.
        layer: String,
        /// Keycode emitted when the key is tapped.
        tap: u8,
        /// How long a press may pend before it resolves as a hold.
        timeout: Duration,
    },
    /// Emit a sequence of strokes.
    Macro(Vec<MacroToken>),
}

impl FromStr for Action {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some((name, args)) = split_call(s) {
            return match name {
                "layer" => Ok(Action::Layer(single_arg(args)?.to_owned())),
                "oneshot" => Ok(Action::Oneshot(single_arg(args)?.to_owned())),
                "toggle" => Ok(Action::Toggle(single_arg(args)?.to_owned())),
                "overload" => {
                    let mut parts = args.splitn(3, ',').map(str::trim);
                    let layer = parts.next().filter(|p| !p.is_empty());
                    let tap = parts.next();
                    let timeout = parts.next();
                    let (Some(layer), Some(tap), Some(timeout)) = (layer, tap, timeout) else {
                        return Err(ExprError::Malformed(
                            "overload takes (layer, key, timeout_ms)",
                        ));
                    };

                    let tap = KeySpec::from_str(tap)?.0;
                    let timeout = timeout
                        .parse::<u64>()
                        .map_err(|_| ExprError::Malformed("overload timeout must be an integer"))?;

                    Ok(Action::Overload {
                        layer: layer.to_owned(),
                        tap,
                        timeout: Duration::from_millis(timeout),
                    })
                }
                "macro" => Ok(Action::Macro(parse_macro(args)?)),
                _ => Err(ExprError::UnknownAction(name.to_owned())),
            };
        }

        Ok(Action::Key(KeySpec::from_str(s)?.0))
    }
}

/// A parsed `[layer.]key = action` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingExpr {
    /// Target layer; `None` means the main layer.
    pub layer: Option<String>,
    /// The physical key being bound.
    pub key: u8,
    /// What the key does.
    pub action: Action,
}

/// Parses a textual binding expression.
pub fn parse_expr(expr: &str) -> Result<BindingExpr, ExprError> {
    let (lhs, rhs) = expr
        .split_once('=')
        .ok_or(ExprError::Malformed("expected `[layer.]key = action`"))?;

    let lhs = lhs.trim();
    let (layer, key) = match lhs.split_once('.') {
        Some((layer, key)) if !layer.is_empty() => (Some(layer.to_owned()), key),
        Some(_) => return Err(ExprError::Malformed("empty layer name")),
        None => (None, lhs),
    };

    Ok(BindingExpr {
        layer,
        key: KeySpec::from_str(key.trim())?.0,
        action: rhs.parse()?,
    })
}

fn split_call(s: &str) -> Option<(&str, &str)> {
    let open = s.find('(')?;
    let args = s[open..].strip_prefix('(')?.strip_suffix(')')?;
    Some((&s[..open], args))
}

fn single_arg(args: &str) -> Result<&str, ExprError> {
    let arg = args.trim();
    if arg.is_empty() || arg.contains(',') {
        return Err(ExprError::Malformed("expected exactly one argument"));
    }
    Ok(arg)
}

fn parse_macro(args: &str) -> Result<Vec<MacroToken>, ExprError> {
    let mut tokens = Vec::new();

    for word in args.split_whitespace() {
        if let Some(ms) = word.strip_suffix("ms") {
            if let Ok(ms) = ms.parse::<u64>() {
                tokens.push(MacroToken::Delay(Duration::from_millis(ms)));
                continue;
            }
        }

        let mut mods = Modifiers::empty();
        let mut rest = word;
        while rest.len() > 2 && rest.as_bytes()[1] == b'-' {
            mods |= match rest.as_bytes()[0] {
                b'C' => Modifiers::CTRL,
                b'A' => Modifiers::ALT,
                b'S' => Modifiers::SHIFT,
                b'M' => Modifiers::SUPER,
                b'G' => Modifiers::ALTGR,
                other => return Err(ExprError::UnknownModifier(other as char)),
            };
            rest = &rest[2..];
        }

        tokens.push(MacroToken::Stroke {
            mods,
            code: KeySpec::from_str(rest)?.0,
        });
    }

    if tokens.is_empty() {
        return Err(ExprError::Malformed("empty macro"));
    }

    Ok(tokens)
}

/// Error produced by the binding-expression parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// A key name did not resolve.
    UnknownKey(String),
    /// An action keyword did not resolve.
    UnknownAction(String),
    /// A macro token used an unknown modifier prefix.
    UnknownModifier(char),
    /// The expression shape itself was wrong.
    Malformed(&'static str),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(name) => write!(f, "unknown key: {name}"),
            Self::UnknownAction(name) => write!(f, "unknown action: {name}"),
            Self::UnknownModifier(ch) => write!(f, "unknown modifier prefix: {ch}-"),
            Self::Malformed(what) => write!(f, "malformed expression: {what}"),
        }
    }
}

impl Error for ExprError {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_key_remap() {
        assert_eq!(
            parse_expr("capslock = esc").unwrap(),
            BindingExpr {
                layer: None,
                key: 58,
                action: Action::Key(1),
            }
        );
    }

    #[test]
    fn layer_qualified_key() {
        let expr = parse_expr("nav.h = left").unwrap();
        assert_eq!(expr.layer.as_deref(), Some("nav"));
        assert_eq!(expr.key, 35);
        assert_eq!(expr.action, Action::Key(105));
    }

    #[test]
    fn overload_action() {
        let expr = parse_expr("capslock = overload(nav, esc, 200)").unwrap();
        assert_eq!(
            expr.action,
            Action::Overload {
                layer: "nav".to_owned(),
                tap: 1,
                timeout: Duration::from_millis(200),
            }
        );
    }

    #[test]
    fn macro_with_modifiers_and_delay() {
        let expr = parse_expr("f1 = macro(C-t 50ms h i)").unwrap();
        assert_eq!(
            expr.action,
            Action::Macro(vec![
                MacroToken::Stroke {
                    mods: Modifiers::CTRL,
                    code: 20,
                },
                MacroToken::Delay(Duration::from_millis(50)),
                MacroToken::Stroke {
                    mods: Modifiers::empty(),
                    code: 35,
                },
                MacroToken::Stroke {
                    mods: Modifiers::empty(),
                    code: 23,
                },
            ])
        );
    }

    #[test]
    fn chained_modifiers() {
        let Action::Macro(tokens) = "macro(C-S-t)".parse::<Action>().unwrap() else {
            panic!("expected a macro");
        };
        assert_eq!(
            tokens,
            vec![MacroToken::Stroke {
                mods: Modifiers::CTRL | Modifiers::SHIFT,
                code: 20,
            }]
        );
    }

    #[test]
    fn errors_carry_the_offending_token() {
        assert_eq!(
            parse_expr("nosuchkey = a"),
            Err(ExprError::UnknownKey("nosuchkey".to_owned()))
        );
        assert_eq!(
            parse_expr("a = frobnicate(x)"),
            Err(ExprError::UnknownAction("frobnicate".to_owned()))
        );
        assert!(parse_expr("a").is_err());
    }
}
