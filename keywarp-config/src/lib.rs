#[macro_use]
extern crate tracing;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use knuffel::errors::DecodeError;
use miette::{Context, IntoDiagnostic};

pub mod binding;
pub mod keys;

pub use crate::binding::{parse_expr, Action, BindingExpr, ExprError, KeySpec, MacroToken, Modifiers};
pub use crate::keys::EXTERNAL_MOUSE_BUTTON;

/// One parsed configuration file.
#[derive(knuffel::Decode, Debug, Default, PartialEq)]
pub struct Config {
    /// Device id patterns this configuration applies to.
    ///
    /// A configuration without a `devices` node applies to any keyboard.
    #[knuffel(child, unwrap(arguments), default)]
    pub devices: Vec<DevicePattern>,
    /// Top-level binds, applied to the main layer.
    #[knuffel(children(name = "bind"))]
    pub binds: Vec<BindDef>,
    /// Named overlay layers.
    #[knuffel(children(name = "layer"))]
    pub layers: Vec<LayerDef>,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct BindDef {
    #[knuffel(argument, str)]
    pub key: KeySpec,
    #[knuffel(argument, str)]
    pub action: Action,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct LayerDef {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(children(name = "bind"))]
    pub binds: Vec<BindDef>,
}

/// A vendor/product pattern from a `devices` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePattern {
    /// `*`: any keyboard.
    Any,
    /// `vvvv:pppp`: one specific device id, in hex.
    Id { vendor: u16, product: u16 },
}

impl FromStr for DevicePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Any);
        }

        let parse = || {
            let (vendor, product) = s.split_once(':')?;
            Some(Self::Id {
                vendor: u16::from_str_radix(vendor, 16).ok()?,
                product: u16::from_str_radix(product, 16).ok()?,
            })
        };
        parse().ok_or_else(|| PatternError(s.to_owned()))
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for DevicePattern {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        if let Some(type_name) = &type_name {
            ctx.emit_error(DecodeError::unexpected(
                type_name,
                "type name",
                "no type name expected for this node",
            ));
        }
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<DevicePattern, DecodeError<S>> {
        match &**val {
            knuffel::ast::Literal::String(ref s) => match s.parse() {
                Ok(pattern) => Ok(pattern),
                Err(err) => {
                    ctx.emit_error(DecodeError::conversion(val, err));
                    Ok(DevicePattern::Any)
                }
            },
            _ => {
                ctx.emit_error(DecodeError::scalar_kind(
                    knuffel::decode::Kind::String,
                    val,
                ));
                Ok(DevicePattern::Any)
            }
        }
    }
}

/// Error parsing a device id pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError(String);

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device pattern {:?}, expected `*` or `vvvv:pppp`", self.0)
    }
}

impl std::error::Error for PatternError {}

/// How strongly a configuration claims a device id.
///
/// Ranks are ordered; a higher rank beats a lower one during matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRank {
    /// No pattern matched.
    None,
    /// A wildcard pattern matched; applies to keyboards only.
    Wildcard,
    /// An explicit id matched; also applies to pointer devices.
    Exact,
}

impl Config {
    /// Loads and parses one configuration file.
    pub fn load(path: &Path) -> miette::Result<Self> {
        debug!("loading config from {:?}", path);

        let contents = fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self::parse(&filename, &contents)
    }

    /// Parses configuration text; the filename only labels diagnostics.
    pub fn parse(filename: &str, text: &str) -> miette::Result<Self> {
        let config = knuffel::parse::<Config>(filename, text).map_err(miette::Report::new)?;
        Ok(config)
    }

    /// Scores a packed `(vendor << 16) | product` device id.
    pub fn check_match(&self, id: u32) -> MatchRank {
        let vendor = (id >> 16) as u16;
        let product = id as u16;

        let mut rank = MatchRank::None;
        for pattern in &self.devices {
            match pattern {
                DevicePattern::Id { vendor: v, product: p } if *v == vendor && *p == product => {
                    return MatchRank::Exact;
                }
                DevicePattern::Id { .. } => {}
                DevicePattern::Any => rank = MatchRank::Wildcard,
            }
        }

        if self.devices.is_empty() {
            rank = MatchRank::Wildcard;
        }

        rank
    }
}

/// One layer's keycode → action table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layer {
    /// Layer name; the main layer is named `main`.
    pub name: String,
    bindings: HashMap<u8, Action>,
}

impl Layer {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: HashMap::new(),
        }
    }

    /// Looks up the action bound to a keycode in this layer.
    pub fn get(&self, code: u8) -> Option<&Action> {
        self.bindings.get(&code)
    }

    /// Binds or rebinds a keycode.
    pub fn set(&mut self, code: u8, action: Action) {
        self.bindings.insert(code, action);
    }
}

/// The complete keymap compiled from one configuration.
///
/// Layer 0 is the always-active main layer; overlay layers follow in
/// declaration order. Actions reference layers by name so bind
/// expressions can target layers created after compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Keymap {
    layers: Vec<Layer>,
}

impl Keymap {
    /// Index of the always-active main layer.
    pub const MAIN: usize = 0;

    /// Compiles a keymap from a parsed configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut main = Layer::new("main");
        for bind in &config.binds {
            main.set(bind.key.0, bind.action.clone());
        }

        let mut layers = vec![main];
        for def in &config.layers {
            let mut layer = Layer::new(&*def.name);
            for bind in &def.binds {
                layer.set(bind.key.0, bind.action.clone());
            }
            layers.push(layer);
        }

        Self { layers }
    }

    pub fn layer(&self, idx: usize) -> &Layer {
        &self.layers[idx]
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|layer| layer.name == name)
    }

    /// Returns the index of the named layer, creating it if needed.
    pub fn ensure_layer(&mut self, name: &str) -> usize {
        if let Some(idx) = self.layer_index(name) {
            return idx;
        }

        self.layers.push(Layer::new(name));
        self.layers.len() - 1
    }

    /// Applies a parsed binding expression.
    pub fn apply(&mut self, expr: &BindingExpr) {
        let idx = match &expr.layer {
            Some(name) => self.ensure_layer(name),
            None => Self::MAIN,
        };
        self.layers[idx].set(expr.key, expr.action.clone());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pattern_parsing() {
        assert_eq!("*".parse::<DevicePattern>(), Ok(DevicePattern::Any));
        assert_eq!(
            "046d:c52b".parse::<DevicePattern>(),
            Ok(DevicePattern::Id {
                vendor: 0x046d,
                product: 0xc52b,
            })
        );
        assert!("046d".parse::<DevicePattern>().is_err());
        assert!("zzzz:0000".parse::<DevicePattern>().is_err());
    }

    #[test]
    fn exact_match_beats_wildcard() {
        let config = Config {
            devices: vec![
                DevicePattern::Any,
                DevicePattern::Id {
                    vendor: 0x046d,
                    product: 0xc52b,
                },
            ],
            ..Default::default()
        };

        assert_eq!(config.check_match(0x046d_c52b), MatchRank::Exact);
        assert_eq!(config.check_match(0x1234_5678), MatchRank::Wildcard);
    }

    #[test]
    fn no_devices_node_means_wildcard() {
        let config = Config::default();
        assert_eq!(config.check_match(0x046d_c52b), MatchRank::Wildcard);
    }

    #[test]
    fn ensure_layer_is_idempotent() {
        let mut keymap = Keymap::from_config(&Config::default());
        let nav = keymap.ensure_layer("nav");
        assert_eq!(keymap.ensure_layer("nav"), nav);
        assert_eq!(keymap.layer_index("nav"), Some(nav));
    }

    #[test]
    fn apply_binds_into_new_layer() {
        let mut keymap = Keymap::from_config(&Config::default());
        keymap.apply(&parse_expr("nav.h = left").unwrap());

        let nav = keymap.layer_index("nav").unwrap();
        assert_eq!(keymap.layer(nav).get(35), Some(&Action::Key(105)));
    }
}
