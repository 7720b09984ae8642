//! The per-configuration key-event interpreter.
//!
//! One `Keyboard` owns one configuration's keymap and all of its
//! time-sensitive state: the active layer stack, oneshot layers, and the
//! pending tap/hold record. It never touches the sink directly; every
//! effect goes through the [`Output`] capability handed in with each
//! call, so the dispatcher stays in charge of the emission path.

use std::time::Duration;

use keywarp_config::keys::EXTERNAL_MOUSE_BUTTON;
use keywarp_config::{parse_expr, Action, ExprError, Keymap, MacroToken};

/// Capability through which an interpreter acts on the world.
///
/// Both methods are invoked synchronously inside
/// [`Keyboard::process_key_event`].
pub trait Output {
    /// Emit a key press or release towards the sink.
    fn emit_key(&mut self, code: u8, pressed: bool);
    /// Report a layer activation or deactivation.
    fn layer_changed(&mut self, name: &str, active: bool);
}

struct Pending {
    code: u8,
    layer: usize,
    tap: u8,
    deadline: Duration,
}

/// What releasing a tracked physical key should undo.
enum ActiveKind {
    /// Release the code the press emitted.
    Emitted(u8),
    /// Deactivate a hold-activated layer.
    HeldLayer(usize),
    /// Overload still undecided; release resolves it as a tap.
    Pending,
    /// Overload resolved as a hold; release deactivates the layer.
    OverloadHold(usize),
    /// Nothing to undo (macros, toggles, oneshot activations).
    Silent,
}

struct ActiveKey {
    code: u8,
    kind: ActiveKind,
}

pub struct Keyboard {
    keymap: Keymap,
    /// Hold- and toggle-activated layers, most recent last.
    overlays: Vec<usize>,
    /// Layers active for exactly one following key press.
    oneshot: Vec<usize>,
    pending: Option<Pending>,
    /// Physical keys currently down, with what their release must undo.
    /// Kept so releases stay symmetric even after layer state changed.
    active_keys: Vec<ActiveKey>,
}

impl Keyboard {
    pub fn new(keymap: Keymap) -> Self {
        Self {
            keymap,
            overlays: Vec::new(),
            oneshot: Vec::new(),
            pending: None,
            active_keys: Vec::new(),
        }
    }

    /// Feeds one key event (or, for code 0, a timer tick) through the
    /// interpreter. Returns the desired next-wakeup timeout in
    /// milliseconds, 0 if no timer is pending.
    pub fn process_key_event(
        &mut self,
        out: &mut dyn Output,
        code: u8,
        pressed: bool,
        now: Duration,
    ) -> u64 {
        if code == 0 && !pressed {
            return self.tick(out, now);
        }

        if code == EXTERNAL_MOUSE_BUTTON {
            // Synthetic button injected for scroll events. It exists to
            // clear oneshot state and settle pending overloads; it never
            // reaches the sink.
            if pressed {
                self.resolve_pending_hold(out);
                self.clear_oneshot(out);
            }
            return self.timeout_hint(now);
        }

        if pressed {
            self.on_press(out, code, now);
        } else {
            self.on_release(out, code);
        }

        self.timeout_hint(now)
    }

    /// Applies a `[layer.]key = action` expression to the keymap.
    pub fn eval(&mut self, expr: &str) -> Result<(), ExprError> {
        let parsed = parse_expr(expr)?;
        self.keymap.apply(&parsed);
        Ok(())
    }

    fn on_press(&mut self, out: &mut dyn Output, code: u8, now: Duration) {
        // A second key while an overload pends settles it as a hold, so
        // the new key is looked up with the overload layer active.
        self.resolve_pending_hold(out);

        let action = self.lookup(code);
        let mut keep_oneshot = false;

        let kind = match action {
            None => {
                out.emit_key(code, true);
                ActiveKind::Emitted(code)
            }
            Some(Action::Key(target)) => {
                out.emit_key(target, true);
                ActiveKind::Emitted(target)
            }
            Some(Action::Layer(name)) => {
                let idx = self.activate(out, &name);
                ActiveKind::HeldLayer(idx)
            }
            Some(Action::Oneshot(name)) => {
                let idx = self.keymap.ensure_layer(&name);
                self.oneshot.push(idx);
                let name = self.keymap.layer(idx).name.clone();
                out.layer_changed(&name, true);
                keep_oneshot = true;
                ActiveKind::Silent
            }
            Some(Action::Toggle(name)) => {
                let idx = self.keymap.ensure_layer(&name);
                let name = self.keymap.layer(idx).name.clone();
                if let Some(pos) = self.overlays.iter().rposition(|&i| i == idx) {
                    self.overlays.remove(pos);
                    out.layer_changed(&name, false);
                } else {
                    self.overlays.push(idx);
                    out.layer_changed(&name, true);
                }
                ActiveKind::Silent
            }
            Some(Action::Overload { layer, tap, timeout }) => {
                let idx = self.keymap.ensure_layer(&layer);
                self.pending = Some(Pending {
                    code,
                    layer: idx,
                    tap,
                    deadline: now + timeout,
                });
                ActiveKind::Pending
            }
            Some(Action::Macro(tokens)) => {
                self.play_macro(out, &tokens);
                ActiveKind::Silent
            }
        };

        self.active_keys.push(ActiveKey { code, kind });

        if !keep_oneshot {
            self.clear_oneshot(out);
        }
    }

    fn on_release(&mut self, out: &mut dyn Output, code: u8) {
        let Some(pos) = self.active_keys.iter().position(|k| k.code == code) else {
            // Pressed before we started tracking it (e.g. held across a
            // reload); pass the release through.
            out.emit_key(code, false);
            return;
        };

        match self.active_keys.remove(pos).kind {
            ActiveKind::Emitted(target) => out.emit_key(target, false),
            ActiveKind::HeldLayer(idx) | ActiveKind::OverloadHold(idx) => {
                self.deactivate(out, idx);
            }
            ActiveKind::Pending => {
                if let Some(pending) = self.pending.take() {
                    out.emit_key(pending.tap, true);
                    out.emit_key(pending.tap, false);
                }
            }
            ActiveKind::Silent => {}
        }
    }

    fn tick(&mut self, out: &mut dyn Output, now: Duration) -> u64 {
        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            self.resolve_pending_hold(out);
        }
        self.timeout_hint(now)
    }

    fn timeout_hint(&self, now: Duration) -> u64 {
        match &self.pending {
            Some(pending) if pending.deadline > now => {
                (pending.deadline - now).as_millis().max(1) as u64
            }
            Some(_) => 1,
            None => 0,
        }
    }

    fn lookup(&self, code: u8) -> Option<Action> {
        for &idx in self.overlays.iter().rev() {
            if let Some(action) = self.keymap.layer(idx).get(code) {
                return Some(action.clone());
            }
        }
        for &idx in self.oneshot.iter().rev() {
            if let Some(action) = self.keymap.layer(idx).get(code) {
                return Some(action.clone());
            }
        }
        self.keymap.layer(Keymap::MAIN).get(code).cloned()
    }

    fn activate(&mut self, out: &mut dyn Output, name: &str) -> usize {
        let idx = self.keymap.ensure_layer(name);
        self.overlays.push(idx);
        let name = self.keymap.layer(idx).name.clone();
        out.layer_changed(&name, true);
        idx
    }

    fn deactivate(&mut self, out: &mut dyn Output, idx: usize) {
        if let Some(pos) = self.overlays.iter().rposition(|&i| i == idx) {
            self.overlays.remove(pos);
        }
        let name = self.keymap.layer(idx).name.clone();
        out.layer_changed(&name, false);
    }

    fn resolve_pending_hold(&mut self, out: &mut dyn Output) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.overlays.push(pending.layer);
        let name = self.keymap.layer(pending.layer).name.clone();
        out.layer_changed(&name, true);

        if let Some(entry) = self
            .active_keys
            .iter_mut()
            .find(|k| k.code == pending.code)
        {
            entry.kind = ActiveKind::OverloadHold(pending.layer);
        }
    }

    fn clear_oneshot(&mut self, out: &mut dyn Output) {
        for idx in std::mem::take(&mut self.oneshot) {
            let name = self.keymap.layer(idx).name.clone();
            out.layer_changed(&name, false);
        }
    }

    fn play_macro(&mut self, out: &mut dyn Output, tokens: &[MacroToken]) {
        for token in tokens {
            match token {
                MacroToken::Stroke { mods, code } => {
                    let mods: Vec<u8> = mods.codes().collect();
                    for &m in &mods {
                        out.emit_key(m, true);
                    }
                    out.emit_key(*code, true);
                    out.emit_key(*code, false);
                    for &m in mods.iter().rev() {
                        out.emit_key(m, false);
                    }
                }
                // Part of the expansion, but the single-threaded emission
                // path writes strokes back-to-back.
                MacroToken::Delay(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keywarp_config::Config;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Out {
        Key(u8, bool),
        Layer(String, bool),
    }

    #[derive(Default)]
    struct Recorder(Vec<Out>);

    impl Output for Recorder {
        fn emit_key(&mut self, code: u8, pressed: bool) {
            self.0.push(Out::Key(code, pressed));
        }

        fn layer_changed(&mut self, name: &str, active: bool) {
            self.0.push(Out::Layer(name.to_owned(), active));
        }
    }

    fn kbd(text: &str) -> Keyboard {
        let config = Config::parse("test.conf", text).unwrap();
        Keyboard::new(Keymap::from_config(&config))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    const NAV_CONF: &str = r#"
        bind "capslock" "overload(nav, esc, 200)"
        layer "nav" {
            bind "h" "left"
        }
    "#;

    #[test]
    fn unbound_key_passes_through() {
        let mut kbd = kbd("");
        let mut out = Recorder::default();

        assert_eq!(kbd.process_key_event(&mut out, 30, true, ms(0)), 0);
        kbd.process_key_event(&mut out, 30, false, ms(5));
        assert_eq!(out.0, vec![Out::Key(30, true), Out::Key(30, false)]);
    }

    #[test]
    fn simple_remap() {
        let mut kbd = kbd(r#"bind "capslock" "esc""#);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 58, true, ms(0));
        kbd.process_key_event(&mut out, 58, false, ms(5));
        assert_eq!(out.0, vec![Out::Key(1, true), Out::Key(1, false)]);
    }

    #[test]
    fn overload_tap() {
        let mut kbd = kbd(NAV_CONF);
        let mut out = Recorder::default();

        let timeout = kbd.process_key_event(&mut out, 58, true, ms(0));
        assert_eq!(timeout, 200);
        assert_eq!(out.0, vec![]);

        kbd.process_key_event(&mut out, 58, false, ms(50));
        assert_eq!(out.0, vec![Out::Key(1, true), Out::Key(1, false)]);
    }

    #[test]
    fn overload_hold_by_timeout() {
        let mut kbd = kbd(NAV_CONF);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 58, true, ms(0));
        // Tick past the deadline resolves the hold.
        let timeout = kbd.process_key_event(&mut out, 0, false, ms(250));
        assert_eq!(timeout, 0);
        assert_eq!(out.0, vec![Out::Layer("nav".to_owned(), true)]);

        out.0.clear();
        kbd.process_key_event(&mut out, 35, true, ms(260));
        kbd.process_key_event(&mut out, 35, false, ms(270));
        kbd.process_key_event(&mut out, 58, false, ms(280));
        assert_eq!(
            out.0,
            vec![
                Out::Key(105, true),
                Out::Key(105, false),
                Out::Layer("nav".to_owned(), false),
            ]
        );
    }

    #[test]
    fn overload_hold_by_second_key() {
        let mut kbd = kbd(NAV_CONF);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 58, true, ms(0));
        kbd.process_key_event(&mut out, 35, true, ms(20));
        assert_eq!(
            out.0,
            vec![Out::Layer("nav".to_owned(), true), Out::Key(105, true)]
        );
    }

    #[test]
    fn tick_without_pending_is_a_noop() {
        let mut kbd = kbd(NAV_CONF);
        let mut out = Recorder::default();

        assert_eq!(kbd.process_key_event(&mut out, 0, false, ms(100)), 0);
        assert_eq!(out.0, vec![]);
    }

    #[test]
    fn oneshot_applies_to_exactly_one_press() {
        let mut kbd = kbd(
            r#"
            bind "rightalt" "oneshot(sym)"
            layer "sym" {
                bind "f" "1"
            }
            "#,
        );
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 100, true, ms(0));
        kbd.process_key_event(&mut out, 100, false, ms(10));
        assert_eq!(out.0, vec![Out::Layer("sym".to_owned(), true)]);

        out.0.clear();
        kbd.process_key_event(&mut out, 33, true, ms(20));
        assert_eq!(
            out.0,
            vec![Out::Key(2, true), Out::Layer("sym".to_owned(), false)]
        );

        out.0.clear();
        kbd.process_key_event(&mut out, 33, false, ms(30));
        kbd.process_key_event(&mut out, 33, true, ms(40));
        kbd.process_key_event(&mut out, 33, false, ms(50));
        assert_eq!(
            out.0,
            vec![Out::Key(2, false), Out::Key(33, true), Out::Key(33, false)]
        );
    }

    #[test]
    fn scroll_button_clears_oneshot_without_emitting() {
        let mut kbd = kbd(r#"bind "rightalt" "oneshot(sym)""#);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 100, true, ms(0));
        kbd.process_key_event(&mut out, 100, false, ms(10));
        out.0.clear();

        kbd.process_key_event(&mut out, EXTERNAL_MOUSE_BUTTON, true, ms(20));
        kbd.process_key_event(&mut out, EXTERNAL_MOUSE_BUTTON, false, ms(30));
        assert_eq!(out.0, vec![Out::Layer("sym".to_owned(), false)]);
    }

    #[test]
    fn release_stays_symmetric_across_layer_changes() {
        let mut kbd = kbd(
            r#"
            bind "space" "layer(nav)"
            layer "nav" {
                bind "h" "left"
            }
            "#,
        );
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 57, true, ms(0));
        kbd.process_key_event(&mut out, 35, true, ms(10));
        kbd.process_key_event(&mut out, 57, false, ms(20));
        // The layer is gone, but h still owes a `left` release.
        kbd.process_key_event(&mut out, 35, false, ms(30));

        assert_eq!(
            out.0,
            vec![
                Out::Layer("nav".to_owned(), true),
                Out::Key(105, true),
                Out::Layer("nav".to_owned(), false),
                Out::Key(105, false),
            ]
        );
    }

    #[test]
    fn toggle_flips_layer_state() {
        let mut kbd = kbd(r#"bind "scrolllock" "toggle(game)""#);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 70, true, ms(0));
        kbd.process_key_event(&mut out, 70, false, ms(10));
        kbd.process_key_event(&mut out, 70, true, ms(20));
        kbd.process_key_event(&mut out, 70, false, ms(30));

        assert_eq!(
            out.0,
            vec![
                Out::Layer("game".to_owned(), true),
                Out::Layer("game".to_owned(), false),
            ]
        );
    }

    #[test]
    fn macro_expansion() {
        let mut kbd = kbd(r#"bind "f1" "macro(C-t h)""#);
        let mut out = Recorder::default();

        kbd.process_key_event(&mut out, 59, true, ms(0));
        kbd.process_key_event(&mut out, 59, false, ms(10));

        assert_eq!(
            out.0,
            vec![
                Out::Key(29, true),
                Out::Key(20, true),
                Out::Key(20, false),
                Out::Key(29, false),
                Out::Key(35, true),
                Out::Key(35, false),
            ]
        );
    }

    #[test]
    fn eval_binds_at_runtime() {
        let mut kbd = kbd("");
        let mut out = Recorder::default();

        kbd.eval("capslock = esc").unwrap();
        assert!(kbd.eval("nosuchkey = esc").is_err());

        kbd.process_key_event(&mut out, 58, true, ms(0));
        assert_eq!(out.0, vec![Out::Key(1, true)]);
    }
}
