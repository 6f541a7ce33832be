//! Keypad buttons bound to remote actions.
//!
//! A button never talks to the remote itself. [`Button::show_icon`] turns the
//! session state into a render instruction and [`Button::press`] turns a key
//! press into an [`Action`] once its preconditions hold; the engine carries
//! both out.

use crate::device::{IconHandle, KeyPos};
use crate::state::SessionState;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// Groups of buttons redrawn together.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ButtonClass: u32 {
        const LIVE = 1 << 0;
        const PREVIEW = 1 << 1;
        const CUT = 1 << 2;
        const AUTO = 1 << 3;
        const FTB = 1 << 4;
        const TRANSITION = 1 << 5;
        const RECORD = 1 << 6;
        const SOURCES = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonKind {
    SceneLive,
    ScenePreview,
    Cut,
    Auto,
    FadeToBlack,
    Transition,
    Source,
    ToggleRecord,
    ToggleStream,
    ToggleVirtualCam,
}

impl ButtonKind {
    pub fn from_function(function: &str) -> Option<Self> {
        Some(match function {
            "scene-live" => ButtonKind::SceneLive,
            "scene-preview" => ButtonKind::ScenePreview,
            "scene-cut" => ButtonKind::Cut,
            "scene-auto" => ButtonKind::Auto,
            "ftb" => ButtonKind::FadeToBlack,
            "transition" => ButtonKind::Transition,
            "source" => ButtonKind::Source,
            "record" => ButtonKind::ToggleRecord,
            "stream" => ButtonKind::ToggleStream,
            "virtualcam" => ButtonKind::ToggleVirtualCam,
            _ => return None,
        })
    }

    pub fn class(self) -> ButtonClass {
        match self {
            ButtonKind::SceneLive => ButtonClass::LIVE,
            ButtonKind::ScenePreview => ButtonClass::PREVIEW,
            ButtonKind::Cut => ButtonClass::CUT,
            ButtonKind::Auto => ButtonClass::AUTO,
            ButtonKind::FadeToBlack => ButtonClass::FTB,
            ButtonKind::Transition => ButtonClass::TRANSITION,
            ButtonKind::Source => ButtonClass::SOURCES,
            ButtonKind::ToggleRecord | ButtonKind::ToggleStream | ButtonKind::ToggleVirtualCam => {
                ButtonClass::RECORD
            }
        }
    }

    pub fn uses_ordinal(self) -> bool {
        matches!(
            self,
            ButtonKind::SceneLive
                | ButtonKind::ScenePreview
                | ButtonKind::Transition
                | ButtonKind::Source
        )
    }

    fn needs_studio_mode(self) -> bool {
        matches!(
            self,
            ButtonKind::ScenePreview
                | ButtonKind::Transition
                | ButtonKind::Source
                | ButtonKind::Cut
                | ButtonKind::Auto
        )
    }

    fn usable_during_fade(self) -> bool {
        matches!(
            self,
            ButtonKind::FadeToBlack
                | ButtonKind::SceneLive
                | ButtonKind::ScenePreview
                | ButtonKind::ToggleRecord
                | ButtonKind::ToggleStream
                | ButtonKind::ToggleVirtualCam
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelStyle {
    pub font: String,
    pub color: String,
    /// Anchor of the text as fractions of the key size.
    pub center: (f64, f64),
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            font: "Sans".to_string(),
            color: "white".to_string(),
            center: (0.5, 0.5),
        }
    }
}

/// Icons shared by all buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonIcons {
    /// Shown on every key while the remote is unreachable.
    pub offline: IconHandle,
    /// Fallback for keys that cannot act right now.
    pub unused: IconHandle,
    pub live_unused: IconHandle,
    pub preview_unused: IconHandle,
    pub source_unused: IconHandle,
    pub transition_unused: IconHandle,
}

impl CommonIcons {
    /// Every kind falls back to the same icon.
    pub fn uniform(offline: IconHandle, unused: IconHandle) -> Self {
        Self {
            offline,
            unused,
            live_unused: unused,
            preview_unused: unused,
            source_unused: unused,
            transition_unused: unused,
        }
    }

    pub fn unused_for(&self, kind: ButtonKind) -> IconHandle {
        match kind {
            ButtonKind::SceneLive => self.live_unused,
            ButtonKind::ScenePreview => self.preview_unused,
            ButtonKind::Source => self.source_unused,
            ButtonKind::Transition => self.transition_unused,
            _ => self.unused,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderInstruction {
    Icon(IconHandle),
    Label {
        background: IconHandle,
        lines: Vec<String>,
        font: String,
        color: String,
        anchor: (f64, f64),
    },
}

/// What a key press asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetProgram(String),
    SetPreview(String),
    /// Fade-to-black is active: only change the scene that will be restored.
    SaveFadeScene(String),
    Cut,
    Auto,
    ToggleFadeToBlack,
    SetTransition(String),
    SetSourceEnabled {
        scene: String,
        item_id: i64,
        enabled: bool,
    },
    ToggleRecord,
    ToggleStream,
    ToggleVirtualCam,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub kind: ButtonKind,
    pub pos: KeyPos,
    pub ordinal: u32,
    pub active_icon: IconHandle,
    pub inactive_icon: IconHandle,
    pub label: LabelStyle,
    /// Fade-to-black animation frames.
    pub frames: Vec<IconHandle>,
}

impl Button {
    pub fn new(
        kind: ButtonKind,
        pos: KeyPos,
        ordinal: u32,
        active: IconHandle,
        inactive: IconHandle,
    ) -> Self {
        Self {
            kind,
            pos,
            ordinal,
            active_icon: active,
            inactive_icon: inactive,
            label: LabelStyle::default(),
            frames: Vec::new(),
        }
    }

    fn icon(&self, active: bool) -> RenderInstruction {
        RenderInstruction::Icon(if active {
            self.active_icon
        } else {
            self.inactive_icon
        })
    }

    fn label(&self, active: bool, text: &str) -> RenderInstruction {
        RenderInstruction::Label {
            background: if active {
                self.active_icon
            } else {
                self.inactive_icon
            },
            lines: text.split('\n').map(str::to_owned).collect(),
            font: self.label.font.clone(),
            color: self.label.color.clone(),
            anchor: self.label.center,
        }
    }

    /// Pure function of the session state.
    pub fn show_icon(&self, state: &SessionState, common: &CommonIcons) -> RenderInstruction {
        if !state.connected {
            return RenderInstruction::Icon(common.offline);
        }
        let unused = RenderInstruction::Icon(common.unused_for(self.kind));
        let enabled = (!self.kind.needs_studio_mode() || state.studio_mode)
            && (!state.ftb.active || self.kind.usable_during_fade());

        match self.kind {
            ButtonKind::SceneLive => match state.scenes.name(self.ordinal) {
                Some(name) => self.label(name == state.live_scene(), name),
                None => unused,
            },
            ButtonKind::ScenePreview => match state.scenes.name(self.ordinal) {
                Some(name) if enabled => self.label(name == state.preview_scene, name),
                _ => unused,
            },
            ButtonKind::Transition => match state.transitions.name(self.ordinal) {
                Some(name) if enabled => self.label(name == state.transition, name),
                _ => unused,
            },
            ButtonKind::Source => match state.sources.get(self.ordinal) {
                Some(source) if enabled => self.label(source.enabled, &source.name),
                _ => unused,
            },
            ButtonKind::Cut => self.icon(enabled),
            ButtonKind::Auto => {
                if enabled {
                    self.label(true, &format_duration(state.transition_ms))
                } else {
                    self.icon(false)
                }
            }
            ButtonKind::FadeToBlack => {
                if !state.can_fade_to_black() {
                    unused
                } else if state.ftb.active {
                    match self.frames.get(state.ftb.frame_index(self.frames.len())) {
                        Some(&frame) => RenderInstruction::Icon(frame),
                        None => self.icon(true),
                    }
                } else {
                    self.icon(false)
                }
            }
            ButtonKind::ToggleRecord => self.icon(state.recording),
            ButtonKind::ToggleStream => self.icon(state.streaming),
            ButtonKind::ToggleVirtualCam => self.icon(state.virtualcam),
        }
    }

    /// Checks preconditions. `None` means the press is ignored.
    pub fn press(&self, state: &SessionState) -> Option<Action> {
        if !state.connected {
            return None;
        }
        if self.kind.needs_studio_mode() && !state.studio_mode {
            return None;
        }
        if state.ftb.active && !self.kind.usable_during_fade() {
            return None;
        }

        let action = match self.kind {
            ButtonKind::SceneLive => {
                let name = state.scenes.name(self.ordinal)?.to_string();
                if state.ftb.active && !state.studio_mode {
                    Action::SaveFadeScene(name)
                } else {
                    Action::SetProgram(name)
                }
            }
            ButtonKind::ScenePreview => {
                Action::SetPreview(state.scenes.name(self.ordinal)?.to_string())
            }
            ButtonKind::Cut => Action::Cut,
            ButtonKind::Auto => Action::Auto,
            ButtonKind::FadeToBlack if state.can_fade_to_black() => Action::ToggleFadeToBlack,
            ButtonKind::FadeToBlack => return None,
            ButtonKind::Transition => {
                let name = state.transitions.name(self.ordinal)?;
                if name == state.transition {
                    return None;
                }
                Action::SetTransition(name.to_string())
            }
            ButtonKind::Source => {
                let source = state.sources.get(self.ordinal)?;
                Action::SetSourceEnabled {
                    scene: state.sources.scene().to_string(),
                    item_id: source.item_id,
                    enabled: !source.enabled,
                }
            }
            ButtonKind::ToggleRecord => Action::ToggleRecord,
            ButtonKind::ToggleStream => Action::ToggleStream,
            ButtonKind::ToggleVirtualCam => Action::ToggleVirtualCam,
        };
        Some(action)
    }
}

/// `1500` -> `"1.5s"`, `300` -> `"0.3s"`.
pub fn format_duration(ms: u32) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else if ms % 100 == 0 {
        format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
    } else {
        format!("{ms}ms")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ButtonId(pub usize);

/// All configured buttons. Created once; never shrinks.
#[derive(Debug, Default)]
pub struct ButtonRegistry {
    buttons: Vec<Button>,
    by_ordinal: HashMap<(ButtonKind, u32), Vec<ButtonId>>,
    by_pos: HashMap<KeyPos, ButtonId>,
}

impl ButtonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A later button on the same key replaces the earlier one for presses.
    pub fn add(&mut self, button: Button) -> ButtonId {
        let id = ButtonId(self.buttons.len());
        if button.kind.uses_ordinal() {
            self.by_ordinal
                .entry((button.kind, button.ordinal))
                .or_default()
                .push(id);
        }
        self.by_pos.insert(button.pos, id);
        self.buttons.push(button);
        id
    }

    pub fn len(&self) -> usize {
        self.buttons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }

    pub fn get(&self, id: ButtonId) -> Option<&Button> {
        self.buttons.get(id.0)
    }

    pub fn at(&self, pos: KeyPos) -> Option<ButtonId> {
        self.by_pos.get(&pos).copied()
    }

    pub fn in_class(&self, classes: ButtonClass) -> impl Iterator<Item = ButtonId> + '_ {
        self.buttons
            .iter()
            .enumerate()
            .filter(move |(_, b)| classes.intersects(b.kind.class()))
            .map(|(idx, _)| ButtonId(idx))
    }

    /// Every button of `kind` bound to `ordinal`.
    pub fn with_ordinal(&self, kind: ButtonKind, ordinal: u32) -> &[ButtonId] {
        self.by_ordinal
            .get(&(kind, ordinal))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
