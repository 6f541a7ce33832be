//! The session engine: sole owner and mutator of [`SessionState`].
//!
//! One consumer thread drains the work queue in order. Every item updates the
//! fields it implicates and redraws only the button classes those fields
//! feed. While fade-to-black runs, the queue wait carries the next animation
//! deadline.

use crate::buttons::{
    Action, ButtonClass, ButtonId, ButtonKind, ButtonRegistry, CommonIcons, RenderInstruction,
};
use crate::device::{Device, IconSet, KeyImage, Remote, Renderer};
use crate::state::SessionState;
use crate::work::{self, WorkItem};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use obsdeck_protocol::BatchEntry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const FTB_TRANSITION: &str = "Fade";
pub const FTB_DURATION_MS: u32 = 300;
pub const FTB_FRAME_INTERVAL: Duration = Duration::from_millis(250);
const CUT_TRANSITION: &str = "Cut";

/// Positions in [`REFRESH_REQUESTS`] without which the session cannot be
/// mirrored. The rest read as empty or inactive when the remote refuses them.
const REQUIRED_REFRESH: [usize; 3] = [0, 2, 3];

const REFRESH_REQUESTS: [&str; 7] = [
    "GetSceneList",
    "GetSceneTransitionList",
    "GetCurrentSceneTransition",
    "GetStudioModeEnabled",
    "GetRecordStatus",
    "GetStreamStatus",
    "GetVirtualCamStatus",
];

/// Transition settings the engine overrode and must put back once the
/// forced transition has run.
#[derive(Debug, Clone, PartialEq)]
struct ForcedTransition {
    forced: String,
    restore_name: Option<String>,
    restore_ms: Option<u32>,
}

/// Echoes of the engine's own transition writes, to be swallowed once.
#[derive(Debug, Default)]
struct Latch {
    transition: Option<String>,
    duration: Option<u32>,
}

impl Latch {
    fn clear(&mut self) {
        self.transition = None;
        self.duration = None;
    }

    fn is_set(&self) -> bool {
        self.transition.is_some() || self.duration.is_some()
    }
}

pub struct SessionEngine {
    state: SessionState,
    remote: Arc<dyn Remote>,
    device: Arc<dyn Device>,
    renderer: Box<dyn Renderer>,
    buttons: ButtonRegistry,
    icons: IconSet,
    common: CommonIcons,

    latch: Latch,
    forced: Option<ForcedTransition>,
    next_frame: Instant,
    frame_interval: Duration,
}

impl SessionEngine {
    pub fn new(
        remote: Arc<dyn Remote>,
        device: Arc<dyn Device>,
        renderer: Box<dyn Renderer>,
        buttons: ButtonRegistry,
        icons: IconSet,
        common: CommonIcons,
        black_scene: &str,
    ) -> Self {
        Self {
            state: SessionState::new(black_scene),
            remote,
            device,
            renderer,
            buttons,
            icons,
            common,
            latch: Latch::default(),
            forced: None,
            next_frame: Instant::now(),
            frame_interval: FTB_FRAME_INTERVAL,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True while an echo of one of our own transition writes is expected.
    pub fn latch_pending(&self) -> bool {
        self.latch.is_set()
    }

    /// When the animation wants its next frame; `None` while idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        (self.state.ftb.active && self.state.connected).then_some(self.next_frame)
    }

    /// Advances the animation if its deadline has passed.
    pub fn tick(&mut self, now: Instant) {
        let Some(deadline) = self.next_deadline() else {
            return;
        };
        if now < deadline {
            return;
        }
        self.state.ftb.frame = self.state.ftb.frame.wrapping_add(1);
        self.next_frame = (deadline + self.frame_interval).max(now);
        self.redraw(ButtonClass::FTB);
    }

    pub fn redraw_all(&mut self) {
        self.redraw(ButtonClass::all());
    }

    pub fn handle(&mut self, item: WorkItem) {
        trace!(?item, "work item");
        match item {
            WorkItem::SessionRefresh => self.refresh(),
            WorkItem::RedrawAll { connected } => {
                self.state.connected = connected;
                if !connected {
                    self.latch.clear();
                    self.forced = None;
                }
                self.redraw_all();
            }
            WorkItem::SceneChanged { name } => {
                if self.state.program_scene == name {
                    return;
                }
                self.state.program_scene = name;
                let mut classes = ButtonClass::LIVE;
                if !self.state.studio_mode {
                    let scene = self.state.program_scene.clone();
                    self.load_sources(&scene);
                    classes |= ButtonClass::SOURCES;
                }
                self.redraw(classes);
            }
            WorkItem::PreviewChanged { name } => {
                if self.state.preview_scene == name {
                    return;
                }
                self.state.preview_scene = name;
                let mut classes = ButtonClass::PREVIEW;
                if self.state.studio_mode {
                    let scene = self.state.preview_scene.clone();
                    self.load_sources(&scene);
                    classes |= ButtonClass::SOURCES;
                }
                self.redraw(classes);
            }
            WorkItem::TransitionChanged { name } => {
                if self.latch.transition.as_deref() == Some(name.as_str()) {
                    debug!(transition = %name, "own transition change");
                    self.latch.transition = None;
                    return;
                }
                if self.state.transition != name {
                    self.state.transition = name;
                    self.redraw(ButtonClass::TRANSITION);
                }
            }
            WorkItem::TransitionDurationChanged { ms } => {
                if self.latch.duration == Some(ms) {
                    self.latch.duration = None;
                    return;
                }
                if self.state.transition_ms != ms {
                    self.state.transition_ms = ms;
                    self.redraw(ButtonClass::AUTO);
                }
            }
            WorkItem::TransitionEnded { name } => self.restore_transition(&name),
            WorkItem::SceneCreated { name } => {
                self.state.scenes.push(name);
                self.redraw(ButtonClass::LIVE | ButtonClass::PREVIEW | ButtonClass::FTB);
            }
            WorkItem::SceneDeleted { name } => {
                if self.state.scenes.remove(&name).is_none() {
                    return;
                }
                if self.state.ftb.active {
                    self.forget_faded_scene(&name);
                }
                self.redraw(ButtonClass::LIVE | ButtonClass::PREVIEW | ButtonClass::FTB);
            }
            WorkItem::SceneRenamed { old, new } => self.rename_scene(&old, &new),
            WorkItem::SceneListReplaced { names } => {
                self.state.scenes.replace(names);
                self.redraw(ButtonClass::LIVE | ButtonClass::PREVIEW | ButtonClass::FTB);
            }
            WorkItem::SourceCreated { scene, source } => {
                if scene == self.state.sources.scene() {
                    self.state.sources.insert(source);
                    self.redraw(ButtonClass::SOURCES);
                }
            }
            WorkItem::SourceRemoved { scene, item_id } => {
                if scene == self.state.sources.scene() && self.state.sources.remove(item_id) {
                    self.redraw(ButtonClass::SOURCES);
                }
            }
            WorkItem::SourceVisibilityChanged {
                scene,
                item_id,
                enabled,
            } => {
                if scene != self.state.sources.scene() {
                    return;
                }
                if let Some(ordinal) = self.state.sources.set_enabled(item_id, enabled) {
                    self.redraw_ordinals(ButtonKind::Source, &[ordinal]);
                }
            }
            WorkItem::SourceRenamed { uuid, old, new } => {
                let touched = self.state.sources.rename(&uuid, &old, &new);
                self.redraw_ordinals(ButtonKind::Source, &touched);
            }
            WorkItem::SourceReordered { scene, order } => {
                if scene == self.state.sources.scene() && self.state.sources.reorder(&order) {
                    self.redraw(ButtonClass::SOURCES);
                }
            }
            WorkItem::RecordingToggled { active } => {
                self.state.recording = active;
                self.redraw(ButtonClass::RECORD);
            }
            WorkItem::StreamingToggled { active } => {
                self.state.streaming = active;
                self.redraw(ButtonClass::RECORD);
            }
            WorkItem::VirtualCamToggled { active } => {
                self.state.virtualcam = active;
                self.redraw(ButtonClass::RECORD);
            }
            WorkItem::StudioModeToggled { enabled } => self.set_studio_mode(enabled),
            WorkItem::KeyPressed { pos } => {
                let Some(id) = self.buttons.at(pos) else {
                    trace!(?pos, "no button on key");
                    return;
                };
                let action = self.buttons.get(id).and_then(|b| b.press(&self.state));
                match action {
                    Some(action) => self.execute(action),
                    None => debug!(?pos, "press ignored"),
                }
            }
        }
    }

    /// Pulls the complete remote state. Nothing is committed unless the
    /// required requests succeed; outputs the remote cannot report read as off.
    fn refresh(&mut self) {
        let entries = REFRESH_REQUESTS.iter().copied().map(BatchEntry::new).collect();
        let results = match self.remote.batch(entries) {
            Ok(results) => results,
            Err(e) => {
                warn!("session refresh failed: {e}");
                return;
            }
        };
        if results.len() != REFRESH_REQUESTS.len()
            || REQUIRED_REFRESH.iter().any(|&idx| !results[idx].ok())
        {
            warn!("session refresh incomplete");
            return;
        }
        for r in results.iter().filter(|r| !r.ok()) {
            debug!(
                request = %r.request_type,
                code = r.request_status.code,
                "remote state unavailable"
            );
        }
        let [scenes, transitions, current, studio, record, stream, vcam] = [0, 1, 2, 3, 4, 5, 6]
            .map(|idx| results[idx].data());

        let studio_mode = studio["studioModeEnabled"].as_bool().unwrap_or(false);
        let program = text(scenes, "currentProgramSceneName");
        let preview = if studio_mode {
            text(scenes, "currentPreviewSceneName")
        } else {
            String::new()
        };
        let relevant = if studio_mode && !preview.is_empty() {
            preview.clone()
        } else {
            program.clone()
        };
        let items = match self
            .remote
            .call("GetSceneItemList", Some(json!({ "sceneName": relevant })))
        {
            Ok(v) => work::sources(&v["sceneItems"]),
            Err(e) => {
                warn!(scene = %relevant, "session refresh failed: {e}");
                return;
            }
        };

        let state = &mut self.state;
        state.scenes.replace(work::scene_names(&scenes["scenes"]));
        state.transitions.replace(work::transition_names(&transitions["transitions"]));
        state.transition = text(current, "transitionName");
        state.transition_ms = current["transitionDuration"].as_u64().unwrap_or(0) as u32;
        state.studio_mode = studio_mode;
        state.recording = record["outputActive"].as_bool().unwrap_or(false);
        state.streaming = stream["outputActive"].as_bool().unwrap_or(false);
        state.virtualcam = vcam["outputActive"].as_bool().unwrap_or(false);
        state.program_scene = program;
        state.preview_scene = preview;
        state.sources.replace(relevant, items);
        state.connected = true;

        // A fade survives a reconnect only if the remote is still on black.
        if state.ftb.active && state.program_scene != state.black_scene {
            state.ftb = Default::default();
        }
        self.latch.clear();
        self.forced = None;
        self.next_frame = Instant::now();

        info!(
            scenes = self.state.scenes.len(),
            transitions = self.state.transitions.len(),
            program = %self.state.program_scene,
            studio = self.state.studio_mode,
            "session synchronised"
        );
        self.redraw_all();
    }

    fn load_sources(&mut self, scene: &str) {
        match self
            .remote
            .call("GetSceneItemList", Some(json!({ "sceneName": scene })))
        {
            Ok(v) => self
                .state
                .sources
                .replace(scene.to_string(), work::sources(&v["sceneItems"])),
            Err(e) => {
                warn!(scene, "cannot load scene items: {e}");
                self.state.sources.clear();
            }
        }
    }

    fn rename_scene(&mut self, old: &str, new: &str) {
        let state = &mut self.state;
        if state.scenes.rename(old, new).is_none() {
            return;
        }
        for name in [
            &mut state.program_scene,
            &mut state.preview_scene,
            &mut state.ftb.saved_scene,
            &mut state.ftb.saved_preview,
        ] {
            if *name == old {
                *name = new.to_string();
            }
        }
        if state.black_scene == old {
            info!(old, new, "fade-to-black scene renamed");
            state.black_scene = new.to_string();
        }
        state.sources.rename_scene(old, new);
        self.redraw(ButtonClass::LIVE | ButtonClass::PREVIEW | ButtonClass::FTB);
    }

    fn set_studio_mode(&mut self, enabled: bool) {
        if self.state.studio_mode == enabled {
            return;
        }
        self.state.studio_mode = enabled;
        if enabled {
            // Fetch the preview again instead of trusting whatever we had.
            match self.remote.call("GetCurrentPreviewScene", None) {
                Ok(v) => self.state.preview_scene = text(&v, "currentPreviewSceneName"),
                Err(e) => {
                    warn!("cannot query preview scene: {e}");
                    self.state.preview_scene.clear();
                }
            }
        } else {
            self.state.preview_scene.clear();
        }
        let scene = self.state.relevant_scene().to_string();
        if scene != self.state.sources.scene() {
            self.load_sources(&scene);
        }
        self.redraw_all();
    }

    fn execute(&mut self, action: Action) {
        debug!(?action, "button action");
        let result = match action {
            Action::SetProgram(name) => self
                .remote
                .emit("SetCurrentProgramScene", Some(json!({ "sceneName": name }))),
            Action::SetPreview(name) => self
                .remote
                .emit("SetCurrentPreviewScene", Some(json!({ "sceneName": name }))),
            Action::SaveFadeScene(name) => {
                self.state.ftb.saved_scene = name;
                self.redraw(ButtonClass::LIVE);
                Ok(())
            }
            Action::Cut => {
                self.cut();
                Ok(())
            }
            Action::Auto => self.remote.emit("TriggerStudioModeTransition", None),
            Action::ToggleFadeToBlack => {
                if self.state.ftb.active {
                    self.stop_fade_to_black();
                } else {
                    self.start_fade_to_black();
                }
                Ok(())
            }
            Action::SetTransition(name) => self
                .remote
                .emit("SetCurrentSceneTransition", Some(json!({ "transitionName": name }))),
            Action::SetSourceEnabled {
                scene,
                item_id,
                enabled,
            } => self.remote.emit(
                "SetSceneItemEnabled",
                Some(json!({
                    "sceneName": scene,
                    "sceneItemId": item_id,
                    "sceneItemEnabled": enabled,
                })),
            ),
            Action::ToggleRecord => self.remote.emit("ToggleRecord", None),
            Action::ToggleStream => self.remote.emit("ToggleStream", None),
            Action::ToggleVirtualCam => self.remote.emit("ToggleVirtualCam", None),
        };
        if let Err(e) = result {
            debug!("button request dropped: {e}");
        }
    }

    /// Cut in studio mode: switch to the cut transition, transition, and
    /// switch back, as one batch.
    fn cut(&mut self) {
        let current = self.state.transition.clone();
        if current == CUT_TRANSITION {
            if let Err(e) = self.remote.emit("TriggerStudioModeTransition", None) {
                debug!("cut dropped: {e}");
            }
            return;
        }
        self.latch.transition = Some(CUT_TRANSITION.to_string());
        let batch = vec![
            set_transition(CUT_TRANSITION),
            BatchEntry::new("TriggerStudioModeTransition"),
            set_transition(&current),
        ];
        match self.remote.batch(batch) {
            Ok(results) if results.iter().all(|r| r.ok()) => {}
            Ok(_) => {
                warn!("cut partially failed");
                self.latch.transition = None;
            }
            Err(e) => {
                debug!("cut dropped: {e}");
                self.latch.transition = None;
            }
        }
    }

    /// Entries that switch the remote to the fade used by fade-to-black.
    /// Remembers what has to be put back once the fade has run.
    fn force_fade(&mut self) -> Vec<BatchEntry> {
        let mut entries = Vec::new();
        let mut forced = ForcedTransition {
            forced: FTB_TRANSITION.to_string(),
            restore_name: None,
            restore_ms: None,
        };
        if self.state.transition != FTB_TRANSITION {
            self.latch.transition = Some(FTB_TRANSITION.to_string());
            forced.restore_name = Some(self.state.transition.clone());
            entries.push(set_transition(FTB_TRANSITION));
        }
        if self.state.transition_ms != FTB_DURATION_MS {
            self.latch.duration = Some(FTB_DURATION_MS);
            forced.restore_ms = Some(self.state.transition_ms);
            entries.push(set_duration(FTB_DURATION_MS));
        }
        if forced.restore_name.is_some() || forced.restore_ms.is_some() {
            self.forced = Some(forced);
        }
        entries
    }

    fn start_fade_to_black(&mut self) {
        let mut batch = self.force_fade();
        batch.push(BatchEntry::with_data(
            "SetCurrentProgramScene",
            json!({ "sceneName": self.state.black_scene }),
        ));
        if !self.run_fade_batch(batch) {
            return;
        }
        let ftb = &mut self.state.ftb;
        ftb.active = true;
        ftb.frame = 0;
        ftb.saved_scene = self.state.program_scene.clone();
        ftb.saved_preview = self.state.preview_scene.clone();
        self.next_frame = Instant::now() + self.frame_interval;
        info!(saved = %self.state.ftb.saved_scene, "fade to black");
        // Most buttons go dark for the duration of the fade.
        self.redraw_all();
    }

    fn stop_fade_to_black(&mut self) {
        let saved_scene = self.state.ftb.saved_scene.clone();
        let saved_preview = self.state.ftb.saved_preview.clone();
        let mut batch = self.force_fade();
        if !saved_scene.is_empty() {
            batch.push(BatchEntry::with_data(
                "SetCurrentProgramScene",
                json!({ "sceneName": saved_scene }),
            ));
        }
        if self.state.studio_mode && !saved_preview.is_empty() {
            batch.push(BatchEntry::with_data(
                "SetCurrentPreviewScene",
                json!({ "sceneName": saved_preview }),
            ));
        }
        // The animation ends even if the remote refused part of the restore;
        // the program scene then arrives through its change event.
        if self.run_fade_batch(batch) {
            info!(restored = %saved_scene, "fade from black");
        } else {
            warn!(restored = %saved_scene, "fade from black incomplete");
        }
        self.state.ftb = Default::default();
        self.redraw_all();
    }

    /// Keeps the fade-to-black snapshot pointing at scenes that still exist.
    fn forget_faded_scene(&mut self, deleted: &str) {
        if deleted == self.state.black_scene {
            info!("fade-to-black scene deleted, fade abandoned");
            self.state.ftb = Default::default();
            self.redraw_all();
            return;
        }
        let black = &self.state.black_scene;
        let fallback = self
            .state
            .scenes
            .iter()
            .map(|ranked| ranked.name)
            .find(|name| name != black)
            .unwrap_or_default();
        let ftb = &mut self.state.ftb;
        if ftb.saved_scene == deleted {
            info!(deleted, restore = %fallback, "faded scene deleted");
            ftb.saved_scene = fallback;
        }
        if ftb.saved_preview == deleted {
            ftb.saved_preview.clear();
        }
    }

    fn run_fade_batch(&mut self, batch: Vec<BatchEntry>) -> bool {
        match self.remote.batch(batch) {
            Ok(results) if results.iter().all(|r| r.ok()) => true,
            Ok(results) => {
                for r in results.iter().filter(|r| !r.ok()) {
                    warn!(
                        request = %r.request_type,
                        comment = r.request_status.comment.as_deref().unwrap_or(""),
                        "fade-to-black request failed"
                    );
                }
                self.latch.clear();
                self.restore_transition(FTB_TRANSITION);
                false
            }
            Err(e) => {
                debug!("fade-to-black dropped: {e}");
                self.latch.clear();
                self.forced = None;
                false
            }
        }
    }

    /// Puts back the transition settings overridden by a forced transition.
    fn restore_transition(&mut self, ended: &str) {
        let Some(forced) = self.forced.take() else {
            return;
        };
        if !ended.is_empty() && ended != forced.forced {
            self.forced = Some(forced);
            return;
        }
        let mut batch = Vec::new();
        if let Some(name) = &forced.restore_name {
            batch.push(set_transition(name));
        }
        if let Some(ms) = forced.restore_ms {
            batch.push(set_duration(ms));
        }
        if batch.is_empty() {
            return;
        }
        debug!(?forced, "restoring transition");
        if let Err(e) = self.remote.batch(batch) {
            debug!("transition restore dropped: {e}");
        }
    }

    fn redraw(&mut self, classes: ButtonClass) {
        let ids: Vec<ButtonId> = self.buttons.in_class(classes).collect();
        for id in ids {
            self.present(id);
        }
    }

    fn redraw_ordinals(&mut self, kind: ButtonKind, ordinals: &[u32]) {
        for &ordinal in ordinals {
            let ids = self.buttons.with_ordinal(kind, ordinal).to_vec();
            for id in ids {
                self.present(id);
            }
        }
    }

    fn present(&mut self, id: ButtonId) {
        let Some(button) = self.buttons.get(id) else {
            return;
        };
        let image = match button.show_icon(&self.state, &self.common) {
            RenderInstruction::Icon(handle) => KeyImage::Handle(handle),
            RenderInstruction::Label {
                background,
                lines,
                font,
                color,
                anchor,
            } => self
                .icons
                .image(background)
                .and_then(|bg| self.renderer.render_label(&font, bg, &lines, &color, anchor))
                .map(KeyImage::Image)
                .unwrap_or(KeyImage::Handle(background)),
        };
        self.device.set_key_image(button.pos, image);
    }

    /// Drains `work` until `shutdown` fires or every producer is gone.
    pub fn run(mut self, work: Receiver<WorkItem>, shutdown: Receiver<()>) {
        self.redraw_all();
        loop {
            let wake = match self.next_deadline() {
                None => select! {
                    recv(work) -> item => item.map_or(Wake::Stop, Wake::Item),
                    recv(shutdown) -> _ => Wake::Stop,
                },
                Some(deadline) => select! {
                    recv(work) -> item => item.map_or(Wake::Stop, Wake::Item),
                    recv(shutdown) -> _ => Wake::Stop,
                    default(deadline.saturating_duration_since(Instant::now())) => Wake::Frame,
                },
            };
            match wake {
                Wake::Stop => break,
                Wake::Item(item) => self.handle(item),
                Wake::Frame => {
                    // Anything that arrived during the wait goes first.
                    while let Ok(item) = work.try_recv() {
                        self.handle(item);
                    }
                }
            }
            self.tick(Instant::now());
        }
        debug!("session engine stopped");
    }

    pub fn spawn(self, work: Receiver<WorkItem>) -> std::io::Result<EngineHandle> {
        let (stop_tx, stop_rx) = bounded(0);
        let join = thread::Builder::new()
            .name("obsdeck-engine".into())
            .spawn(move || self.run(work, stop_rx))?;
        Ok(EngineHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

enum Wake {
    Item(WorkItem),
    Frame,
    Stop,
}

/// Owner of the consumer thread.
pub struct EngineHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Waits for the engine to stop on its own, once every work producer is gone.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn shutdown(&mut self) {
        self.stop.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn text(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().to_string()
}

fn set_transition(name: &str) -> BatchEntry {
    BatchEntry::with_data("SetCurrentSceneTransition", json!({ "transitionName": name }))
}

fn set_duration(ms: u32) -> BatchEntry {
    BatchEntry::with_data(
        "SetCurrentSceneTransitionDuration",
        json!({ "transitionDuration": ms }),
    )
}
