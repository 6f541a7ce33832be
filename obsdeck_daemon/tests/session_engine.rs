use obsdeck_daemon::buttons::{Button, ButtonKind, ButtonRegistry, CommonIcons};
use obsdeck_daemon::mock::{MockModel, Outcome};
use obsdeck_daemon::work::translate;
use obsdeck_daemon::{
    work_queue, Device, IconHandle, IconSet, Image, KeyImage, KeyPos, Remote, Renderer,
    SessionEngine, TransportError, WorkItem,
};
use obsdeck_protocol::{BatchEntry, BatchResult, Event};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Applies requests to a [`MockModel`] and keeps the events they would cause.
struct FakeRemote {
    model: Mutex<MockModel>,
    requests: Mutex<Vec<String>>,
    events: Mutex<Vec<Event>>,
    offline: AtomicBool,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            model: Mutex::new(MockModel::demo()),
            requests: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    fn apply(&self, request_type: &str, data: Option<Value>) -> Result<Outcome, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NoConnection);
        }
        self.requests.lock().unwrap().push(request_type.to_string());
        let outcome = self
            .model
            .lock()
            .unwrap()
            .apply(request_type, &data.unwrap_or(Value::Null));
        self.events.lock().unwrap().extend(outcome.events.clone());
        Ok(outcome)
    }

    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn model(&self) -> MockModel {
        self.model.lock().unwrap().clone()
    }
}

impl Remote for FakeRemote {
    fn emit(&self, request_type: &str, data: Option<Value>) -> Result<(), TransportError> {
        self.apply(request_type, data).map(|_| ())
    }

    fn call(&self, request_type: &str, data: Option<Value>) -> Result<Value, TransportError> {
        let outcome = self.apply(request_type, data)?;
        if !outcome.status.result {
            return Err(TransportError::RequestFailed {
                code: outcome.status.code,
                comment: outcome.status.comment.unwrap_or_default(),
            });
        }
        Ok(outcome.data.unwrap_or(Value::Null))
    }

    fn batch(&self, requests: Vec<BatchEntry>) -> Result<Vec<BatchResult>, TransportError> {
        requests
            .into_iter()
            .map(|entry| -> Result<BatchResult, TransportError> {
                let outcome = self.apply(&entry.request_type, entry.request_data)?;
                Ok(BatchResult {
                    request_type: entry.request_type,
                    request_status: outcome.status,
                    response_data: outcome.data,
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct RecordingDevice {
    next: AtomicU32,
    images: Mutex<KeyLog>,
}

type KeyLog = Vec<(KeyPos, KeyImage)>;

impl RecordingDevice {
    fn clear(&self) {
        self.images.lock().unwrap().clear();
    }

    fn touched(&self) -> Vec<KeyPos> {
        self.images.lock().unwrap().iter().map(|(pos, _)| *pos).collect()
    }

    fn last(&self, pos: KeyPos) -> Option<KeyImage> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| *p == pos)
            .map(|(_, image)| image.clone())
    }

    fn last_label(&self, pos: KeyPos) -> Option<String> {
        match self.last(pos)? {
            KeyImage::Image(image) => Some(String::from_utf8(image.data).unwrap()),
            KeyImage::Handle(_) => None,
        }
    }
}

impl Device for RecordingDevice {
    fn set_key_image(&self, pos: KeyPos, image: KeyImage) {
        self.images.lock().unwrap().push((pos, image));
    }

    fn register_image(&self, _image: Image) -> IconHandle {
        IconHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn read(&self) -> Vec<bool> {
        Vec::new()
    }

    fn set_brightness(&self, _percent: u8) {}
}

/// Renders `background|line1/line2`.
struct StubRenderer;

impl Renderer for StubRenderer {
    fn render_label(
        &mut self,
        _font: &str,
        background: &Image,
        lines: &[String],
        _color: &str,
        _anchor: (f64, f64),
    ) -> Option<Image> {
        let bg = String::from_utf8_lossy(&background.data).into_owned();
        Some(Image {
            data: format!("{bg}|{}", lines.join("/")).into_bytes(),
        })
    }
}

fn key(row: u32, column: u32) -> KeyPos {
    KeyPos { page: 0, row, column }
}

const FTB_KEY: KeyPos = KeyPos { page: 0, row: 3, column: 1 };
const RECORD_KEY: KeyPos = KeyPos { page: 0, row: 3, column: 2 };
const CUT_KEY: KeyPos = KeyPos { page: 0, row: 3, column: 4 };

struct Rig {
    engine: SessionEngine,
    remote: Arc<FakeRemote>,
    device: Arc<RecordingDevice>,
    frames: Vec<IconHandle>,
}

impl Rig {
    fn new() -> Self {
        let remote = Arc::new(FakeRemote::new());
        let device = Arc::new(RecordingDevice::default());
        let mut icons = IconSet::new();
        let mut icon = |name: &str| {
            icons.register(
                device.as_ref(),
                name,
                Image {
                    data: name.as_bytes().to_vec(),
                },
            )
        };
        let on = icon("on");
        let off = icon("off");
        let common = CommonIcons::uniform(icon("offline"), icon("unused"));
        let frames = vec![icon("ftb1"), icon("ftb2")];

        let mut buttons = ButtonRegistry::new();
        for ordinal in 1..=3 {
            buttons.add(Button::new(ButtonKind::SceneLive, key(1, ordinal), ordinal, on, off));
            buttons.add(Button::new(ButtonKind::ScenePreview, key(2, ordinal), ordinal, on, off));
            buttons.add(Button::new(ButtonKind::Transition, key(4, ordinal), ordinal, on, off));
        }
        for ordinal in 1..=2 {
            buttons.add(Button::new(ButtonKind::Source, key(5, ordinal), ordinal, on, off));
        }
        let mut ftb = Button::new(ButtonKind::FadeToBlack, FTB_KEY, 0, on, off);
        ftb.frames = frames.clone();
        buttons.add(ftb);
        buttons.add(Button::new(ButtonKind::ToggleRecord, RECORD_KEY, 0, on, off));
        buttons.add(Button::new(ButtonKind::Auto, key(3, 3), 0, on, off));
        buttons.add(Button::new(ButtonKind::Cut, CUT_KEY, 0, on, off));

        let engine = SessionEngine::new(
            remote.clone(),
            device.clone(),
            Box::new(StubRenderer),
            buttons,
            icons,
            common,
            "Black",
        );
        Self {
            engine,
            remote,
            device,
            frames,
        }
    }

    fn connected() -> Self {
        let mut rig = Self::new();
        rig.engine.handle(WorkItem::SessionRefresh);
        rig
    }

    /// Feeds every event the remote produced back through the translator,
    /// including events caused by the engine's reactions.
    fn pump(&mut self) {
        loop {
            let events = self.remote.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                if let Some(item) = translate(&event) {
                    self.engine.handle(item);
                }
            }
        }
    }

    fn press(&mut self, pos: KeyPos) {
        self.engine.handle(WorkItem::KeyPressed { pos });
        self.pump();
    }
}

#[test]
fn refresh_establishes_baseline() {
    let rig = Rig::connected();
    let state = rig.engine.state();
    assert!(state.connected);
    assert_eq!(state.program_scene, "Live1");
    assert_eq!(state.scenes.name(1), Some("Live1"));
    assert_eq!(state.scenes.name(3), Some("Black"));
    assert_eq!(state.transitions.name(3), Some("Stinger"));
    assert_eq!(state.transition, "Stinger");
    assert_eq!(state.transition_ms, 1000);
    let sources: Vec<_> = state.sources.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(sources, ["camera", "background"]);

    assert_eq!(rig.device.last_label(key(1, 1)).as_deref(), Some("on|Live1"));
    assert_eq!(rig.device.last_label(key(1, 2)).as_deref(), Some("off|Live2"));
    // Source and transition keys only act in studio mode.
    let unused = Some(KeyImage::Handle(IconHandle(4)));
    assert_eq!(rig.device.last(key(5, 1)), unused);
    assert_eq!(rig.device.last(key(4, 1)), unused);
}

#[test]
fn studio_mode_lights_source_and_transition_keys() {
    let mut rig = Rig::connected();
    rig.remote
        .emit("SetStudioModeEnabled", Some(json!({ "studioModeEnabled": true })))
        .unwrap();
    rig.pump();
    assert_eq!(rig.device.last_label(key(5, 1)).as_deref(), Some("on|camera"));
    assert_eq!(rig.device.last_label(key(4, 3)).as_deref(), Some("on|Stinger"));
    assert_eq!(rig.device.last_label(key(4, 1)).as_deref(), Some("off|Cut"));

    rig.press(FTB_KEY);
    assert!(rig.engine.state().ftb.active);
    let unused = Some(KeyImage::Handle(IconHandle(4)));
    assert_eq!(rig.device.last(key(5, 1)), unused);
    assert_eq!(rig.device.last(key(4, 3)), unused);
}

#[test]
fn refresh_tolerates_unavailable_outputs() {
    let mut rig = Rig::new();
    rig.remote.model.lock().unwrap().virtualcam_available = false;
    rig.engine.handle(WorkItem::SessionRefresh);
    let state = rig.engine.state();
    assert!(state.connected);
    assert!(!state.virtualcam);
    assert_eq!(state.scenes.len(), 3);
    assert_eq!(state.transition, "Stinger");
    assert_eq!(rig.device.last_label(key(1, 1)).as_deref(), Some("on|Live1"));
}

#[test]
fn offline_presses_send_nothing() {
    let mut rig = Rig::new();
    rig.press(RECORD_KEY);
    assert!(rig.remote.requests().is_empty());
    assert!(!rig.engine.state().recording);
}

#[test]
fn record_press_round_trips_through_events() {
    let mut rig = Rig::connected();
    rig.press(RECORD_KEY);
    assert!(rig.remote.requests().contains(&"ToggleRecord".to_string()));
    assert!(rig.engine.state().recording);
    assert!(rig.engine.state().prohibit_sleep());
    assert_eq!(rig.device.last(RECORD_KEY), Some(KeyImage::Handle(IconHandle(1))));
}

#[test]
fn items_apply_in_fifo_order() {
    let mut rig = Rig::connected();
    for item in [
        WorkItem::RecordingToggled { active: true },
        WorkItem::SceneChanged { name: "Live2".into() },
        WorkItem::RecordingToggled { active: false },
        WorkItem::SceneChanged { name: "Black".into() },
        WorkItem::SceneChanged { name: "Live2".into() },
    ] {
        rig.engine.handle(item);
    }
    assert!(!rig.engine.state().recording);
    assert_eq!(rig.engine.state().program_scene, "Live2");
    // Outside studio mode the program scene's items are mirrored.
    assert_eq!(rig.engine.state().sources.scene(), "Live2");
}

#[test]
fn consumer_thread_drains_queue_in_order() {
    let rig = Rig::connected();
    let device = rig.device.clone();
    let (queue, rx) = work_queue(false);
    let handle = rig.engine.spawn(rx).unwrap();
    queue.push(WorkItem::SceneChanged { name: "Live2".into() });
    queue.push(WorkItem::SceneChanged { name: "Live1".into() });
    queue.push(WorkItem::SceneChanged { name: "Live2".into() });
    drop(queue);
    handle.join();

    assert_eq!(device.last_label(key(1, 1)).as_deref(), Some("off|Live1"));
    assert_eq!(device.last_label(key(1, 2)).as_deref(), Some("on|Live2"));
}

#[test]
fn delete_shifts_ordinal_bindings() {
    let mut rig = Rig::connected();
    rig.engine.handle(WorkItem::SceneDeleted { name: "Live2".into() });
    let state = rig.engine.state();
    assert_eq!(state.scenes.name(2), Some("Black"));
    assert_eq!(state.scenes.name(3), None);
    assert_eq!(rig.device.last_label(key(1, 2)).as_deref(), Some("off|Black"));
    assert_eq!(rig.device.last(key(1, 3)), Some(KeyImage::Handle(IconHandle(4))));
}

#[test]
fn rename_keeps_ordinal_binding() {
    let mut rig = Rig::connected();
    rig.engine.handle(WorkItem::SceneRenamed {
        old: "Live1".into(),
        new: "Intro".into(),
    });
    let state = rig.engine.state();
    assert_eq!(state.scenes.ordinal("Intro"), Some(1));
    assert_eq!(state.program_scene, "Intro");
    assert_eq!(state.sources.scene(), "Intro");
    assert_eq!(rig.device.last_label(key(1, 1)).as_deref(), Some("on|Intro"));
}

#[test]
fn visibility_change_redraws_only_bound_source_keys() {
    let mut rig = Rig::connected();
    rig.remote
        .emit("SetStudioModeEnabled", Some(json!({ "studioModeEnabled": true })))
        .unwrap();
    rig.pump();
    assert_eq!(rig.engine.state().sources.scene(), "Live1");
    rig.device.clear();
    rig.engine.handle(WorkItem::SourceVisibilityChanged {
        scene: "Live1".into(),
        item_id: 1,
        enabled: false,
    });
    assert_eq!(rig.device.touched(), [key(5, 2)]);
    assert_eq!(rig.device.last_label(key(5, 2)).as_deref(), Some("off|background"));

    rig.device.clear();
    rig.engine.handle(WorkItem::SourceVisibilityChanged {
        scene: "Live2".into(),
        item_id: 3,
        enabled: false,
    });
    assert!(rig.device.touched().is_empty());
}

#[test]
fn fade_to_black_round_trip_restores_everything() {
    let mut rig = Rig::connected();

    rig.press(FTB_KEY);
    let state = rig.engine.state();
    assert!(state.ftb.active);
    assert_eq!(state.program_scene, "Black");
    assert_eq!(state.live_scene(), "Live1");
    // The forced fade never shows up as the operator's transition.
    assert_eq!(state.transition, "Stinger");
    assert!(!rig.engine.latch_pending());
    assert!(rig.engine.next_deadline().is_some());
    assert_eq!(rig.remote.model().transition, "Stinger");
    assert_eq!(rig.remote.model().duration_ms, 1000);

    rig.press(FTB_KEY);
    let state = rig.engine.state();
    assert!(!state.ftb.active);
    assert_eq!(state.program_scene, "Live1");
    assert_eq!(state.transition, "Stinger");
    assert_eq!(state.transition_ms, 1000);
    assert!(!rig.engine.latch_pending());
    assert!(rig.engine.next_deadline().is_none());
    let model = rig.remote.model();
    assert_eq!(model.program, "Live1");
    assert_eq!(model.transition, "Stinger");
    assert_eq!(model.duration_ms, 1000);
}

#[test]
fn live_press_during_fade_moves_the_snapshot() {
    let mut rig = Rig::connected();
    rig.press(FTB_KEY);
    rig.press(key(1, 2));
    assert_eq!(rig.engine.state().ftb.saved_scene, "Live2");
    assert_eq!(rig.remote.model().program, "Black");

    rig.press(FTB_KEY);
    assert_eq!(rig.engine.state().program_scene, "Live2");
}

#[test]
fn deleting_the_faded_scene_restores_a_surviving_one() {
    let mut rig = Rig::connected();
    rig.press(FTB_KEY);
    assert_eq!(rig.engine.state().ftb.saved_scene, "Live1");

    rig.remote.model.lock().unwrap().scenes.retain(|s| s != "Live1");
    rig.engine.handle(WorkItem::SceneDeleted { name: "Live1".into() });
    assert!(rig.engine.state().ftb.active);
    assert_eq!(rig.engine.state().ftb.saved_scene, "Live2");

    rig.press(FTB_KEY);
    assert!(!rig.engine.state().ftb.active);
    assert_eq!(rig.engine.state().program_scene, "Live2");
    assert_eq!(rig.remote.model().program, "Live2");
    assert_eq!(rig.remote.model().transition, "Stinger");
}

#[test]
fn refused_restore_still_ends_the_fade() {
    let mut rig = Rig::connected();
    rig.press(FTB_KEY);
    // The remote loses the scene without telling us.
    rig.remote.model.lock().unwrap().scenes.retain(|s| s != "Live1");

    rig.press(FTB_KEY);
    let state = rig.engine.state();
    assert!(!state.ftb.active);
    assert!(rig.engine.next_deadline().is_none());
    assert_eq!(rig.device.last(FTB_KEY), Some(KeyImage::Handle(IconHandle(2))));
    assert_eq!(rig.remote.model().transition, "Stinger");
    assert_eq!(rig.remote.model().duration_ms, 1000);
}

#[test]
fn deleting_the_black_scene_abandons_the_fade() {
    let mut rig = Rig::connected();
    rig.press(FTB_KEY);
    rig.engine.handle(WorkItem::SceneDeleted { name: "Black".into() });
    assert!(!rig.engine.state().ftb.active);
    assert_eq!(rig.device.last(FTB_KEY), Some(KeyImage::Handle(IconHandle(4))));
}

#[test]
fn consumer_thread_animates_while_idle_and_keeps_applying_items() {
    let Rig { engine, device, .. } = Rig::connected();
    let engine = engine.with_frame_interval(Duration::from_millis(10));
    let (queue, rx) = work_queue(false);
    let handle = engine.spawn(rx).unwrap();

    queue.push(WorkItem::KeyPressed { pos: FTB_KEY });
    // Nothing else is queued; only the frame deadline wakes the engine.
    thread::sleep(Duration::from_millis(200));
    let frames: Vec<_> = device
        .images
        .lock()
        .unwrap()
        .iter()
        .filter(|(pos, _)| *pos == FTB_KEY)
        .filter_map(|(_, image)| match image {
            KeyImage::Handle(h) if h.0 == 5 || h.0 == 6 => Some(h.0),
            _ => None,
        })
        .collect();
    assert!(frames.len() >= 3, "only {} frames drawn", frames.len());
    assert!(frames.contains(&6));

    queue.push(WorkItem::RecordingToggled { active: true });
    drop(queue);
    handle.join();
    assert_eq!(device.last(RECORD_KEY), Some(KeyImage::Handle(IconHandle(1))));
}

#[test]
fn animation_tick_redraws_only_fade_buttons() {
    let mut rig = Rig::connected();
    rig.press(FTB_KEY);
    rig.device.clear();

    rig.engine.tick(Instant::now() + Duration::from_secs(1));
    assert_eq!(rig.engine.state().ftb.frame, 1);
    assert_eq!(rig.device.touched(), [FTB_KEY]);
    assert_eq!(rig.device.last(FTB_KEY), Some(KeyImage::Handle(rig.frames[1])));

    // Not due yet.
    rig.device.clear();
    rig.engine.tick(Instant::now());
    assert!(rig.device.touched().is_empty());
}

#[test]
fn cut_latch_ignores_only_its_own_echo() {
    let mut rig = Rig::connected();
    rig.remote
        .emit("SetStudioModeEnabled", Some(json!({ "studioModeEnabled": true })))
        .unwrap();
    rig.pump();
    rig.remote
        .emit("SetCurrentPreviewScene", Some(json!({ "sceneName": "Live2" })))
        .unwrap();
    rig.pump();
    assert!(rig.engine.state().studio_mode);
    assert_eq!(rig.engine.state().preview_scene, "Live2");

    rig.engine.handle(WorkItem::KeyPressed { pos: CUT_KEY });
    assert!(rig.engine.latch_pending());

    // An operator change arriving before the echo is not swallowed.
    rig.engine.handle(WorkItem::TransitionChanged { name: "Fade".into() });
    assert_eq!(rig.engine.state().transition, "Fade");
    assert!(rig.engine.latch_pending());

    rig.pump();
    assert!(!rig.engine.latch_pending());
    assert_eq!(rig.engine.state().transition, "Stinger");
    assert_eq!(rig.engine.state().program_scene, "Live2");
    assert_eq!(rig.engine.state().preview_scene, "Live1");
}

#[test]
fn failed_refresh_keeps_last_good_state() {
    let mut rig = Rig::connected();
    rig.remote.model.lock().unwrap().scenes.push("Extra".into());
    rig.remote.offline.store(true, Ordering::SeqCst);
    rig.engine.handle(WorkItem::SessionRefresh);
    assert_eq!(rig.engine.state().scenes.len(), 3);
    assert!(rig.engine.state().connected);

    rig.remote.offline.store(false, Ordering::SeqCst);
    rig.engine.handle(WorkItem::SessionRefresh);
    assert_eq!(rig.engine.state().scenes.len(), 4);
}

#[test]
fn disconnect_shows_offline_everywhere() {
    let mut rig = Rig::connected();
    rig.device.clear();
    rig.engine.handle(WorkItem::RedrawAll { connected: false });
    let offline = KeyImage::Handle(IconHandle(3));
    for pos in rig.device.touched() {
        assert_eq!(rig.device.last(pos), Some(offline.clone()));
    }
    assert!(!rig.device.touched().is_empty());
}
