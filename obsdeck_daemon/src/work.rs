//! Work items and the translation from remote events.
//!
//! The translator runs on the network thread. It only maps wire events to
//! [`WorkItem`]s and never touches session state.

use crate::device::KeyPos;
use crate::state::Source;
use crate::transport::TransportObserver;
use crossbeam_channel::{unbounded, Receiver, Sender};
use obsdeck_protocol::Event;
use serde_json::Value;
use tracing::{info, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    SessionRefresh,
    RedrawAll { connected: bool },
    SceneChanged { name: String },
    PreviewChanged { name: String },
    TransitionChanged { name: String },
    SceneCreated { name: String },
    SceneDeleted { name: String },
    SceneRenamed { old: String, new: String },
    SourceCreated { scene: String, source: Source },
    SourceRemoved { scene: String, item_id: i64 },
    SourceVisibilityChanged { scene: String, item_id: i64, enabled: bool },
    SourceRenamed { uuid: String, old: String, new: String },
    SourceReordered { scene: String, order: Vec<(i64, u32)> },
    RecordingToggled { active: bool },
    StreamingToggled { active: bool },
    VirtualCamToggled { active: bool },
    SceneListReplaced { names: Vec<String> },
    StudioModeToggled { enabled: bool },
    TransitionEnded { name: String },
    TransitionDurationChanged { ms: u32 },
    KeyPressed { pos: KeyPos },
}

const OUTPUT_STARTED: &str = "OBS_WEBSOCKET_OUTPUT_STARTED";
const OUTPUT_STOPPED: &str = "OBS_WEBSOCKET_OUTPUT_STOPPED";

const KNOWN_EVENTS: &[&str] = &[
    "CurrentProgramSceneChanged",
    "CurrentPreviewSceneChanged",
    "CurrentSceneTransitionChanged",
    "CurrentSceneTransitionDurationChanged",
    "SceneTransitionEnded",
    "SceneCreated",
    "SceneRemoved",
    "SceneNameChanged",
    "SceneListChanged",
    "SceneItemCreated",
    "SceneItemRemoved",
    "SceneItemEnableStateChanged",
    "SceneItemListReindexed",
    "InputNameChanged",
    "RecordStateChanged",
    "StreamStateChanged",
    "VirtualcamStateChanged",
    "StudioModeStateChanged",
];

fn text(d: &Value, key: &str) -> Option<String> {
    d.get(key)?.as_str().map(str::to_owned)
}

fn flag(d: &Value, key: &str) -> Option<bool> {
    d.get(key)?.as_bool()
}

fn is_group(d: &Value) -> bool {
    flag(d, "isGroup").unwrap_or(false)
}

fn output_active(d: &Value) -> Option<bool> {
    match d.get("outputState")?.as_str()? {
        OUTPUT_STARTED => Some(true),
        OUTPUT_STOPPED => Some(false),
        _ => None,
    }
}

/// Maps one remote event to at most one work item.
pub fn translate(event: &Event) -> Option<WorkItem> {
    let d = event.data();
    let item = match event.event_type.as_str() {
        "CurrentProgramSceneChanged" => WorkItem::SceneChanged {
            name: text(d, "sceneName")?,
        },
        "CurrentPreviewSceneChanged" => WorkItem::PreviewChanged {
            name: text(d, "sceneName")?,
        },
        "CurrentSceneTransitionChanged" => WorkItem::TransitionChanged {
            name: text(d, "transitionName")?,
        },
        "CurrentSceneTransitionDurationChanged" => WorkItem::TransitionDurationChanged {
            ms: d.get("transitionDuration")?.as_u64()? as u32,
        },
        "SceneTransitionEnded" => WorkItem::TransitionEnded {
            name: text(d, "transitionName").unwrap_or_default(),
        },
        "SceneCreated" if !is_group(d) => WorkItem::SceneCreated {
            name: text(d, "sceneName")?,
        },
        "SceneRemoved" if !is_group(d) => WorkItem::SceneDeleted {
            name: text(d, "sceneName")?,
        },
        "SceneNameChanged" => WorkItem::SceneRenamed {
            old: text(d, "oldSceneName")?,
            new: text(d, "sceneName")?,
        },
        "SceneListChanged" => WorkItem::SceneListReplaced {
            names: scene_names(d.get("scenes")?),
        },
        "SceneItemCreated" => WorkItem::SourceCreated {
            scene: text(d, "sceneName")?,
            source: Source {
                item_id: d.get("sceneItemId")?.as_i64()?,
                uuid: text(d, "sourceUuid").unwrap_or_default(),
                name: text(d, "sourceName")?,
                // Remote creates items visible; a separate event follows otherwise.
                enabled: flag(d, "sceneItemEnabled").unwrap_or(true),
                index: d.get("sceneItemIndex")?.as_u64()? as u32,
            },
        },
        "SceneItemRemoved" => WorkItem::SourceRemoved {
            scene: text(d, "sceneName")?,
            item_id: d.get("sceneItemId")?.as_i64()?,
        },
        "SceneItemEnableStateChanged" => WorkItem::SourceVisibilityChanged {
            scene: text(d, "sceneName")?,
            item_id: d.get("sceneItemId")?.as_i64()?,
            enabled: flag(d, "sceneItemEnabled")?,
        },
        "SceneItemListReindexed" => WorkItem::SourceReordered {
            scene: text(d, "sceneName")?,
            order: d
                .get("sceneItems")?
                .as_array()?
                .iter()
                .filter_map(|item| {
                    Some((
                        item.get("sceneItemId")?.as_i64()?,
                        item.get("sceneItemIndex")?.as_u64()? as u32,
                    ))
                })
                .collect(),
        },
        "InputNameChanged" => WorkItem::SourceRenamed {
            uuid: text(d, "inputUuid").unwrap_or_default(),
            old: text(d, "oldInputName")?,
            new: text(d, "inputName")?,
        },
        "RecordStateChanged" => WorkItem::RecordingToggled {
            active: output_active(d)?,
        },
        "StreamStateChanged" => WorkItem::StreamingToggled {
            active: output_active(d)?,
        },
        "VirtualcamStateChanged" => WorkItem::VirtualCamToggled {
            active: output_active(d)?,
        },
        "StudioModeStateChanged" => WorkItem::StudioModeToggled {
            enabled: flag(d, "studioModeEnabled")?,
        },
        _ => return None,
    };
    Some(item)
}

/// Scene names ordered top to bottom (descending `sceneIndex`).
pub fn scene_names(scenes: &Value) -> Vec<String> {
    let mut ranked: Vec<(i64, String)> = scenes
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|s| {
                    Some((
                        s.get("sceneIndex").and_then(Value::as_i64).unwrap_or(0),
                        s.get("sceneName")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked.into_iter().map(|(_, name)| name).collect()
}

/// Transition names in the order the remote lists them.
pub fn transition_names(transitions: &Value) -> Vec<String> {
    transitions
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|t| t.get("transitionName")?.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

pub fn sources(items: &Value) -> Vec<Source> {
    items
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|item| {
                    Some(Source {
                        item_id: item.get("sceneItemId")?.as_i64()?,
                        uuid: text(item, "sourceUuid").unwrap_or_default(),
                        name: text(item, "sourceName")?,
                        enabled: flag(item, "sceneItemEnabled").unwrap_or(true),
                        index: item.get("sceneItemIndex")?.as_u64()? as u32,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn work_queue(log_unknown: bool) -> (WorkQueue, Receiver<WorkItem>) {
    let (tx, rx) = unbounded();
    (WorkQueue { tx, log_unknown }, rx)
}

/// Producer side of the session engine's queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<WorkItem>,
    log_unknown: bool,
}

impl WorkQueue {
    pub fn push(&self, item: WorkItem) {
        let _ = self.tx.send(item);
    }
}

impl TransportObserver for WorkQueue {
    fn on_event(&self, event: Event) {
        match translate(&event) {
            Some(item) => self.push(item),
            None if self.log_unknown && !KNOWN_EVENTS.contains(&event.event_type.as_str()) => {
                info!(event = %event.event_type, data = %event.data(), "unknown event");
            }
            None => trace!(event = %event.event_type, "event dropped"),
        }
    }

    fn on_connectivity_change(&self, connected: bool) {
        self.push(if connected {
            WorkItem::SessionRefresh
        } else {
            WorkItem::RedrawAll { connected: false }
        });
    }
}
