//! An in-process stand-in for the remote application.
//!
//! Speaks the same websocket protocol as the real thing: hello/identify with
//! optional password, single requests, batches and events. Used by the
//! `mock_obs` binary and by the integration tests.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use obsdeck_protocol::{
    authentication_response, encode, op, AuthChallenge, BatchResult, Event, Hello, Identified,
    Identify, RawFrame, Request, RequestBatch, RequestBatchResponse, RequestResponse,
    RequestStatus, RPC_VERSION,
};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message;
use tungstenite::WebSocket;

pub mod status {
    pub const SUCCESS: u32 = 100;
    pub const UNKNOWN_REQUEST_TYPE: u32 = 204;
    pub const MISSING_REQUEST_FIELD: u32 = 300;
    pub const STUDIO_MODE_NOT_ACTIVE: u32 = 506;
    pub const RESOURCE_NOT_FOUND: u32 = 600;
    pub const INVALID_RESOURCE_STATE: u32 = 604;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockItem {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
}

/// Result of applying one request to the model.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: RequestStatus,
    pub data: Option<Value>,
    pub events: Vec<Event>,
}

impl Outcome {
    fn ok(data: Option<Value>) -> Self {
        Self {
            status: RequestStatus {
                result: true,
                code: status::SUCCESS,
                comment: None,
            },
            data,
            events: Vec::new(),
        }
    }

    fn fail(code: u32, comment: impl Into<String>) -> Self {
        Self {
            status: RequestStatus {
                result: false,
                code,
                comment: Some(comment.into()),
            },
            data: None,
            events: Vec::new(),
        }
    }

    fn event(mut self, event_type: &str, data: Value) -> Self {
        self.events.push(event(event_type, data));
        self
    }
}

pub fn event(event_type: &str, data: Value) -> Event {
    Event {
        event_type: event_type.to_string(),
        event_intent: 0,
        event_data: Some(data),
    }
}

fn output_event(event_type: &str, active: bool) -> Event {
    event(
        event_type,
        json!({
            "outputActive": active,
            "outputState": if active {
                "OBS_WEBSOCKET_OUTPUT_STARTED"
            } else {
                "OBS_WEBSOCKET_OUTPUT_STOPPED"
            },
        }),
    )
}

/// Remote state as the mock sees it. Scenes are listed top to bottom.
#[derive(Debug, Clone)]
pub struct MockModel {
    pub scenes: Vec<String>,
    pub program: String,
    pub preview: String,
    pub studio_mode: bool,
    pub transitions: Vec<String>,
    pub transition: String,
    pub duration_ms: u32,
    pub recording: bool,
    pub streaming: bool,
    pub virtualcam: bool,
    /// False when the host has no virtual camera output at all.
    pub virtualcam_available: bool,
    /// Scene items per scene, bottom layer first.
    pub items: Vec<(String, Vec<MockItem>)>,
}

impl MockModel {
    pub fn demo() -> Self {
        let item = |id, name: &str| MockItem {
            id,
            name: name.to_string(),
            enabled: true,
        };
        Self {
            scenes: ["Live1", "Live2", "Black"].map(String::from).to_vec(),
            program: "Live1".into(),
            preview: String::new(),
            studio_mode: false,
            transitions: ["Cut", "Fade", "Stinger"].map(String::from).to_vec(),
            transition: "Stinger".into(),
            duration_ms: 1000,
            recording: false,
            streaming: false,
            virtualcam: false,
            virtualcam_available: true,
            items: vec![
                ("Live1".into(), vec![item(1, "background"), item(2, "camera")]),
                ("Live2".into(), vec![item(3, "slides")]),
                ("Black".into(), Vec::new()),
            ],
        }
    }

    fn has_scene(&self, name: &str) -> bool {
        self.scenes.iter().any(|s| s == name)
    }

    fn scene_items(&mut self, scene: &str) -> Option<&mut Vec<MockItem>> {
        self.items
            .iter_mut()
            .find(|(name, _)| name == scene)
            .map(|(_, items)| items)
    }

    pub fn apply(&mut self, request_type: &str, data: &Value) -> Outcome {
        let scene_arg = data["sceneName"].as_str().map(str::to_owned);
        match request_type {
            "GetVersion" => Outcome::ok(Some(json!({ "rpcVersion": RPC_VERSION }))),
            "GetSceneList" => {
                let count = self.scenes.len();
                let scenes: Vec<Value> = self
                    .scenes
                    .iter()
                    .enumerate()
                    .map(|(idx, name)| json!({ "sceneIndex": count - 1 - idx, "sceneName": name }))
                    .collect();
                Outcome::ok(Some(json!({
                    "currentProgramSceneName": self.program,
                    "currentPreviewSceneName": if self.studio_mode { json!(self.preview) } else { Value::Null },
                    "scenes": scenes,
                })))
            }
            "GetSceneTransitionList" => {
                let transitions: Vec<Value> = self
                    .transitions
                    .iter()
                    .map(|name| json!({ "transitionName": name, "transitionFixed": name == "Cut" }))
                    .collect();
                Outcome::ok(Some(json!({
                    "currentSceneTransitionName": self.transition,
                    "transitions": transitions,
                })))
            }
            "GetCurrentSceneTransition" => Outcome::ok(Some(json!({
                "transitionName": self.transition,
                "transitionDuration": self.duration_ms,
            }))),
            "GetStudioModeEnabled" => {
                Outcome::ok(Some(json!({ "studioModeEnabled": self.studio_mode })))
            }
            "GetRecordStatus" => Outcome::ok(Some(json!({ "outputActive": self.recording }))),
            "GetStreamStatus" => Outcome::ok(Some(json!({ "outputActive": self.streaming }))),
            "GetVirtualCamStatus" | "ToggleVirtualCam" if !self.virtualcam_available => {
                Outcome::fail(status::INVALID_RESOURCE_STATE, "virtual camera unavailable")
            }
            "GetVirtualCamStatus" => Outcome::ok(Some(json!({ "outputActive": self.virtualcam }))),
            "GetCurrentPreviewScene" => {
                if !self.studio_mode {
                    return Outcome::fail(status::STUDIO_MODE_NOT_ACTIVE, "studio mode is off");
                }
                Outcome::ok(Some(json!({ "currentPreviewSceneName": self.preview })))
            }
            "GetSceneItemList" => {
                let Some(scene) = scene_arg else {
                    return Outcome::fail(status::MISSING_REQUEST_FIELD, "sceneName");
                };
                let Some(items) = self.scene_items(&scene) else {
                    return Outcome::fail(status::RESOURCE_NOT_FOUND, scene);
                };
                let items: Vec<Value> = items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| {
                        json!({
                            "sceneItemId": item.id,
                            "sceneItemIndex": idx,
                            "sourceName": item.name,
                            "sourceUuid": format!("uuid-{}", item.id),
                            "sceneItemEnabled": item.enabled,
                        })
                    })
                    .collect();
                Outcome::ok(Some(json!({ "sceneItems": items })))
            }
            "SetCurrentProgramScene" => {
                let Some(scene) = scene_arg.filter(|s| self.has_scene(s)) else {
                    return Outcome::fail(status::RESOURCE_NOT_FOUND, "no such scene");
                };
                self.program = scene.clone();
                Outcome::ok(None)
                    .event("CurrentProgramSceneChanged", json!({ "sceneName": scene }))
                    .event("SceneTransitionEnded", json!({ "transitionName": self.transition }))
            }
            "SetCurrentPreviewScene" => {
                if !self.studio_mode {
                    return Outcome::fail(status::STUDIO_MODE_NOT_ACTIVE, "studio mode is off");
                }
                let Some(scene) = scene_arg.filter(|s| self.has_scene(s)) else {
                    return Outcome::fail(status::RESOURCE_NOT_FOUND, "no such scene");
                };
                self.preview = scene.clone();
                Outcome::ok(None).event("CurrentPreviewSceneChanged", json!({ "sceneName": scene }))
            }
            "SetCurrentSceneTransition" => {
                let name = data["transitionName"].as_str().unwrap_or_default();
                if !self.transitions.iter().any(|t| t == name) {
                    return Outcome::fail(status::RESOURCE_NOT_FOUND, "no such transition");
                }
                self.transition = name.to_string();
                Outcome::ok(None)
                    .event("CurrentSceneTransitionChanged", json!({ "transitionName": name }))
            }
            "SetCurrentSceneTransitionDuration" => {
                let Some(ms) = data["transitionDuration"].as_u64() else {
                    return Outcome::fail(status::MISSING_REQUEST_FIELD, "transitionDuration");
                };
                self.duration_ms = ms as u32;
                Outcome::ok(None).event(
                    "CurrentSceneTransitionDurationChanged",
                    json!({ "transitionDuration": ms }),
                )
            }
            "TriggerStudioModeTransition" => {
                if !self.studio_mode {
                    return Outcome::fail(status::STUDIO_MODE_NOT_ACTIVE, "studio mode is off");
                }
                std::mem::swap(&mut self.program, &mut self.preview);
                Outcome::ok(None)
                    .event("CurrentProgramSceneChanged", json!({ "sceneName": self.program }))
                    .event("CurrentPreviewSceneChanged", json!({ "sceneName": self.preview }))
                    .event("SceneTransitionEnded", json!({ "transitionName": self.transition }))
            }
            "SetStudioModeEnabled" => {
                let enabled = data["studioModeEnabled"].as_bool().unwrap_or(false);
                if enabled == self.studio_mode {
                    return Outcome::ok(None);
                }
                self.studio_mode = enabled;
                self.preview = if enabled { self.program.clone() } else { String::new() };
                Outcome::ok(None)
                    .event("StudioModeStateChanged", json!({ "studioModeEnabled": enabled }))
            }
            "SetSceneItemEnabled" => {
                let (Some(scene), Some(id), Some(enabled)) = (
                    scene_arg,
                    data["sceneItemId"].as_i64(),
                    data["sceneItemEnabled"].as_bool(),
                ) else {
                    return Outcome::fail(status::MISSING_REQUEST_FIELD, "scene item fields");
                };
                let Some(item) = self
                    .scene_items(&scene)
                    .and_then(|items| items.iter_mut().find(|i| i.id == id))
                else {
                    return Outcome::fail(status::RESOURCE_NOT_FOUND, "no such scene item");
                };
                item.enabled = enabled;
                Outcome::ok(None).event(
                    "SceneItemEnableStateChanged",
                    json!({ "sceneName": scene, "sceneItemId": id, "sceneItemEnabled": enabled }),
                )
            }
            "ToggleRecord" => {
                self.recording = !self.recording;
                let mut out = Outcome::ok(Some(json!({ "outputActive": self.recording })));
                out.events.push(output_event("RecordStateChanged", self.recording));
                out
            }
            "ToggleStream" => {
                self.streaming = !self.streaming;
                let mut out = Outcome::ok(Some(json!({ "outputActive": self.streaming })));
                out.events.push(output_event("StreamStateChanged", self.streaming));
                out
            }
            "ToggleVirtualCam" => {
                self.virtualcam = !self.virtualcam;
                let mut out = Outcome::ok(Some(json!({ "outputActive": self.virtualcam })));
                out.events.push(output_event("VirtualcamStateChanged", self.virtualcam));
                out
            }
            other => Outcome::fail(status::UNKNOWN_REQUEST_TYPE, format!("unknown {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub password: Option<String>,
    /// Request types that are recorded but never answered.
    pub silent: Vec<String>,
}

enum Control {
    Event(Event),
    Drop,
}

/// A single-client mock server on its own thread.
pub struct MockObs {
    listen_addr: SocketAddr,
    control: Sender<Control>,
    requests: Arc<Mutex<Vec<String>>>,
    model: Arc<Mutex<MockModel>>,
    shutdown: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockObs {
    pub fn spawn(addr: &str, config: MockConfig, model: MockModel) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listen_addr = listener.local_addr()?;

        let (control, control_rx) = unbounded();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(Mutex::new(model));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = Server {
            config,
            control: control_rx,
            requests: Arc::clone(&requests),
            model: Arc::clone(&model),
            shutdown: Arc::clone(&shutdown),
        };
        let join_handle = thread::Builder::new()
            .name("mock-obs".into())
            .spawn(move || server.run(listener))?;

        Ok(Self {
            listen_addr,
            control,
            requests,
            model,
            shutdown,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Sends an event to the connected client.
    pub fn push_event(&self, event_type: &str, data: Value) {
        let _ = self.control.send(Control::Event(event(event_type, data)));
    }

    /// Applies a request as the operator would and sends the resulting events.
    pub fn operate(&self, request_type: &str, data: Value) -> bool {
        let Ok(mut model) = self.model.lock() else {
            return false;
        };
        let outcome = model.apply(request_type, &data);
        for ev in outcome.events {
            let _ = self.control.send(Control::Event(ev));
        }
        outcome.status.result
    }

    /// Closes the current client connection.
    pub fn drop_client(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Request types received so far, batch entries included.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn model(&self) -> Option<MockModel> {
        self.model.lock().ok().map(|m| m.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for MockObs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Server {
    config: MockConfig,
    control: Receiver<Control>,
    requests: Arc<Mutex<Vec<String>>>,
    model: Arc<Mutex<MockModel>>,
    shutdown: Arc<AtomicBool>,
}

struct Client {
    ws: WebSocket<TcpStream>,
    challenge: Option<AuthChallenge>,
    identified: bool,
}

fn random_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl Server {
    fn run(self, listener: TcpListener) {
        let mut active: Option<Client> = None;

        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(client) = self.accept(stream) {
                        info!(%peer, "mock client connected");
                        if let Some(mut prev) = active.replace(client) {
                            let _ = prev.ws.close(None);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("mock accept failed: {e}"),
            }

            let Some(client) = active.as_mut() else {
                // Controls aimed at a missing client are dropped.
                while self.control.try_recv().is_ok() {}
                thread::sleep(Duration::from_millis(10));
                continue;
            };

            let mut keep = true;
            loop {
                match self.control.try_recv() {
                    Ok(Control::Event(ev)) if client.identified => {
                        keep = send(&mut client.ws, op::EVENT, &ev);
                    }
                    Ok(Control::Event(_)) => {}
                    Ok(Control::Drop) => keep = false,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
                if !keep {
                    break;
                }
            }

            if keep {
                keep = match client.ws.read() {
                    Ok(Message::Text(text)) => self.handle(client, &text),
                    Ok(Message::Close(_)) => false,
                    Ok(_) => true,
                    Err(tungstenite::Error::Io(e))
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        true
                    }
                    Err(_) => false,
                };
            }

            if !keep {
                if let Some(mut client) = active.take() {
                    let _ = client.ws.close(None);
                    let _ = client.ws.flush();
                }
                debug!("mock client dropped");
            }
        }

        if let Some(mut client) = active {
            let _ = client.ws.close(None);
        }
    }

    fn accept(&self, stream: TcpStream) -> Option<Client> {
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_nodelay(true);
        let _ = stream.set_read_timeout(Some(Duration::from_millis(20)));
        let mut ws = match tungstenite::accept(stream) {
            Ok(ws) => ws,
            Err(e) => {
                warn!("mock handshake failed: {e}");
                return None;
            }
        };
        let challenge = self.config.password.as_ref().map(|_| AuthChallenge {
            challenge: random_token(),
            salt: random_token(),
        });
        let hello = Hello {
            obs_web_socket_version: "5.0.0-mock".into(),
            rpc_version: RPC_VERSION,
            authentication: challenge.clone(),
        };
        if !send(&mut ws, op::HELLO, &hello) {
            return None;
        }
        Some(Client {
            ws,
            challenge,
            identified: false,
        })
    }

    /// Returns false when the client must be dropped.
    fn handle(&self, client: &mut Client, text: &str) -> bool {
        let Ok(raw) = serde_json::from_str::<RawFrame>(text) else {
            warn!("mock got malformed frame");
            return false;
        };
        if !client.identified {
            if raw.op != op::IDENTIFY {
                return false;
            }
            let Ok(identify) = serde_json::from_value::<Identify>(raw.d) else {
                return false;
            };
            if let (Some(password), Some(challenge)) = (&self.config.password, &client.challenge) {
                let expected =
                    authentication_response(password, &challenge.salt, &challenge.challenge);
                if identify.authentication.as_deref() != Some(expected.as_str()) {
                    warn!("mock authentication failed");
                    return false;
                }
            }
            client.identified = true;
            return send(
                &mut client.ws,
                op::IDENTIFIED,
                &Identified {
                    negotiated_rpc_version: RPC_VERSION,
                },
            );
        }

        match raw.op {
            op::REQUEST => {
                let Ok(req) = serde_json::from_value::<Request>(raw.d) else {
                    return false;
                };
                let Some(outcome) = self.apply(&req.request_type, req.request_data.as_ref()) else {
                    return true;
                };
                let response = RequestResponse {
                    request_type: req.request_type,
                    request_id: req.request_id,
                    request_status: outcome.status,
                    response_data: outcome.data,
                };
                send(&mut client.ws, op::REQUEST_RESPONSE, &response)
                    && send_events(&mut client.ws, &outcome.events)
            }
            op::REQUEST_BATCH => {
                let Ok(batch) = serde_json::from_value::<RequestBatch>(raw.d) else {
                    return false;
                };
                let mut results = Vec::new();
                let mut events = Vec::new();
                for entry in batch.requests {
                    let Some(outcome) = self.apply(&entry.request_type, entry.request_data.as_ref())
                    else {
                        return true;
                    };
                    let failed = !outcome.status.result;
                    events.extend(outcome.events);
                    results.push(BatchResult {
                        request_type: entry.request_type,
                        request_status: outcome.status,
                        response_data: outcome.data,
                    });
                    if failed && batch.halt_on_failure {
                        break;
                    }
                }
                let response = RequestBatchResponse {
                    request_id: batch.request_id,
                    results,
                };
                send(&mut client.ws, op::REQUEST_BATCH_RESPONSE, &response)
                    && send_events(&mut client.ws, &events)
            }
            other => {
                debug!(op = other, "mock ignored frame");
                true
            }
        }
    }

    /// `None` when the request type is configured to go unanswered.
    fn apply(&self, request_type: &str, data: Option<&Value>) -> Option<Outcome> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request_type.to_string());
        }
        if self.config.silent.iter().any(|s| s == request_type) {
            return None;
        }
        let Ok(mut model) = self.model.lock() else {
            return Some(Outcome::fail(status::RESOURCE_NOT_FOUND, "model unavailable"));
        };
        Some(model.apply(request_type, data.unwrap_or(&Value::Null)))
    }
}

fn send<T: serde::Serialize>(ws: &mut WebSocket<TcpStream>, op: u8, d: &T) -> bool {
    match encode(op, d) {
        Ok(text) => ws.send(Message::Text(text)).is_ok(),
        Err(_) => false,
    }
}

fn send_events(ws: &mut WebSocket<TcpStream>, events: &[Event]) -> bool {
    events.iter().all(|ev| send(ws, op::EVENT, ev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_list_is_top_first_by_descending_index() {
        let mut model = MockModel::demo();
        let out = model.apply("GetSceneList", &Value::Null);
        let scenes = &out.data.unwrap()["scenes"];
        assert_eq!(scenes[0]["sceneName"], "Live1");
        assert_eq!(scenes[0]["sceneIndex"], 2);
        assert_eq!(scenes[2]["sceneIndex"], 0);
    }

    #[test]
    fn studio_requests_fail_outside_studio_mode() {
        let mut model = MockModel::demo();
        let out = model.apply("TriggerStudioModeTransition", &Value::Null);
        assert!(!out.status.result);
        assert_eq!(out.status.code, status::STUDIO_MODE_NOT_ACTIVE);

        model.apply("SetStudioModeEnabled", &json!({ "studioModeEnabled": true }));
        model.apply("SetCurrentPreviewScene", &json!({ "sceneName": "Live2" }));
        let out = model.apply("TriggerStudioModeTransition", &Value::Null);
        assert!(out.status.result);
        assert_eq!(model.program, "Live2");
        assert_eq!(model.preview, "Live1");
        assert_eq!(out.events.len(), 3);
    }

    #[test]
    fn toggles_emit_definitive_output_state() {
        let mut model = MockModel::demo();
        let out = model.apply("ToggleRecord", &Value::Null);
        assert!(model.recording);
        assert_eq!(out.events[0].event_type, "RecordStateChanged");
        assert_eq!(out.events[0].data()["outputState"], "OBS_WEBSOCKET_OUTPUT_STARTED");
    }

    #[test]
    fn unknown_request_type() {
        let out = MockModel::demo().apply("Explode", &Value::Null);
        assert!(!out.status.result);
        assert_eq!(out.status.code, status::UNKNOWN_REQUEST_TYPE);
    }
}
