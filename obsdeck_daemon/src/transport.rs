//! Request/response correlation on top of the network thread.
//!
//! Every outbound frame gets a fresh request id and a [`PendingRequest`] in the
//! outstanding table. The network thread resolves entries as responses arrive
//! and fails every entry when the connection drops. An entry leaves the table
//! exactly once, and its completion sender goes with it.

use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::net::{NetworkThread, Outbound};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use obsdeck_protocol::{
    encode, op, BatchEntry, BatchResult, Event, Inbound, Request, RequestBatch,
    RequestBatchResponse, RequestResponse, EXECUTION_SERIAL_REALTIME,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_PORT: u16 = 4455;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Identifying,
    Connected,
    Running,
    Writable,
    Terminated,
}

impl ConnectionState {
    /// Requests may be sent in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Running | ConnectionState::Writable)
    }
}

/// Receives inbound traffic on the network thread.
///
/// Implementations must not block on application state.
pub trait TransportObserver: Send + Sync {
    fn on_event(&self, event: Event);
    fn on_connectivity_change(&self, connected: bool);
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub server: String,
    pub port: u16,
    pub password: Option<String>,
    pub log_events: bool,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: DEFAULT_PORT,
            password: None,
            log_events: false,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Emit,
    Call,
    Batch,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Response(RequestResponse),
    Batch(RequestBatchResponse),
    /// The remote answered, but the answer did not decode.
    Malformed(String),
    Failed,
}

pub(crate) struct PendingRequest {
    mode: Mode,
    completion: Option<Sender<Reply>>,
}

impl PendingRequest {
    fn complete(self, reply: Reply) {
        if let Some(tx) = self.completion {
            let _ = tx.send(reply);
        }
    }
}

pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
    cv: Condvar,
}

impl StateCell {
    fn new(initial: ConnectionState) -> Self {
        Self {
            state: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Terminated)
    }

    /// Terminated is final; any other transition out of it is refused.
    pub(crate) fn set(&self, next: ConnectionState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state == ConnectionState::Terminated {
            return false;
        }
        if *state != next {
            trace!(from = ?*state, to = ?next, "connection state");
            *state = next;
            self.cv.notify_all();
        }
        true
    }

    /// Blocks while `keep_waiting` holds, up to `timeout`. Returns the last state seen.
    pub(crate) fn wait_while(
        &self,
        timeout: Duration,
        mut keep_waiting: impl FnMut(ConnectionState) -> bool,
    ) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return ConnectionState::Terminated;
        };
        while keep_waiting(*state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.cv.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => state = guard,
                Err(_) => return ConnectionState::Terminated,
            }
        }
        *state
    }
}

/// State shared between the request API and the network thread.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    outstanding: Mutex<HashMap<String, PendingRequest>>,
    outbound: Sender<Outbound>,
}

impl Shared {
    pub(crate) fn new(outbound: Sender<Outbound>) -> Self {
        Self {
            state: StateCell::new(ConnectionState::Idle),
            outstanding: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Records the request and queues its frame for the network thread.
    ///
    /// The state check happens under the table lock; the network thread flips
    /// the state before sweeping the table, so a request is either swept or
    /// refused, never stranded.
    fn submit(
        &self,
        id: String,
        text: String,
        mode: Mode,
        completion: Option<Sender<Reply>>,
    ) -> Result<(), TransportError> {
        let Ok(mut outstanding) = self.outstanding.lock() else {
            return Err(TransportError::Terminated);
        };
        match self.state.get() {
            ConnectionState::Terminated => return Err(TransportError::Terminated),
            s if !s.is_usable() => return Err(TransportError::NoConnection),
            _ => {}
        }
        outstanding.insert(id.clone(), PendingRequest { mode, completion });
        if self.outbound.send(Outbound { id: id.clone(), text }).is_err() {
            outstanding.remove(&id);
            return Err(TransportError::Terminated);
        }
        Ok(())
    }

    /// Hands a response to whoever waits for it.
    pub(crate) fn resolve(&self, inbound: Inbound) {
        let Some(id) = inbound.request_id().map(str::to_owned) else {
            return;
        };
        let entry = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.remove(&id),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            debug!(%id, "response for unknown request");
            return;
        };
        let reply = match inbound {
            Inbound::Response(r) => {
                if entry.mode == Mode::Emit && !r.request_status.result {
                    warn!(
                        request = %r.request_type,
                        code = r.request_status.code,
                        comment = r.request_status.comment.as_deref().unwrap_or(""),
                        "emitted request failed"
                    );
                }
                Reply::Response(r)
            }
            Inbound::BatchResponse(r) => Reply::Batch(r),
            Inbound::Malformed { reason, .. } => {
                warn!(%id, "undecodable response: {reason}");
                Reply::Malformed(reason)
            }
            _ => Reply::Failed,
        };
        entry.complete(reply);
    }

    /// Fails every outstanding request. Called when the connection is lost.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<PendingRequest> = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing outstanding requests");
        }
        for entry in drained {
            entry.complete(Reply::Failed);
        }
    }

    /// Drops a frame that never made it onto the wire.
    pub(crate) fn fail_one(&self, id: &str) {
        let entry = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.remove(id),
            Err(_) => None,
        };
        if let Some(entry) = entry {
            entry.complete(Reply::Failed);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding_len(&self) -> usize {
        self.outstanding.lock().map(|o| o.len()).unwrap_or(0)
    }
}

/// One logical connection to the remote application.
pub struct Transport {
    shared: Arc<Shared>,
    net: NetworkThread,
}

impl Transport {
    pub fn start(config: TransportConfig, observer: Arc<dyn TransportObserver>) -> Self {
        let (out_tx, out_rx) = unbounded();
        let shared = Arc::new(Shared::new(out_tx));
        let net = NetworkThread::spawn(config, Arc::clone(&shared), out_rx, observer);
        Self { shared, net }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Waits until requests can be sent. Returns false on timeout or termination.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        self.shared
            .state
            .wait_while(timeout, |s| !s.is_usable() && s != ConnectionState::Terminated)
            .is_usable()
    }

    /// Fire-and-forget. The response, when it arrives, is discarded.
    pub fn emit(&self, request_type: &str, data: Option<Value>) -> Result<(), TransportError> {
        let (id, text) = request_frame(request_type, data)?;
        self.shared.submit(id, text, Mode::Emit, None)
    }

    /// Sends a request and blocks until its response arrives or the
    /// connection is lost. Returns the response data (`Null` if absent).
    pub fn call(&self, request_type: &str, data: Option<Value>) -> Result<Value, TransportError> {
        let (id, text) = request_frame(request_type, data)?;
        match self.roundtrip(id, text, Mode::Call)? {
            Reply::Response(r) if r.request_status.result => {
                Ok(r.response_data.unwrap_or(Value::Null))
            }
            Reply::Response(r) => Err(TransportError::RequestFailed {
                code: r.request_status.code,
                comment: r.request_status.comment.unwrap_or_default(),
            }),
            Reply::Malformed(reason) => Err(TransportError::MalformedResponse(reason)),
            Reply::Batch(_) | Reply::Failed => Err(TransportError::NoConnection),
        }
    }

    /// Sends all entries as one request, executed in order by the remote.
    /// Returns one result per entry.
    pub fn batch(&self, requests: Vec<BatchEntry>) -> Result<Vec<BatchResult>, TransportError> {
        let id = new_request_id();
        let text = encode(
            op::REQUEST_BATCH,
            &RequestBatch {
                request_id: id.clone(),
                halt_on_failure: false,
                execution_type: EXECUTION_SERIAL_REALTIME,
                requests,
            },
        )?;
        match self.roundtrip(id, text, Mode::Batch)? {
            Reply::Batch(r) => Ok(r.results),
            Reply::Malformed(reason) => Err(TransportError::MalformedResponse(reason)),
            Reply::Response(_) | Reply::Failed => Err(TransportError::NoConnection),
        }
    }

    fn roundtrip(&self, id: String, text: String, mode: Mode) -> Result<Reply, TransportError> {
        let (tx, rx): (Sender<Reply>, Receiver<Reply>) = bounded(1);
        self.shared.submit(id, text, mode, Some(tx))?;
        match rx.recv() {
            Ok(Reply::Failed) | Err(_) => {
                if self.state() == ConnectionState::Terminated {
                    Err(TransportError::Terminated)
                } else {
                    Err(TransportError::NoConnection)
                }
            }
            Ok(reply) => Ok(reply),
        }
    }

    /// Stops the network thread and fails everything still outstanding.
    pub fn terminate(&self) {
        self.shared.state.set(ConnectionState::Terminated);
        self.shared.fail_all();
        self.net.shutdown();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn request_frame(request_type: &str, data: Option<Value>) -> Result<(String, String), TransportError> {
    let id = new_request_id();
    let text = encode(
        op::REQUEST,
        &Request {
            request_type: request_type.to_string(),
            request_id: id.clone(),
            request_data: data,
        },
    )?;
    Ok((id, text))
}
