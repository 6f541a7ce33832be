mod auth;
mod frame;

pub use auth::authentication_response;
pub use frame::FrameBuffer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only negotiated rpc version this client speaks.
pub const RPC_VERSION: u32 = 1;

pub mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
    pub const REQUEST_BATCH: u8 = 8;
    pub const REQUEST_BATCH_RESPONSE: u8 = 9;
}

/// Event subscription bits sent in `Identify`.
pub mod subscription {
    pub const GENERAL: u32 = 1 << 0;
    pub const CONFIG: u32 = 1 << 1;
    pub const SCENES: u32 = 1 << 2;
    pub const INPUTS: u32 = 1 << 3;
    pub const TRANSITIONS: u32 = 1 << 4;
    pub const FILTERS: u32 = 1 << 5;
    pub const OUTPUTS: u32 = 1 << 6;
    pub const SCENE_ITEMS: u32 = 1 << 7;
    pub const MEDIA_INPUTS: u32 = 1 << 8;
    pub const VENDORS: u32 = 1 << 9;
    pub const UI: u32 = 1 << 10;

    pub const DECK: u32 = SCENES | INPUTS | TRANSITIONS | OUTPUTS | SCENE_ITEMS | UI;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RawFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Serialize, Debug, Clone)]
struct Envelope<'a, T> {
    op: u8,
    d: &'a T,
}

pub fn encode<T: Serialize>(op: u8, d: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&Envelope { op, d })?)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub obs_web_socket_version: String,
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    pub event_subscriptions: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RequestStatus {
    pub result: bool,
    #[serde(default)]
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

/// One sub-operation of a batch.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

impl BatchEntry {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            request_data: None,
        }
    }

    pub fn with_data(request_type: impl Into<String>, data: Value) -> Self {
        Self {
            request_type: request_type.into(),
            request_data: Some(data),
        }
    }
}

/// Sub-requests run one after another on the remote side.
pub const EXECUTION_SERIAL_REALTIME: i32 = 0;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatch {
    pub request_id: String,
    #[serde(default)]
    pub halt_on_failure: bool,
    #[serde(default)]
    pub execution_type: i32,
    pub requests: Vec<BatchEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub request_type: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

impl BatchResult {
    pub fn ok(&self) -> bool {
        self.request_status.result
    }

    pub fn data(&self) -> &Value {
        self.response_data.as_ref().unwrap_or(&Value::Null)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatchResponse {
    pub request_id: String,
    pub results: Vec<BatchResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub event_intent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

impl Event {
    pub fn data(&self) -> &Value {
        self.event_data.as_ref().unwrap_or(&Value::Null)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Hello(Hello),
    Identified(Identified),
    Event(Event),
    Response(RequestResponse),
    BatchResponse(RequestBatchResponse),
    /// A response that names its request but does not decode.
    Malformed {
        op: u8,
        request_id: String,
        reason: String,
    },
    Other(u8),
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::classify(serde_json::from_str(text)?)
    }

    pub fn classify(raw: RawFrame) -> Result<Self, ProtocolError> {
        Ok(match raw.op {
            op::HELLO => Inbound::Hello(serde_json::from_value(raw.d)?),
            op::IDENTIFIED => Inbound::Identified(serde_json::from_value(raw.d)?),
            op::EVENT => Inbound::Event(serde_json::from_value(raw.d)?),
            op::REQUEST_RESPONSE => {
                let request_id = raw.d["requestId"].as_str().map(str::to_owned);
                match serde_json::from_value(raw.d) {
                    Ok(r) => Inbound::Response(r),
                    Err(e) => return malformed(op::REQUEST_RESPONSE, request_id, e),
                }
            }
            op::REQUEST_BATCH_RESPONSE => {
                let request_id = raw.d["requestId"].as_str().map(str::to_owned);
                match serde_json::from_value(raw.d) {
                    Ok(r) => Inbound::BatchResponse(r),
                    Err(e) => return malformed(op::REQUEST_BATCH_RESPONSE, request_id, e),
                }
            }
            other => Inbound::Other(other),
        })
    }

    /// Correlation id of a response frame.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Inbound::Response(r) => Some(&r.request_id),
            Inbound::BatchResponse(r) => Some(&r.request_id),
            Inbound::Malformed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Without a request id nobody can be told, so the frame is just an error.
fn malformed(
    op: u8,
    request_id: Option<String>,
    err: serde_json::Error,
) -> Result<Inbound, ProtocolError> {
    match request_id {
        Some(request_id) => Ok(Inbound::Malformed {
            op,
            request_id,
            reason: err.to_string(),
        }),
        None => Err(ProtocolError::Json(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = Request {
            request_type: "SetCurrentProgramScene".to_string(),
            request_id: "abc".to_string(),
            request_data: Some(json!({ "sceneName": "Live1" })),
        };
        let text = encode(op::REQUEST, &req).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["op"], 6);
        assert_eq!(v["d"]["requestId"], "abc");
        assert_eq!(v["d"]["requestType"], "SetCurrentProgramScene");
        assert_eq!(v["d"]["requestData"]["sceneName"], "Live1");
    }

    #[test]
    fn identify_omits_missing_authentication() {
        let ident = Identify {
            rpc_version: RPC_VERSION,
            authentication: None,
            event_subscriptions: subscription::DECK,
        };
        let v: Value = serde_json::from_str(&encode(op::IDENTIFY, &ident).unwrap()).unwrap();
        assert_eq!(v["op"], 1);
        assert!(v["d"].get("authentication").is_none());
        assert_eq!(v["d"]["eventSubscriptions"], 1244);
    }

    #[test]
    fn hello_with_auth_challenge() {
        let text = r#"{"op":0,"d":{"obsWebSocketVersion":"5.0.1","rpcVersion":1,
            "authentication":{"challenge":"c","salt":"s"}}}"#;
        match Inbound::decode(text).unwrap() {
            Inbound::Hello(h) => {
                let auth = h.authentication.unwrap();
                assert_eq!(auth.challenge, "c");
                assert_eq!(auth.salt, "s");
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn batch_response_carries_request_id() {
        let text = r#"{"op":9,"d":{"requestId":"b1","results":[
            {"requestType":"GetStudioModeEnabled","requestStatus":{"result":true,"code":100},
             "responseData":{"studioModeEnabled":false}}]}}"#;
        let inbound = Inbound::decode(text).unwrap();
        assert_eq!(inbound.request_id(), Some("b1"));
        let Inbound::BatchResponse(resp) = inbound else {
            panic!("expected batch response");
        };
        assert!(resp.results[0].ok());
        assert_eq!(resp.results[0].data()["studioModeEnabled"], false);
    }

    #[test]
    fn undecodable_response_keeps_its_request_id() {
        let text = r#"{"op":7,"d":{"requestType":"GetSceneList","requestId":"req-1"}}"#;
        let inbound = Inbound::decode(text).unwrap();
        assert_eq!(inbound.request_id(), Some("req-1"));
        assert!(matches!(inbound, Inbound::Malformed { op: 7, .. }));

        let text = r#"{"op":9,"d":{"requestId":"b2","results":"nope"}}"#;
        assert_eq!(Inbound::decode(text).unwrap().request_id(), Some("b2"));

        // No id to report back to.
        assert!(Inbound::decode(r#"{"op":7,"d":{"requestType":"GetSceneList"}}"#).is_err());
    }
}
