//! # Wire Protocol Messages
//!
//! Serializable types exchanged with peers and with the external services.
//!
//! | Channel | Request | Response |
//! |---------|---------|----------|
//! | Peer RPC | [`RequestFrame`] (wraps [`RequestEnvelope`]) | [`PeerResponse`] |
//! | Trust scorer | [`ValidateRequest`] | [`ValidateResponse`] |
//! | Registration | [`RegisterRequest`] | [`RegisterResponse`] |
//! | Peer listing | - | `Vec<`[`ListedPeer`]`>` |
//!
//! Peer frames are bincode with bounded deserialization. The envelope's type is
//! carried as a string tag on the wire so that a tag this node does not know
//! decodes into [`Request::Unknown`] rather than failing the frame.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::registry::Uid;

/// Maximum size of a single peer frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Status code a peer returns for a handled request.
pub const STATUS_OK: u16 = 200;

/// Status code for requests the peer refused to act on.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Free-form string map used for envelope fields and response outputs.
pub type Fields = BTreeMap<String, String>;

pub const FIELD_FROM: &str = "from";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_UIDS: &str = "uids";

const TAG_HEALTH: &str = "health";
const TAG_PING: &str = "ping";
const TAG_TASK: &str = "task";

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with the frame size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Health,
    Ping,
    Task { method: String, data: String },
    /// A type tag this node does not recognize. Never fanned out.
    Unknown(String),
}

impl Request {
    pub fn type_tag(&self) -> &str {
        match self {
            Request::Health => TAG_HEALTH,
            Request::Ping => TAG_PING,
            Request::Task { .. } => TAG_TASK,
            Request::Unknown(tag) => tag,
        }
    }
}

/// Tagged request payload plus free-form identification fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireEnvelope", into = "WireEnvelope")]
pub struct RequestEnvelope {
    pub request: Request,
    pub fields: Fields,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireEnvelope {
    kind: String,
    method: Option<String>,
    data: Option<String>,
    fields: Fields,
}

impl From<WireEnvelope> for RequestEnvelope {
    fn from(wire: WireEnvelope) -> Self {
        let request = match wire.kind.as_str() {
            TAG_HEALTH => Request::Health,
            TAG_PING => Request::Ping,
            TAG_TASK => match wire.method {
                Some(method) => Request::Task {
                    method,
                    data: wire.data.unwrap_or_default(),
                },
                None => Request::Unknown(wire.kind),
            },
            _ => Request::Unknown(wire.kind),
        };
        Self { request, fields: wire.fields }
    }
}

impl From<RequestEnvelope> for WireEnvelope {
    fn from(env: RequestEnvelope) -> Self {
        let kind = env.request.type_tag().to_string();
        let (method, data) = match env.request {
            Request::Task { method, data } => (Some(method), Some(data)),
            _ => (None, None),
        };
        Self { kind, method, data, fields: env.fields }
    }
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self { request, fields: Fields::new() }
    }

    pub fn health() -> Self {
        Self::new(Request::Health)
    }

    pub fn ping() -> Self {
        Self::new(Request::Ping)
    }

    pub fn task(method: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(Request::Task { method: method.into(), data: data.into() })
    }

    /// Ping stamped as originating from `uid`, used to drive our own rounds.
    pub fn self_ping(uid: Uid, source: &str, timestamp_ms: u64) -> Self {
        Self::ping()
            .with_field(FIELD_FROM, uid.to_string())
            .with_field(FIELD_TIMESTAMP, timestamp_ms.to_string())
            .with_field(FIELD_SOURCE, source)
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Attach an explicit target list for relayed tasks.
    pub fn with_uids(self, uids: &[Uid]) -> Self {
        let joined = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        self.with_field(FIELD_UIDS, joined)
    }

    /// Declared sender uid. Missing or unparsable values yield `None`.
    pub fn from_uid(&self) -> Option<Uid> {
        self.fields.get(FIELD_FROM)?.trim().parse().ok()
    }

    /// Explicit target uids, if the envelope names any. Entries that are not
    /// integers are dropped.
    pub fn explicit_uids(&self) -> Option<Vec<Uid>> {
        let raw = self.fields.get(FIELD_UIDS)?;
        let uids: Vec<Uid> = raw
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if uids.is_empty() { None } else { Some(uids) }
    }
}

/// Request as it travels on a peer connection: envelope plus sender identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    pub sender: Uid,
    pub envelope: RequestEnvelope,
}

/// Response as it travels on a peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerResponse {
    pub status: u16,
    pub output: Fields,
}

impl PeerResponse {
    pub fn ok(output: Fields) -> Self {
        Self { status: STATUS_OK, output }
    }

    pub fn rejected(output: Fields) -> Self {
        Self { status: STATUS_BAD_REQUEST, output }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Standard output map `{method, success, uid}`.
pub fn output(method: &str, success: bool, uid: Uid) -> Fields {
    let mut out = Fields::new();
    out.insert("method".into(), method.into());
    out.insert("success".into(), success.to_string());
    out.insert("uid".into(), uid.to_string());
    out
}

/// Outcome of querying one peer within a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    #[serde(rename = "uid")]
    pub peer_id: Uid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Fields>,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ResponseRecord {
    pub fn ok(peer_id: Uid, payload: Fields) -> Self {
        Self { peer_id, success: true, payload: Some(payload), error_kind: None }
    }

    pub fn failed(peer_id: Uid, kind: ErrorKind) -> Self {
        Self { peer_id, success: false, payload: None, error_kind: Some(kind) }
    }

    /// The node's own synthetic result, always successful.
    pub fn self_result(uid: Uid) -> Self {
        Self::ok(uid, output(TAG_PING, true, uid))
    }
}

// ============================================================================
// External service payloads (JSON)
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub uids: Vec<Uid>,
    pub responses: Vec<ResponseRecord>,
    pub chain: String,
    pub uid: Uid,
    pub netuid: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateResponse {
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub uids: Vec<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidateResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), ..Default::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub uid: Uid,
    pub chain: String,
    pub netuid: u16,
    #[serde(rename = "type")]
    pub neuron_type: String,
    pub account: String,
    pub token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedPeer {
    pub channel: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_survives_the_wire() {
        let wire = WireEnvelope {
            kind: "gossip-v9".into(),
            method: None,
            data: None,
            fields: Fields::new(),
        };
        let bytes = serialize_frame(&wire).unwrap();
        let env: RequestEnvelope = deserialize_bounded(&bytes).unwrap();
        assert_eq!(env.request, Request::Unknown("gossip-v9".into()));
    }

    #[test]
    fn task_without_method_is_unknown() {
        let wire = WireEnvelope {
            kind: TAG_TASK.into(),
            method: None,
            data: Some("{}".into()),
            fields: Fields::new(),
        };
        let env = RequestEnvelope::from(wire);
        assert!(matches!(env.request, Request::Unknown(_)));
    }

    #[test]
    fn task_frame_keeps_fields() {
        let env = RequestEnvelope::task("chat", r#"{"q":"hi"}"#).with_uids(&[4, 7]);
        let frame = RequestFrame { sender: 9, envelope: env.clone() };
        let bytes = serialize_frame(&frame).unwrap();
        let decoded: RequestFrame = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.sender, 9);
        assert_eq!(decoded.envelope, env);
        assert_eq!(decoded.envelope.explicit_uids(), Some(vec![4, 7]));
    }

    #[test]
    fn malformed_frame_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_bounded::<RequestFrame>(&garbage).is_err());
    }

    #[test]
    fn self_ping_identifies_sender() {
        let env = RequestEnvelope::self_ping(12, "round_loop", 1_700_000_000_000);
        assert_eq!(env.request, Request::Ping);
        assert_eq!(env.from_uid(), Some(12));
        assert_eq!(env.fields.get(FIELD_SOURCE).map(String::as_str), Some("round_loop"));
    }

    #[test]
    fn explicit_uids_skips_garbage() {
        let env = RequestEnvelope::task("m", "").with_field(FIELD_UIDS, "3, x,5");
        assert_eq!(env.explicit_uids(), Some(vec![3, 5]));
        let env = RequestEnvelope::task("m", "").with_field(FIELD_UIDS, "x");
        assert_eq!(env.explicit_uids(), None);
    }

    #[test]
    fn response_record_json_shape() {
        let rec = ResponseRecord::failed(3, ErrorKind::Timeout);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["uid"], 3);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "timeout");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn validate_response_tolerates_missing_fields() {
        let resp: ValidateResponse = serde_json::from_str(r#"{"error":"down"}"#).unwrap();
        assert!(resp.values.is_empty());
        assert_eq!(resp.error.as_deref(), Some("down"));
    }

    #[test]
    fn register_request_uses_type_key() {
        let req = RegisterRequest {
            uid: 1,
            chain: "bittensor".into(),
            netuid: 2,
            neuron_type: "validator".into(),
            account: "abc".into(),
            token: "t".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "validator");
    }
}
