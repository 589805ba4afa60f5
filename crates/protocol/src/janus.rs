use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket subprotocol Janus requires during the handshake.
pub const JANUS_SUBPROTOCOL: &str = "janus-protocol";

/// Streaming plugin exposed by PiKVM/GLKVM style devices.
pub const USTREAMER_PLUGIN: &str = "janus.plugin.ustreamer";

/// Requests the client sends to the Janus gateway.
///
/// Every request carries a `transaction`; only `create` and `attach` have
/// their replies awaited, the rest are fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "janus", rename_all = "snake_case")]
pub enum JanusRequest {
    /// Open a gateway session
    Create { transaction: String },
    /// Attach a plugin handle to an existing session
    Attach {
        plugin: String,
        opaque_id: String,
        transaction: String,
        session_id: u64,
    },
    /// Plugin message, optionally carrying a JSEP (our SDP answer)
    Message {
        body: PluginBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
        transaction: String,
        session_id: u64,
        handle_id: u64,
    },
    /// Local ICE candidate, or the end-of-candidates sentinel
    Trickle {
        candidate: TrickleCandidate,
        transaction: String,
        session_id: u64,
        handle_id: u64,
    },
    /// Session keepalive
    Keepalive { session_id: u64, transaction: String },
}

impl JanusRequest {
    pub fn transaction(&self) -> &str {
        match self {
            JanusRequest::Create { transaction }
            | JanusRequest::Attach { transaction, .. }
            | JanusRequest::Message { transaction, .. }
            | JanusRequest::Trickle { transaction, .. }
            | JanusRequest::Keepalive { transaction, .. } => transaction,
        }
    }
}

/// Body of a ustreamer plugin message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PluginBody {
    /// Ask the plugin to start sending the stream; the offer follows as an event
    Watch { params: WatchParams },
    /// Sent together with our answer
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchParams {
    pub orientation: u32,
    pub audio: bool,
    pub video: bool,
    pub mic: bool,
    pub camera: bool,
}

impl WatchParams {
    pub fn new(audio: bool, mic: bool) -> Self {
        Self {
            orientation: 0,
            audio,
            video: true,
            mic,
            camera: false,
        }
    }
}

/// JSEP envelope around an SDP body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl Jsep {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }
}

/// Trickle candidate payload, shared by both directions.
///
/// A real candidate fills `candidate`/`sdpMid`/`sdpMLineIndex`; the
/// end-of-gathering marker only sets `completed: true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickleCandidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl TrickleCandidate {
    /// A gathered local candidate. Missing `sdpMid` defaults to "0".
    pub fn local(candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: Some(candidate),
            sdp_mid: Some(sdp_mid.unwrap_or_else(|| "0".to_string())),
            sdp_mline_index: Some(sdp_mline_index.unwrap_or(0)),
            completed: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            completed: Some(true),
            ..Default::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed == Some(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JanusErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// Anything the gateway sends us: replies, acks, events, trickles.
///
/// Kept loose on purpose so unknown kinds deserialize and get ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JanusMessage {
    pub janus: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<TrickleCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugindata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JanusErrorBody>,
}

impl JanusMessage {
    /// Numeric `data.id`, as returned by `create` (session) and `attach` (handle).
    pub fn data_id(&self) -> Option<u64> {
        self.data.as_ref()?.get("id")?.as_u64()
    }

    pub fn is_error(&self) -> bool {
        self.janus == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_format() {
        let req = JanusRequest::Create {
            transaction: "abc".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""janus":"create""#));
        assert!(json.contains(r#""transaction":"abc""#));
    }

    #[test]
    fn attach_carries_session_id() {
        let req = JanusRequest::Attach {
            plugin: USTREAMER_PLUGIN.to_string(),
            opaque_id: "oid-1".to_string(),
            transaction: "t1".to_string(),
            session_id: 42,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""janus":"attach""#));
        assert!(json.contains(r#""plugin":"janus.plugin.ustreamer""#));
        assert!(json.contains(r#""session_id":42"#));
    }

    #[test]
    fn watch_message_params() {
        let req = JanusRequest::Message {
            body: PluginBody::Watch {
                params: WatchParams::new(true, false),
            },
            jsep: None,
            transaction: "t".to_string(),
            session_id: 1,
            handle_id: 2,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["janus"], "message");
        assert_eq!(value["body"]["request"], "watch");
        assert_eq!(value["body"]["params"]["orientation"], 0);
        assert_eq!(value["body"]["params"]["audio"], true);
        assert_eq!(value["body"]["params"]["video"], true);
        assert_eq!(value["body"]["params"]["mic"], false);
        assert_eq!(value["body"]["params"]["camera"], false);
        assert_eq!(value["handle_id"], 2);
        assert!(value.get("jsep").is_none());
    }

    #[test]
    fn start_message_carries_answer() {
        let req = JanusRequest::Message {
            body: PluginBody::Start,
            jsep: Some(Jsep::answer("v=0\r\n")),
            transaction: "t".to_string(),
            session_id: 1,
            handle_id: 2,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["body"], serde_json::json!({"request": "start"}));
        assert_eq!(value["jsep"]["type"], "answer");
        assert_eq!(value["jsep"]["sdp"], "v=0\r\n");
    }

    #[test]
    fn trickle_candidate_camel_case_keys() {
        let c = TrickleCandidate::local("candidate:1 1 udp 1 10.0.0.2 5000 typ host".into(), None, Some(0));
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(!json.contains("completed"));
    }

    #[test]
    fn trickle_completed_sentinel() {
        let json = serde_json::to_string(&TrickleCandidate::completed()).unwrap();
        assert_eq!(json, r#"{"completed":true}"#);
    }

    #[test]
    fn keepalive_format() {
        let req = JanusRequest::Keepalive {
            session_id: 7,
            transaction: "k".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["janus"], "keepalive");
        assert_eq!(value["session_id"], 7);
        assert_eq!(req.transaction(), "k");
    }

    #[test]
    fn success_reply_data_id() {
        let msg: JanusMessage =
            serde_json::from_str(r#"{"janus":"success","transaction":"x","data":{"id":42}}"#)
                .unwrap();
        assert_eq!(msg.data_id(), Some(42));
        assert!(!msg.is_error());
    }

    #[test]
    fn event_with_offer() {
        let msg: JanusMessage = serde_json::from_str(
            r#"{"janus":"event","session_id":1,"sender":2,
                "plugindata":{"plugin":"janus.plugin.ustreamer","data":{"result":{"status":"started"}}},
                "jsep":{"type":"offer","sdp":"v=0\r\n"}}"#,
        )
        .unwrap();
        assert!(msg.jsep.as_ref().is_some_and(Jsep::is_offer));
        assert!(msg.transaction.is_none());
    }

    #[test]
    fn error_reply() {
        let msg: JanusMessage = serde_json::from_str(
            r#"{"janus":"error","transaction":"t","error":{"code":403,"reason":"Unauthorized request"}}"#,
        )
        .unwrap();
        assert!(msg.is_error());
        assert_eq!(msg.error.unwrap().code, 403);
    }

    #[test]
    fn unknown_kind_still_parses() {
        let msg: JanusMessage =
            serde_json::from_str(r#"{"janus":"webrtcup","session_id":1,"sender":2}"#).unwrap();
        assert_eq!(msg.janus, "webrtcup");
        assert!(msg.data_id().is_none());
    }
}
