use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Label of the data channel carrying input events and latency probes.
pub const INPUT_CHANNEL_LABEL: &str = "input-events";

/// Input event forwarded to the device over the data channel.
///
/// The device-side HID bridge decides what `type` values mean; the client
/// only guarantees the `{type, data}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl InputEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// JSON bytes, sent as a binary data-channel frame.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Control messages exchanged on the input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Latency probe, `timestamp` in seconds since the Unix epoch
    Ping { timestamp: f64 },
    /// Probe reply; the echoed timestamp is not trusted
    Pong {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    /// Frame metadata from the device, currently unused
    VideoFrame,
    #[serde(other)]
    Other,
}

impl ChannelMessage {
    pub fn ping_now() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        ChannelMessage::Ping { timestamp }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
