use serde::{Deserialize, Serialize};

use crate::janus::USTREAMER_PLUGIN;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlookConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// The KVM device to connect to.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name, used in logs only
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Hostname or IP of the device's web UI
    #[serde(default)]
    pub host: String,
    /// HTTPS port of the web UI
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit Janus WebSocket URL (derived from host/port if absent)
    pub webrtc_url: Option<String>,
    /// Session cookie value obtained from the device login
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("webrtc_url", &self.webrtc_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl DeviceConfig {
    /// URL handed to the signaling client before scheme normalisation.
    pub fn signaling_url(&self) -> String {
        match &self.webrtc_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!("https://{}:{}/janus/ws", self.host, self.port),
        }
    }

    /// Value of the `Origin` header the device's web server expects.
    pub fn origin(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Ask the device to include its audio track
    #[serde(default)]
    pub audio: bool,
    /// Send the local microphone to the device
    #[serde(default)]
    pub mic: bool,
    /// Keep the latest decoded frame around for snapshot/OCR consumers
    #[serde(default)]
    pub frame_capture: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Janus plugin to attach
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Keepalive period in seconds (Janus drops idle sessions after 60s)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds to wait for a create/attach reply
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    /// Accept any server certificate (devices ship self-signed certs)
    #[serde(default = "default_true")]
    pub allow_insecure_tls: bool,
    /// PEM certificate to pin in addition to the system roots
    pub tls_cert: Option<String>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN server)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

/// Stream health and telemetry cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    /// Frame silence after which a connected stream counts as stalled
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_ms: u64,
    /// Grace period for the first frame after ICE connects
    #[serde(default = "default_initial_frame_timeout")]
    pub initial_frame_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            host: String::new(),
            port: default_port(),
            webrtc_url: None,
            auth_token: None,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            keepalive_interval_secs: default_keepalive_interval(),
            reply_timeout_secs: default_reply_timeout(),
            allow_insecure_tls: true,
            tls_cert: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            stats_interval_ms: default_stats_interval(),
            stall_threshold_ms: default_stall_threshold(),
            initial_frame_timeout_ms: default_initial_frame_timeout(),
        }
    }
}

impl OverlookConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the client should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Device ---
        let has_url = self
            .device
            .webrtc_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        if self.device.host.trim().is_empty() && !has_url {
            issues.push(
                "ERROR: device.host is empty and no device.webrtc_url is set. \
                 Set one of them (e.g. host = \"192.168.8.1\")."
                    .to_string(),
            );
        }
        if self.device.host.trim() != self.device.host {
            issues.push(format!(
                "WARNING: device.host '{}' has leading/trailing whitespace.",
                self.device.host
            ));
        }
        if self.device.port == 0 {
            issues.push("ERROR: device.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.device.auth_token().is_none() {
            issues.push(
                "WARNING: device.auth_token is not set. Most devices reject \
                 unauthenticated signaling with 401/403."
                    .to_string(),
            );
        }

        // --- Signaling ---
        if self.signaling.plugin.trim().is_empty() {
            issues.push("ERROR: signaling.plugin must not be empty.".to_string());
        }
        if self.signaling.keepalive_interval_secs == 0 {
            issues.push("ERROR: signaling.keepalive_interval_secs must be >= 1.".to_string());
        } else if self.signaling.keepalive_interval_secs >= 60 {
            issues.push(format!(
                "WARNING: signaling.keepalive_interval_secs is {}s. Janus expires idle \
                 sessions after 60s, so the session will likely time out.",
                self.signaling.keepalive_interval_secs
            ));
        }
        if self.signaling.reply_timeout_secs == 0 {
            issues.push("ERROR: signaling.reply_timeout_secs must be >= 1.".to_string());
        }
        if let Some(cert) = &self.signaling.tls_cert
            && !std::path::Path::new(cert).exists()
        {
            issues.push(format!(
                "ERROR: signaling.tls_cert '{}' does not exist.",
                cert
            ));
        }

        // --- Health ---
        if self.health.check_interval_ms == 0 {
            issues.push("ERROR: health.check_interval_ms must be >= 1.".to_string());
        }
        if self.health.stats_interval_ms == 0 {
            issues.push("ERROR: health.stats_interval_ms must be >= 1.".to_string());
        }
        if self.health.stall_threshold_ms < self.health.check_interval_ms {
            issues.push(format!(
                "WARNING: health.stall_threshold_ms ({}) is shorter than \
                 health.check_interval_ms ({}); stalls will be reported late.",
                self.health.stall_threshold_ms, self.health.check_interval_ms
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential."
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_device_name() -> String {
    "KVM".to_string()
}
fn default_port() -> u16 {
    443
}
fn default_plugin() -> String {
    USTREAMER_PLUGIN.to_string()
}
fn default_keepalive_interval() -> u64 {
    25
}
fn default_reply_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    1000
}
fn default_stats_interval() -> u64 {
    1000
}
fn default_stall_threshold() -> u64 {
    3000
}
fn default_initial_frame_timeout() -> u64 {
    5000
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(host: &str) -> OverlookConfig {
        let mut config = OverlookConfig::default();
        config.device.host = host.to_string();
        config.device.auth_token = Some("secret".to_string());
        config
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: OverlookConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.device.name, "KVM");
        assert_eq!(config.device.host, "");
        assert_eq!(config.device.port, 443);
        assert!(config.device.webrtc_url.is_none());
        assert!(config.device.auth_token.is_none());

        assert!(!config.stream.audio);
        assert!(!config.stream.mic);
        assert!(!config.stream.frame_capture);

        assert_eq!(config.signaling.plugin, "janus.plugin.ustreamer");
        assert_eq!(config.signaling.keepalive_interval_secs, 25);
        assert_eq!(config.signaling.reply_timeout_secs, 10);
        assert!(config.signaling.allow_insecure_tls);
        assert!(config.signaling.tls_cert.is_none());

        assert_eq!(config.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.ice.turn_urls.is_empty());

        assert_eq!(config.health.check_interval_ms, 1000);
        assert_eq!(config.health.stats_interval_ms, 1000);
        assert_eq!(config.health.stall_threshold_ms, 3000);
        assert_eq!(config.health.initial_frame_timeout_ms, 5000);
    }

    #[test]
    fn partial_config_only_device_section() {
        let toml_str = r#"
[device]
host = "glkvm.local"
auth_token = "abc"
"#;
        let config: OverlookConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.host, "glkvm.local");
        assert_eq!(config.device.port, 443);
        assert_eq!(config.device.auth_token(), Some("abc"));
        assert_eq!(config.signaling.keepalive_interval_secs, 25);
    }

    #[test]
    fn signaling_url_derived_from_host() {
        let config = device("10.0.0.5");
        assert_eq!(config.device.signaling_url(), "https://10.0.0.5:443/janus/ws");
        assert_eq!(config.device.origin(), "https://10.0.0.5:443");
    }

    #[test]
    fn explicit_webrtc_url_wins() {
        let mut config = device("10.0.0.5");
        config.device.webrtc_url = Some("ws://10.0.0.5:8080/janus/ws".to_string());
        assert_eq!(config.device.signaling_url(), "ws://10.0.0.5:8080/janus/ws");
    }

    #[test]
    fn empty_token_is_no_token() {
        let mut config = device("h");
        config.device.auth_token = Some(String::new());
        assert!(config.device.auth_token().is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let config = device("h");
        let debug = format!("{:?}", config.device);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn valid_config_passes() {
        assert!(device("10.0.0.5").validate().is_ok());
    }

    #[test]
    fn missing_host_is_error() {
        let issues = device("").validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("device.host")));
    }

    #[test]
    fn url_without_host_is_allowed() {
        let mut config = device("");
        config.device.webrtc_url = Some("wss://kvm/janus/ws".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_token_is_warning_only() {
        let mut config = device("h");
        config.device.auth_token = None;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn long_keepalive_warns() {
        let mut config = device("h");
        config.signaling.keepalive_interval_secs = 90;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn zero_intervals_are_errors() {
        let mut config = device("h");
        config.signaling.keepalive_interval_secs = 0;
        config.health.check_interval_ms = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().filter(|i| i.starts_with("ERROR:")).count() >= 2);
    }

    #[test]
    fn bad_stun_url() {
        let mut config = device("h");
        config.ice.stun_urls = vec!["stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("STUN URL")));
    }

    #[test]
    fn missing_pinned_cert_is_error() {
        let mut config = device("h");
        config.signaling.tls_cert = Some("/nonexistent/cert.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("tls_cert")));
    }
}
