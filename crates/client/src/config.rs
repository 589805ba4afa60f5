use std::path::Path;

use anyhow::{Context, Result};
use overlook_protocol::OverlookConfig;

use crate::cli::Args;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<OverlookConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(OverlookConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: OverlookConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Command-line flags win over the file.
pub fn apply_overrides(config: &mut OverlookConfig, args: &Args) {
    if let Some(url) = &args.url {
        config.device.webrtc_url = Some(url.clone());
    }
    if let Some(host) = &args.host {
        config.device.host = host.clone();
    }
    if let Some(port) = args.port {
        config.device.port = port;
    }
    if let Some(token) = &args.auth_token {
        config.device.auth_token = Some(token.clone());
    }
    config.stream.audio |= args.audio;
    config.stream.mic |= args.mic;
    config.stream.frame_capture |= args.capture;
}
