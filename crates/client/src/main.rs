use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures_util::future::BoxFuture;
use overlook_client::cli::{self, Command};
use overlook_client::config;
use overlook_client::{FrameRenderer, MicrophoneAccess, StreamManager, StreamStatus, VideoFrame};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Headless sink: counts frames, logs keyframes.
#[derive(Default)]
struct FrameCounter {
    frames: AtomicU64,
}

impl FrameRenderer for FrameCounter {
    fn render_frame(&self, frame: &VideoFrame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if frame.keyframe {
            debug!(
                frames = n,
                bytes = frame.data.len(),
                mime_type = %frame.mime_type,
                "Keyframe"
            );
        }
    }
}

/// No OS permission prompt on a headless box: asking means yes.
struct HeadlessMicrophone;

impl MicrophoneAccess for HeadlessMicrophone {
    fn request_access(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async { Ok(true) })
    }
}

/// Log the transitions a user would see in the UI.
async fn log_status(mut rx: watch::Receiver<StreamStatus>) {
    let mut last = rx.borrow().clone();
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        if status.connected != last.connected || status.connecting != last.connecting {
            info!(
                connected = status.connected,
                connecting = status.connecting,
                "Stream state"
            );
        }
        if status.stalled != last.stalled {
            if status.stalled {
                warn!(age = ?status.last_frame_age_secs, "Stream stalled (press r + Enter to reconnect)");
            } else {
                info!("Stream recovered");
            }
        }
        if status.disconnect_reason != last.disconnect_reason
            && let Some(reason) = &status.disconnect_reason
        {
            warn!(reason, "Disconnect reason");
        }
        if status.video_size != last.video_size
            && let Some((width, height)) = status.video_size
        {
            info!(width, height, "Video size");
        }
        last = status;
    }
}

/// Lines typed on stdin: `r` asks for a reconnect.
async fn read_commands(tx: mpsc::Sender<()>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "r" | "reconnect" => {
                if tx.send(()).await.is_err() {
                    return;
                }
            }
            "" => {}
            other => warn!(command = other, "Unknown command (use 'r' to reconnect)"),
        }
    }
}

/// Drive `work` unless `shutdown` completes first (`None`).
async fn unless_shutdown<S, F>(shutdown: Pin<&mut S>, work: F) -> Option<F::Output>
where
    S: Future<Output = ()>,
    F: Future,
{
    tokio::select! {
        _ = shutdown => None,
        out = work => Some(out),
    }
}

async fn connect(manager: &mut StreamManager, capture: bool) {
    match manager.connect().await {
        Ok(()) => info!("Signaling established, waiting for offer"),
        Err(e) => error!("Connect failed: {e}"),
    }
    manager.set_frame_capture_enabled(capture);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for the wss:// signaling socket)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match cli::parse_args()? {
        Command::Run(args) => args,
        Command::Help => {
            cli::print_help();
            return Ok(());
        }
        Command::Version => {
            println!("overlook {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let mut cfg = config::load_config(&args.config_path)?;
    config::apply_overrides(&mut cfg, &args);
    if let Err(issues) = cfg.validate() {
        let mut fatal = false;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
                fatal = true;
            } else {
                warn!("{issue}");
            }
        }
        if fatal {
            anyhow::bail!("Invalid configuration ({} issue(s))", issues.len());
        }
    }

    info!(
        device = %cfg.device.name,
        url = %cfg.device.signaling_url(),
        audio = cfg.stream.audio,
        mic = cfg.stream.mic,
        "Starting overlook"
    );

    let capture = cfg.stream.frame_capture;
    let mut manager = StreamManager::new(cfg)
        .with_renderer(Arc::new(FrameCounter::default()))
        .with_microphone_access(Arc::new(HeadlessMicrophone));

    tokio::spawn(log_status(manager.subscribe()));

    let (reconnect_tx, mut reconnect_rx) = mpsc::channel(4);
    tokio::spawn(read_commands(reconnect_tx));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    };
    tokio::pin!(shutdown);

    // A slow handshake must not hold off Ctrl-C
    if unless_shutdown(shutdown.as_mut(), connect(&mut manager, capture))
        .await
        .is_some()
    {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(()) = reconnect_rx.recv() => {
                    info!("Reconnecting");
                    if unless_shutdown(shutdown.as_mut(), manager.reconnect()).await.is_none() {
                        break;
                    }
                    manager.set_frame_capture_enabled(capture);
                }
                wake = manager.next_event() => manager.handle(wake).await,
            }
        }
    }

    manager.disconnect().await;
    info!("Bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_interrupts_pending_work() {
        let shutdown = async {};
        tokio::pin!(shutdown);
        let out = unless_shutdown(shutdown.as_mut(), std::future::pending::<()>()).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn work_finishing_first_is_returned() {
        let shutdown = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(shutdown);
        let out = unless_shutdown(shutdown.as_mut(), async { 7 }).await;
        assert_eq!(out, Some(7));
    }
}
