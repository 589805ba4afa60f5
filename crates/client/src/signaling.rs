//! Janus-over-WebSocket signaling.
//!
//! [`SignalingSocket`] owns the WebSocket and a pump task; [`JanusSignaling`]
//! is the request side the manager drives (create, attach, watch, answer,
//! trickle, keepalive). Replies are matched by transaction id through the
//! shared [`TransactionCorrelator`]; everything else becomes a
//! [`SessionEvent`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use overlook_protocol::{
    DeviceConfig, JANUS_SUBPROTOCOL, JanusMessage, JanusRequest, Jsep, PluginBody, SignalingConfig,
    TrickleCandidate, WatchParams,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::WebRtcError;
use crate::events::{EventSender, SessionEvent};
use crate::peer::RemotePeer;
use crate::transaction::TransactionCorrelator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    SessionCreated,
    HandleAttached,
    Watching,
}

/// Remote ICE candidate received via trickle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: u16,
}

/// Unsolicited gateway messages the session has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JanusPush {
    RemoteOffer { sdp: String },
    RemoteCandidate(RemoteCandidate),
}

/// Decide whether an uncorrelated message needs a reaction.
pub fn classify_push(msg: JanusMessage) -> Option<JanusPush> {
    match msg.janus.as_str() {
        "trickle" => {
            let candidate = msg.candidate?;
            if candidate.is_completed() {
                debug!("Remote ICE gathering completed");
                return None;
            }
            Some(JanusPush::RemoteCandidate(RemoteCandidate {
                candidate: candidate.candidate?,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index.unwrap_or(0),
            }))
        }
        "event" => match msg.jsep {
            Some(jsep) if jsep.is_offer() => Some(JanusPush::RemoteOffer { sdp: jsep.sdp }),
            _ => {
                debug!(plugindata = ?msg.plugindata, "Janus event without offer");
                None
            }
        },
        other => {
            trace!(janus = other, "Ignoring Janus message");
            None
        }
    }
}

/// Route one inbound frame: replies go to their waiter, pushes are returned.
pub fn route_inbound(correlator: &TransactionCorrelator, text: &str) -> Option<JanusPush> {
    let msg: JanusMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Invalid message from gateway: {e}");
            return None;
        }
    };
    if let Some(transaction) = msg.transaction.as_deref()
        && correlator.resolve(transaction, msg.clone())
    {
        return None;
    }
    classify_push(msg)
}

/// Request side of a Janus session.
pub struct JanusSignaling {
    outbox: mpsc::UnboundedSender<JanusRequest>,
    correlator: Arc<TransactionCorrelator>,
    reply_timeout: Duration,
    session_id: Option<u64>,
    handle_id: Option<u64>,
    state: SignalingState,
}

impl JanusSignaling {
    pub fn new(
        outbox: mpsc::UnboundedSender<JanusRequest>,
        correlator: Arc<TransactionCorrelator>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            outbox,
            correlator,
            reply_timeout,
            session_id: None,
            handle_id: None,
            state: SignalingState::Connecting,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn handle_id(&self) -> Option<u64> {
        self.handle_id
    }

    pub fn correlator(&self) -> &Arc<TransactionCorrelator> {
        &self.correlator
    }

    fn send(&self, request: JanusRequest) -> Result<(), WebRtcError> {
        self.outbox
            .send(request)
            .map_err(|_| WebRtcError::SignalingConnectionLost)
    }

    /// Send a request and wait for the reply carrying its transaction.
    async fn request(&self, request: JanusRequest) -> Result<JanusMessage, WebRtcError> {
        let transaction = request.transaction().to_string();
        let pending = self.correlator.register(&transaction);
        if let Err(e) = self.send(request) {
            self.correlator.forget(&transaction);
            return Err(e);
        }
        let reply = match tokio::time::timeout(self.reply_timeout, pending).await {
            Ok(reply) => reply?,
            Err(_) => {
                self.correlator.forget(&transaction);
                warn!(transaction, "Janus reply timed out");
                return Err(WebRtcError::SignalingConnectionLost);
            }
        };
        if reply.is_error() {
            let body = reply.error.unwrap_or_default();
            return Err(WebRtcError::Janus {
                code: body.code,
                reason: body.reason,
            });
        }
        Ok(reply)
    }

    pub async fn create_session(&mut self) -> Result<u64, WebRtcError> {
        let reply = self
            .request(JanusRequest::Create {
                transaction: TransactionCorrelator::next_transaction_id(),
            })
            .await?;
        let session_id = reply.data_id().ok_or(WebRtcError::SignalingConnectionLost)?;
        self.session_id = Some(session_id);
        self.state = SignalingState::SessionCreated;
        info!(session_id, "Janus session created");
        Ok(session_id)
    }

    pub async fn attach(&mut self, plugin: &str) -> Result<u64, WebRtcError> {
        let session_id = self.session_id.ok_or(WebRtcError::SignalingConnectionLost)?;
        let reply = self
            .request(JanusRequest::Attach {
                plugin: plugin.to_string(),
                opaque_id: format!("oid-{}", Uuid::new_v4()),
                transaction: TransactionCorrelator::next_transaction_id(),
                session_id,
            })
            .await?;
        let handle_id = reply.data_id().ok_or(WebRtcError::SignalingConnectionLost)?;
        self.handle_id = Some(handle_id);
        self.state = SignalingState::HandleAttached;
        info!(session_id, handle_id, plugin, "Janus plugin attached");
        Ok(handle_id)
    }

    /// Ask the plugin to stream. The offer arrives later as an event.
    pub fn watch(&mut self, params: WatchParams) -> Result<(), WebRtcError> {
        let (session_id, handle_id) = self.ids().ok_or(WebRtcError::SignalingConnectionLost)?;
        self.send(JanusRequest::Message {
            body: PluginBody::Watch { params },
            jsep: None,
            transaction: TransactionCorrelator::next_transaction_id(),
            session_id,
            handle_id,
        })?;
        self.state = SignalingState::Watching;
        info!(?params, "Watch request sent");
        Ok(())
    }

    /// create → attach → watch.
    pub async fn negotiate(
        &mut self,
        plugin: &str,
        params: WatchParams,
    ) -> Result<(u64, u64), WebRtcError> {
        let session_id = self.create_session().await?;
        let handle_id = self.attach(plugin).await?;
        self.watch(params)?;
        Ok((session_id, handle_id))
    }

    /// Send our SDP answer together with the `start` request.
    pub fn send_answer(&self, sdp: String) -> Result<(), WebRtcError> {
        let Some((session_id, handle_id)) = self.ids() else {
            debug!("Dropping SDP answer: no Janus session/handle");
            return Ok(());
        };
        self.send(JanusRequest::Message {
            body: PluginBody::Start,
            jsep: Some(Jsep::answer(sdp)),
            transaction: TransactionCorrelator::next_transaction_id(),
            session_id,
            handle_id,
        })
    }

    pub fn trickle(&self, candidate: TrickleCandidate) -> Result<(), WebRtcError> {
        let Some((session_id, handle_id)) = self.ids() else {
            debug!("Dropping local ICE candidate: no Janus session/handle");
            return Ok(());
        };
        self.send(JanusRequest::Trickle {
            candidate,
            transaction: TransactionCorrelator::next_transaction_id(),
            session_id,
            handle_id,
        })
    }

    pub fn keepalive(&self) -> Result<(), WebRtcError> {
        let Some(session_id) = self.session_id else {
            return Ok(());
        };
        self.send(JanusRequest::Keepalive {
            session_id,
            transaction: TransactionCorrelator::next_transaction_id(),
        })
    }

    /// Fail outstanding waiters and forget the session. Safe to call twice.
    pub fn teardown(&mut self) -> usize {
        let failed = self.correlator.fail_all(WebRtcError::SignalingConnectionLost);
        self.session_id = None;
        self.handle_id = None;
        self.state = SignalingState::Disconnected;
        failed
    }

    fn ids(&self) -> Option<(u64, u64)> {
        Some((self.session_id?, self.handle_id?))
    }
}

/// React to a push on the live peer. Failures are logged, never fatal.
pub async fn handle_push<P: RemotePeer>(peer: &P, signaling: &JanusSignaling, push: JanusPush) {
    match push {
        JanusPush::RemoteOffer { sdp } => match peer.accept_offer(&sdp).await {
            Ok(answer) => match signaling.send_answer(answer) {
                Ok(()) => info!("SDP answer sent"),
                Err(e) => warn!("Failed to send SDP answer: {e}"),
            },
            Err(e) => warn!("Failed to handle remote offer: {e:#}"),
        },
        JanusPush::RemoteCandidate(candidate) => {
            if let Err(e) = peer.add_remote_candidate(&candidate).await {
                warn!("Failed to add remote ICE candidate: {e:#}");
            }
        }
    }
}

/// Where and how to open the signaling socket.
#[derive(Clone)]
pub struct SignalingTarget {
    pub url: String,
    pub origin: String,
    pub auth_token: Option<String>,
    pub allow_insecure_tls: bool,
    pub tls_cert: Option<String>,
}

impl SignalingTarget {
    pub fn from_config(device: &DeviceConfig, signaling: &SignalingConfig) -> Self {
        Self {
            url: device.signaling_url(),
            origin: device.origin(),
            auth_token: device.auth_token().map(str::to_string),
            allow_insecure_tls: signaling.allow_insecure_tls,
            tls_cert: signaling.tls_cert.clone(),
        }
    }
}

/// Map http(s) to ws(s) and default a missing scheme to `wss`.
pub fn normalize_signaling_url(raw: &str) -> Result<String, WebRtcError> {
    let invalid = || WebRtcError::InvalidSignalingUrl(raw.to_string());
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = match scheme.to_ascii_lowercase().as_str() {
                "http" | "ws" => "ws",
                "https" | "wss" => "wss",
                _ => return Err(invalid()),
            };
            (scheme, rest)
        }
        None => ("wss", trimmed),
    };

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.starts_with(':') {
        return Err(invalid());
    }
    Ok(format!("{scheme}://{rest}"))
}

/// Handshake request with the Janus subprotocol, Origin and auth cookie.
pub fn build_request(
    url: &str,
    origin: &str,
    auth_token: Option<&str>,
) -> Result<Request, WebRtcError> {
    let mut request = url
        .into_client_request()
        .map_err(|_| WebRtcError::InvalidSignalingUrl(url.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(JANUS_SUBPROTOCOL),
    );
    let origin = HeaderValue::from_str(origin)
        .map_err(|_| WebRtcError::InvalidSignalingUrl(origin.to_string()))?;
    headers.insert(ORIGIN, origin);
    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        let cookie = HeaderValue::from_str(&format!("auth_token={token}"))
            .map_err(|_| WebRtcError::InvalidSignalingUrl(url.to_string()))?;
        headers.insert(COOKIE, cookie);
    }
    Ok(request)
}

/// Accepts whatever certificate the device presents. KVM appliances ship
/// self-signed certificates with no stable name to pin against.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a TLS connector: system roots plus an optional pinned certificate,
/// or no verification at all when `allow_insecure` is set.
fn build_tls_connector(
    allow_insecure: bool,
    tls_cert_path: Option<&str>,
) -> anyhow::Result<tokio_tungstenite::Connector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    if allow_insecure {
        debug!("TLS certificate verification disabled for signaling");
        let tls_config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();
        return Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)));
    }

    let mut root_store = rustls::RootCertStore::empty();

    // Load system roots as baseline
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        debug!("Skipping unreadable platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned device certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read TLS cert from {cert_path}: {e}, falling back to system roots");
            }
        }
    }

    let tls_config = builder
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

/// Live WebSocket plus the task pumping it.
pub struct SignalingSocket {
    task: JoinHandle<()>,
}

impl SignalingSocket {
    /// Connect and start pumping. Returns the socket and the outbox that
    /// [`JanusSignaling`] writes requests into.
    pub async fn open(
        target: &SignalingTarget,
        correlator: Arc<TransactionCorrelator>,
        events: EventSender,
    ) -> Result<(Self, mpsc::UnboundedSender<JanusRequest>), WebRtcError> {
        let url = normalize_signaling_url(&target.url)?;
        let request = build_request(&url, &target.origin, target.auth_token.as_deref())?;
        let connector = build_tls_connector(target.allow_insecure_tls, target.tls_cert.as_deref())
            .map_err(|e| {
                warn!("Failed to build TLS connector: {e:#}");
                WebRtcError::SignalingConnectionLost
            })?;

        info!(url, "Connecting to Janus signaling");
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(1 << 20); // SDP offers are a few KB
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(ws_config),
            false,
            Some(connector),
        )
        .await
        .map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                WebRtcError::Unauthorized(response.status().as_u16())
            }
            other => {
                warn!("WebSocket connection failed: {other}");
                WebRtcError::SignalingConnectionLost
            }
        })?;
        info!("Connected to Janus signaling");

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(ws_stream, outbox_rx, correlator, events));
        Ok((Self { task }, outbox_tx))
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbox: mpsc::UnboundedReceiver<JanusRequest>,
    correlator: Arc<TransactionCorrelator>,
    events: EventSender,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&correlator, &events, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => dispatch(&correlator, &events, text),
                        Err(e) => warn!("Non-UTF-8 binary frame from gateway: {e}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("closed by gateway ({frame:?})");
                    }
                    None => break "stream ended".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    _ => {}
                }
            }
            request = outbox.recv() => {
                let Some(request) = request else {
                    // Owner dropped the session on purpose.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                };
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode Janus request: {e}");
                        continue;
                    }
                };
                trace!(%text, "Janus request");
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    break e.to_string();
                }
            }
        }
    };

    let failed = correlator.fail_all(WebRtcError::SignalingConnectionLost);
    warn!(failed, "Signaling connection lost: {reason}");
    events.send(SessionEvent::SignalingLost(reason));
}

fn dispatch(correlator: &TransactionCorrelator, events: &EventSender, text: &str) {
    if let Some(push) = route_inbound(correlator, text) {
        events.send(SessionEvent::Push(push));
    }
}
