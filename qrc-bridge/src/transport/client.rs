//! QRC transport: JSON-RPC 2.0 client over a TLS WebSocket
//!
//! Owns the WebSocket and the pending-request table. The reader task does
//! nothing but decode frames and correlate responses; every other concern
//! (heartbeat, reconnect, shutdown) lives in its own task so the reader can
//! never be blocked behind slow consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::transport::protocol::{methods, RpcFrame, RpcRequest, MAX_SAFE_ID};
use crate::transport::QrcPort;

/// Downtime past which caches must be treated as stale on reconnect
const CACHE_INVALIDATION_DOWNTIME: Duration = Duration::from_secs(30);

/// Grace added to the heartbeat interval before a missing pong is fatal
const PONG_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle events emitted by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The session is up (WebSocket open and Logon accepted)
    Connected {
        /// Milliseconds since the previous session closed; 0 on first connect
        downtime_ms: u64,
        /// True when the outage was long enough that cached discovery and
        /// control state can no longer be trusted
        requires_cache_invalidation: bool,
    },
    /// The session closed
    Disconnected {
        /// Why it closed
        reason: String,
    },
    /// An unsolicited close is being handled and a reconnect is starting
    Reconnecting,
}

/// A server-initiated JSON-RPC notification (e.g. AutoPoll pushes)
#[derive(Debug, Clone)]
pub struct RpcNotification {
    /// Method name
    pub method: String,
    /// Notification parameters
    pub params: Value,
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// JSON-RPC client for one Q-SYS Core
pub struct QrcClient {
    config: TransportConfig,
    manager: Arc<ConnectionManager>,
    pending: DashMap<u64, PendingCall>,
    pending_order: StdMutex<VecDeque<u64>>,
    next_id: AtomicU64,
    writer: Mutex<Option<mpsc::Sender<Message>>>,
    connected: AtomicBool,
    shutting_down: AtomicBool,
    disconnect_in_progress: AtomicBool,
    disconnected_at: StdMutex<Option<Instant>>,
    last_pong: StdMutex<Instant>,
    tasks: StdMutex<Option<CancellationToken>>,
    signal_task: StdMutex<Option<CancellationToken>>,
    signals_installed: AtomicBool,
    events: EventHub<TransportEvent>,
    notifications: EventHub<RpcNotification>,
}

impl QrcClient {
    /// Client for the configured Core; does not connect yet
    pub fn new(config: TransportConfig, manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            pending: DashMap::new(),
            pending_order: StdMutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            disconnect_in_progress: AtomicBool::new(false),
            disconnected_at: StdMutex::new(None),
            last_pong: StdMutex::new(Instant::now()),
            tasks: StdMutex::new(None),
            signal_task: StdMutex::new(None),
            signals_installed: AtomicBool::new(false),
            events: EventHub::new(),
            notifications: EventHub::new(),
        })
    }

    /// The transport configuration this client was built with
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Subscribe to server-initiated notifications
    pub fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<RpcNotification> {
        self.notifications.subscribe()
    }

    /// Open the session, retrying per the connection manager's policy.
    ///
    /// Idempotent: returns immediately when already connected. Resolves only
    /// after the WebSocket is open and `Logon` was accepted. Authentication
    /// failures are not retried.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shutting_down.store(false, Ordering::SeqCst);

        let client = Arc::clone(self);
        self.manager
            .connect_with_retry(move || {
                let client = Arc::clone(&client);
                client.connect_once()
            })
            .await
    }

    /// One connection attempt: open, logon, start tasks, emit `Connected`
    fn connect_once(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'static>> {
        Box::pin(async move { self.connect_once_inner().await })
    }

    async fn connect_once_inner(self: &Arc<Self>) -> Result<()> {
        let url = self.config.endpoint_url();
        tracing::info!("Connecting to Q-SYS Core at {}", url);

        let connector = if self.config.insecure_tls {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::ConnectionFailed(format!("TLS setup failed: {}", e)))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let connect = connect_async_tls_with_config(url.as_str(), None, true, connector);
        let (ws, _response) = tokio::time::timeout(self.config.connection_timeout(), connect)
            .await
            .map_err(|_| Error::Timeout(self.config.connection_timeout()))?
            .map_err(|e| Error::ConnectionFailed(format!("WebSocket open failed: {}", e)))?;

        let (mut sink, mut stream) = ws.split();

        let cancel = CancellationToken::new();
        {
            let mut slot = self.tasks.lock().expect("task token lock poisoned");
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }

        // Writer: drains the outbound queue onto the socket
        let (tx, mut rx) = mpsc::channel::<Message>(64);
        *self.writer.lock().await = Some(tx.clone());
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = rx.recv() => match msg {
                            Some(msg) => {
                                if let Err(e) = sink.send(msg).await {
                                    tracing::warn!("WebSocket write failed: {}", e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                let _ = sink.close().await;
            });
        }

        // Reader: decode frames and correlate responses, nothing else
        {
            let client = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => client.handle_frame(text.as_str()),
                            Some(Ok(Message::Pong(_))) => {
                                *client.last_pong.lock().expect("pong lock poisoned") =
                                    Instant::now();
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let writer = client.writer.lock().await.clone();
                                if let Some(writer) = writer {
                                    let _ = writer.send(Message::Pong(data)).await;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket read failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                client.handle_connection_loss("connection closed by peer").await;
            });
        }

        // Heartbeat: WebSocket ping plus QRC NoOp keepalive
        if self.config.enable_heartbeat {
            let client = Arc::clone(self);
            let writer = tx;
            let cancel = cancel.clone();
            let interval = self.config.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    let since_pong = client
                        .last_pong
                        .lock()
                        .expect("pong lock poisoned")
                        .elapsed();
                    if since_pong > interval + PONG_GRACE {
                        tracing::warn!(
                            "Heartbeat missed: no pong for {:?}; terminating connection",
                            since_pong
                        );
                        client.handle_connection_loss("heartbeat timeout").await;
                        return;
                    }
                    if writer.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                    if let Ok(noop) =
                        RpcRequest::notification(methods::NO_OP, serde_json::json!({})).encode()
                    {
                        let _ = writer.send(Message::Text(noop.into())).await;
                    }
                }
            });
        }

        *self.last_pong.lock().expect("pong lock poisoned") = Instant::now();
        self.connected.store(true, Ordering::SeqCst);

        // Logon before the connect resolves; a rejection is fatal
        if let Err(err) = self.logon().await {
            tracing::error!("Logon rejected by Core: {}", err);
            self.teardown_session().await;
            return Err(err);
        }

        let downtime_ms = self
            .disconnected_at
            .lock()
            .expect("downtime lock poisoned")
            .take()
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let requires_cache_invalidation =
            downtime_ms > CACHE_INVALIDATION_DOWNTIME.as_millis() as u64;

        tracing::info!(
            downtime_ms,
            requires_cache_invalidation,
            "Connected to Q-SYS Core"
        );
        self.events.emit(TransportEvent::Connected {
            downtime_ms,
            requires_cache_invalidation,
        });

        Ok(())
    }

    async fn logon(&self) -> Result<()> {
        let params = serde_json::json!({
            "User": self.config.username,
            "Password": self.config.password,
        });
        match self
            .send_command_with_timeout(methods::LOGON, params, self.config.connection_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { message, .. }) => {
                Err(Error::AuthenticationFailed(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Close the session deliberately.
    ///
    /// Idempotent and guarded: overlapping or repeated calls after the
    /// session is down return without another round of cleanup or logging.
    /// The guard resets afterwards so a later `connect` works.
    pub async fn disconnect(&self) {
        if self.disconnect_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) && !self.connected.load(Ordering::SeqCst) {
            // Already fully disconnected
            self.disconnect_in_progress.store(false, Ordering::SeqCst);
            return;
        }
        self.shutting_down.store(true, Ordering::SeqCst);

        tracing::info!("Disconnecting from Q-SYS Core");
        self.manager.disconnect();

        if let Some(token) = self
            .signal_task
            .lock()
            .expect("signal token lock poisoned")
            .take()
        {
            token.cancel();
        }
        self.signals_installed.store(false, Ordering::SeqCst);

        {
            let mut writer = self.writer.lock().await;
            if let Some(tx) = writer.take() {
                let _ = tx.send(Message::Close(None)).await;
            }
        }
        if let Some(token) = self.tasks.lock().expect("task token lock poisoned").take() {
            token.cancel();
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            *self.disconnected_at.lock().expect("downtime lock poisoned") = Some(Instant::now());
        }
        self.fail_all_pending("connection closed by disconnect");

        self.events.emit(TransportEvent::Disconnected {
            reason: "disconnect requested".to_string(),
        });
        tracing::info!("Disconnected");

        self.disconnect_in_progress.store(false, Ordering::SeqCst);
    }

    /// Tear down a half-built session (logon failure) without the
    /// disconnect bookkeeping
    async fn teardown_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(token) = self.tasks.lock().expect("task token lock poisoned").take() {
            token.cancel();
        }
        *self.writer.lock().await = None;
        self.fail_all_pending("session torn down");
    }

    /// Unsolicited close: stamp downtime, reject pending calls, reconnect
    async fn handle_connection_loss(self: &Arc<Self>, reason: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::warn!("Connection to Core lost: {}", reason);
        {
            let mut at = self.disconnected_at.lock().expect("downtime lock poisoned");
            if at.is_none() {
                *at = Some(Instant::now());
            }
        }
        if let Some(token) = self.tasks.lock().expect("task token lock poisoned").take() {
            token.cancel();
        }
        *self.writer.lock().await = None;
        self.fail_all_pending(reason);
        self.manager.note_disconnected();
        self.events.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });

        if self.config.enable_auto_reconnect {
            self.events.emit(TransportEvent::Reconnecting);
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = client.connect().await {
                    tracing::error!("Reconnect failed: {}", e);
                }
            });
        }
    }

    /// Install SIGTERM/SIGINT handlers that disconnect cleanly.
    ///
    /// Installed at most once per transport; repeat calls are no-ops until
    /// `disconnect` removes the handlers.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = Arc::clone(self);
        let cancel = CancellationToken::new();
        *self
            .signal_task
            .lock()
            .expect("signal token lock poisoned") = Some(cancel.clone());

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("Failed to install SIGTERM handler: {}", e);
                        return;
                    }
                };
                let mut int = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("Failed to install SIGINT handler: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = term.recv() => tracing::info!("SIGTERM received; disconnecting"),
                    _ = int.recv() => tracing::info!("SIGINT received; disconnecting"),
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupt received; disconnecting");
                    }
                }
            }
            client.disconnect().await;
        });
    }

    /// Allocate a correlation id: monotonic, never 0, wraps before
    /// `2^53 − 1`, and never collides with a still-pending id.
    fn allocate_id(&self) -> u64 {
        loop {
            let current = self.next_id.load(Ordering::Relaxed);
            let next = if current >= MAX_SAFE_ID { 1 } else { current + 1 };
            if self
                .next_id
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if !self.pending.contains_key(&current) {
                    return current;
                }
            }
        }
    }

    /// Route one inbound text frame
    fn handle_frame(&self, text: &str) {
        let frame = match RpcFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Discarding undecodable frame: {}", e);
                return;
            }
        };

        if frame.is_response() {
            let id = match frame.id_u64() {
                Some(id) => {
                    self.pending_order
                        .lock()
                        .expect("pending order lock poisoned")
                        .retain(|pending| *pending != id);
                    Some(id)
                }
                // Protocol quirk: some firmware responds with a null or
                // missing id. Match it to the oldest still-pending request.
                None => {
                    let mut order = self
                        .pending_order
                        .lock()
                        .expect("pending order lock poisoned");
                    loop {
                        match order.pop_front() {
                            Some(candidate) if self.pending.contains_key(&candidate) => {
                                break Some(candidate)
                            }
                            Some(_) => continue,
                            None => break None,
                        }
                    }
                }
            };

            let Some(id) = id else {
                tracing::debug!("Response frame with no matching pending request");
                return;
            };
            let Some((_, call)) = self.pending.remove(&id) else {
                tracing::debug!(id, "Response for unknown request id");
                return;
            };

            let outcome = match frame.error {
                Some(err) => Err(Error::CommandFailed {
                    method: call.method,
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let _ = call.tx.send(outcome);
        } else if let Some(method) = frame.method {
            self.notifications.emit(RpcNotification {
                method,
                params: frame.params.unwrap_or(Value::Null),
            });
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.tx.send(Err(Error::ConnectionClosed(reason.to_string())));
            }
        }
        self.pending_order
            .lock()
            .expect("pending order lock poisoned")
            .clear();
    }

    async fn dispatch(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("not connected".to_string()));
        }

        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        self.pending_order
            .lock()
            .expect("pending order lock poisoned")
            .push_back(id);

        let frame = match RpcRequest::call(method, params, id).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.forget_pending(id);
                return Err(e);
            }
        };

        let writer = self.writer.lock().await.clone();
        let Some(writer) = writer else {
            self.forget_pending(id);
            return Err(Error::ConnectionClosed("writer is gone".to_string()));
        };
        if writer.send(Message::Text(frame.into())).await.is_err() {
            self.forget_pending(id);
            return Err(Error::ConnectionClosed("writer is gone".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed(
                "connection closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.forget_pending(id);
                tracing::warn!(method, id, "Command timed out after {:?}", timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    fn forget_pending(&self, id: u64) {
        self.pending.remove(&id);
        self.pending_order
            .lock()
            .expect("pending order lock poisoned")
            .retain(|pending| *pending != id);
    }
}

#[async_trait::async_trait]
impl QrcPort for QrcClient {
    async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        self.dispatch(method, params, self.config.command_timeout())
            .await
    }

    async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.dispatch(method, params, timeout).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::BreakerConfig;
    use crate::connection::RetryPolicy;

    fn client() -> Arc<QrcClient> {
        let config = TransportConfig::default();
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let manager = ConnectionManager::new(RetryPolicy::from(&config), breaker);
        QrcClient::new(config, manager)
    }

    fn stash_pending(client: &QrcClient, id: u64, method: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        client.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        client
            .pending_order
            .lock()
            .unwrap()
            .push_back(id);
        rx
    }

    #[tokio::test]
    async fn test_send_command_without_connection_fails() {
        let client = client();
        let result = client
            .send_command(methods::STATUS_GET, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_allocate_id_is_monotonic_and_nonzero() {
        let client = client();
        let a = client.allocate_id();
        let b = client.allocate_id();
        assert!(a >= 1);
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn test_allocate_id_wraps_before_max_safe_integer() {
        let client = client();
        client.next_id.store(MAX_SAFE_ID, Ordering::Relaxed);
        let at_limit = client.allocate_id();
        assert_eq!(at_limit, MAX_SAFE_ID);
        let wrapped = client.allocate_id();
        assert_eq!(wrapped, 1);
    }

    #[tokio::test]
    async fn test_allocate_id_skips_pending_ids() {
        let client = client();
        client.next_id.store(MAX_SAFE_ID, Ordering::Relaxed);
        let _rx = stash_pending(&client, 1, "NoOp");
        let _at_limit = client.allocate_id();
        // Wrap lands on 1, which is pending, so 2 must come out.
        let wrapped = client.allocate_id();
        assert_eq!(wrapped, 2);
    }

    #[tokio::test]
    async fn test_response_with_id_resolves_matching_pending() {
        let client = client();
        let rx5 = stash_pending(&client, 5, "Status.Get");
        let _rx6 = stash_pending(&client, 6, "NoOp");

        client.handle_frame(r#"{"jsonrpc":"2.0","id":5,"result":{"Platform":"Core 110f"}}"#);

        let outcome = rx5.await.unwrap().unwrap();
        assert_eq!(outcome["Platform"], "Core 110f");
        assert!(client.pending.contains_key(&6));
    }

    #[tokio::test]
    async fn test_null_id_response_matches_oldest_pending() {
        let client = client();
        let rx_old = stash_pending(&client, 10, "Control.Get");
        let rx_new = stash_pending(&client, 11, "Control.Get");

        client.handle_frame(r#"{"jsonrpc":"2.0","id":null,"result":true}"#);

        assert_eq!(rx_old.await.unwrap().unwrap(), Value::Bool(true));
        // The newer request is still pending.
        assert!(client.pending.contains_key(&11));

        client.handle_frame(r#"{"jsonrpc":"2.0","result":false}"#);
        assert_eq!(rx_new.await.unwrap().unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_error_frame_maps_to_command_failed() {
        let client = client();
        let rx = stash_pending(&client, 3, "Component.Get");

        client.handle_frame(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":8,"message":"Unknown component"}}"#,
        );

        match rx.await.unwrap() {
            Err(Error::CommandFailed {
                method,
                code,
                message,
            }) => {
                assert_eq!(method, "Component.Get");
                assert_eq!(code, 8);
                assert_eq!(message, "Unknown component");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_frames_are_broadcast() {
        let client = client();
        let mut rx = client.subscribe_notifications();

        client.handle_frame(
            r#"{"jsonrpc":"2.0","method":"ChangeGroup.Poll","params":{"Id":"g1","Changes":[]}}"#,
        );

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.method, "ChangeGroup.Poll");
        assert_eq!(notification.params["Id"], "g1");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = client();
        let mut rx = client.subscribe();

        client.disconnect().await;
        client.disconnect().await;
        client.disconnect().await;

        // Exactly one lifecycle transition.
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::Disconnected { .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_requests() {
        let client = client();
        client.connected.store(true, Ordering::SeqCst);
        let rx = stash_pending(&client, 9, "Control.Get");

        client.disconnect().await;

        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionClosed(_))));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_signal_handler_installation_is_idempotent() {
        let client = client();
        client.install_signal_handlers();
        client.install_signal_handlers();
        assert!(client.signals_installed.load(Ordering::SeqCst));
        // Cleanup so the spawned task does not outlive the test runtime.
        client.disconnect().await;
    }
}
