//! Plugin host: serves one plugin's subtasks to a sentinel.
//!
//! The host binds a ROUTER socket for `Invoke` requests and keeps itself
//! registered with the sentinel from a separate liveness task (register,
//! then heartbeat; re-register whenever the sentinel no longer knows us).

use anyhow::{Context, Result};
use rawflow_collector::{CancellationToken, PluginDefinition, SubTaskRunner};
use rawflow_protocol::defaults::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_REQUEST_TIMEOUT_MS};
use rawflow_protocol::transport::{self, RoutedMessage};
use rawflow_protocol::{
    HeartbeatPayload, InvokeRequest, Message, OpCode, PluginRegistration, ProtocolError,
    UnregisterPayload, PLUGIN_PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Plugin host configuration (plain data)
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// Sentinel plugin endpoint to register with
    pub sentinel_addr: String,
    /// Where this host accepts invocations (`tcp://127.0.0.1:0` picks a port)
    pub bind_addr: String,
    /// Endpoint announced to the sentinel; defaults to the bound endpoint
    pub advertise_addr: Option<String>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl PluginHostConfig {
    pub fn new(sentinel_addr: impl Into<String>) -> Self {
        Self {
            sentinel_addr: sentinel_addr.into(),
            bind_addr: "tcp://127.0.0.1:0".to_string(),
            advertise_addr: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Handle for controlling a running host
pub struct PluginHostHandle {
    endpoint: String,
    shutdown: CancellationToken,
    join_handle: JoinHandle<Result<()>>,
}

impl PluginHostHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Request graceful shutdown: in-flight invocations are cancelled and
    /// answered, then the host unregisters.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.join_handle.await?
    }

    /// Stop serving without unregistering or answering, as a crashed
    /// process would.
    pub fn abort(self) {
        self.join_handle.abort();
    }
}

/// Bound plugin host
pub struct PluginHost {
    config: PluginHostConfig,
    plugin: Arc<PluginDefinition>,
    socket: RouterSocket,
    endpoint: String,
    runner: SubTaskRunner,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl PluginHost {
    /// Validate the plugin and bind the invocation socket.
    pub async fn bind(config: PluginHostConfig, plugin: PluginDefinition) -> Result<Self> {
        plugin
            .validate()
            .with_context(|| format!("Invalid plugin definition '{}'", plugin.name))?;

        let mut socket = RouterSocket::new();
        let bound = socket
            .bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind plugin host to {}", config.bind_addr))?
            .to_string();
        let endpoint = config.advertise_addr.clone().unwrap_or(bound);
        info!(plugin = %plugin.name, endpoint = %endpoint, "Plugin host bound");

        Ok(Self {
            config,
            plugin: Arc::new(plugin),
            socket,
            endpoint,
            runner: SubTaskRunner::new(),
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Registration payload announced to the sentinel.
    pub fn registration(&self) -> PluginRegistration {
        PluginRegistration {
            plugin_name: self.plugin.name.clone(),
            endpoint: self.endpoint.clone(),
            subtasks: self.plugin.descriptors(),
            protocol_version: PLUGIN_PROTOCOL_VERSION,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run on a background task.
    pub fn spawn(self) -> PluginHostHandle {
        let endpoint = self.endpoint.clone();
        let shutdown = self.shutdown.clone();
        let join_handle = tokio::spawn(self.run());
        PluginHostHandle {
            endpoint,
            shutdown,
            join_handle,
        }
    }

    /// Main event loop - consumes self (can only be called once)
    pub async fn run(mut self) -> Result<()> {
        let mut liveness = AbortOnDrop(tokio::spawn(Liveness::new(&self).run()));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ZmqMessage>();
        let mut invocations = JoinSet::new();

        info!(plugin = %self.plugin.name, "Plugin host serving");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(
                        "Shutdown signal received, waiting for {} active invocations...",
                        invocations.len()
                    );
                    break;
                }

                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = self.socket.send(reply).await {
                        error!("Failed to send CONCLUDE: {}", e);
                    }
                }

                Some(joined) = invocations.join_next() => {
                    if let Err(e) = joined {
                        warn!("Invocation task panicked: {}", e);
                    }
                }

                recv = self.socket.recv() => match recv {
                    Ok(multipart) => self.handle_frames(multipart, &reply_tx, &mut invocations).await,
                    Err(e) => {
                        error!("ZMQ recv error: {}", e);
                        break;
                    }
                },
            }
        }

        // Entry points observe the cancelled token; answer what they return.
        while let Some(joined) = invocations.join_next().await {
            if let Err(e) = joined {
                warn!("Invocation task panicked during shutdown: {}", e);
            }
        }
        drop(reply_tx);
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = self.socket.send(reply).await {
                error!("Failed to send CONCLUDE during shutdown: {}", e);
            }
        }

        if let Err(e) = (&mut liveness.0).await {
            warn!("Liveness task failed: {}", e);
        }
        info!(plugin = %self.plugin.name, "Plugin host stopped");
        Ok(())
    }

    async fn handle_frames(
        &mut self,
        multipart: ZmqMessage,
        replies: &mpsc::UnboundedSender<ZmqMessage>,
        invocations: &mut JoinSet<()>,
    ) {
        let routed = match RoutedMessage::parse(multipart) {
            Ok(routed) => routed,
            Err(e) => {
                warn!("Failed to unpack message: {}", e);
                return;
            }
        };
        let corr = routed.message.header.correlation_id;

        match routed.message.opcode() {
            OpCode::Invoke => {
                let request: InvokeRequest = match routed.message.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        self.reply_now(&routed, Message::error(corr, "MALFORMED_PAYLOAD", e.to_string()))
                            .await;
                        return;
                    }
                };
                let plugin = Arc::clone(&self.plugin);
                let runner = self.runner.clone();
                let cancel = self.shutdown.clone();
                let active = Arc::clone(&self.active);
                let replies = replies.clone();

                active.fetch_add(1, Ordering::SeqCst);
                invocations.spawn(async move {
                    let reply = invoke(&plugin, &runner, &cancel, corr, request).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    match reply.and_then(|msg| routed.reply(&msg)) {
                        // Closed only after the loop has drained
                        Ok(frames) => {
                            let _ = replies.send(frames);
                        }
                        Err(e) => error!("Failed to build CONCLUDE: {}", e),
                    }
                });
            }
            other => {
                warn!("Unhandled opcode: {:?}", other);
                self.reply_now(
                    &routed,
                    Message::error(
                        corr,
                        "UNSUPPORTED_OPCODE",
                        format!("{:?} is not accepted by plugin hosts", other),
                    ),
                )
                .await;
            }
        }
    }

    async fn reply_now(&mut self, routed: &RoutedMessage, reply: Result<Message, ProtocolError>) {
        let frames = match reply.and_then(|msg| routed.reply(&msg)) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Failed to build reply: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send(frames).await {
            error!("Failed to send reply: {}", e);
        }
    }
}

async fn invoke(
    plugin: &PluginDefinition,
    runner: &SubTaskRunner,
    cancel: &CancellationToken,
    corr: u64,
    request: InvokeRequest,
) -> Result<Message, ProtocolError> {
    let Some(meta) = plugin.subtask(&request.subtask) else {
        warn!(plugin = %plugin.name, subtask = %request.subtask, "Invoke for unknown subtask");
        return Message::error(
            corr,
            "UNKNOWN_SUBTASK",
            format!("Plugin '{}' has no subtask '{}'", plugin.name, request.subtask),
        );
    };
    let report = runner.run(&request.task, meta, cancel).await;
    debug!(
        subtask = %request.subtask,
        status = %report.status,
        duration_ms = report.duration_ms,
        "Invocation finished"
    );
    Message::json(OpCode::Conclude, corr, &report.outcome())
}

/// Aborted hosts must not keep heartbeating.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps the host registered: register, heartbeat, re-register on rejection,
/// unregister on shutdown.
struct Liveness {
    sentinel_addr: String,
    registration: PluginRegistration,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    correlation: AtomicU64,
}

impl Liveness {
    fn new(host: &PluginHost) -> Self {
        Self {
            sentinel_addr: host.config.sentinel_addr.clone(),
            registration: host.registration(),
            interval: host.config.heartbeat_interval,
            timeout: host.config.request_timeout,
            shutdown: host.shutdown.clone(),
            active: Arc::clone(&host.active),
            correlation: AtomicU64::new(1),
        }
    }

    async fn run(self) {
        let mut registered = false;
        loop {
            if !registered {
                registered = self.register().await;
            } else {
                match self.heartbeat().await {
                    Ok(()) => {}
                    Err(ProtocolError::Rejected { code, message }) => {
                        warn!("Heartbeat rejected [{}]: {}; registering again", code, message);
                        registered = self.register().await;
                    }
                    Err(e) => warn!("Failed to send heartbeat: {}", e),
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        if registered {
            if let Err(e) = self.unregister().await {
                warn!("Failed to unregister: {}", e);
            }
        }
    }

    async fn register(&self) -> bool {
        let result = self
            .send(OpCode::Register, &self.registration)
            .await;
        match result {
            Ok(()) => {
                info!(
                    plugin = %self.registration.plugin_name,
                    sentinel = %self.sentinel_addr,
                    "Registered with sentinel"
                );
                true
            }
            Err(e) => {
                warn!(sentinel = %self.sentinel_addr, "Registration failed: {}", e);
                false
            }
        }
    }

    async fn heartbeat(&self) -> Result<(), ProtocolError> {
        let payload = HeartbeatPayload {
            plugin_name: self.registration.plugin_name.clone(),
            endpoint: self.registration.endpoint.clone(),
            active_invocations: self.active.load(Ordering::SeqCst),
        };
        debug!("Sending heartbeat ({} active invocations)", payload.active_invocations);
        self.send(OpCode::Heartbeat, &payload).await
    }

    async fn unregister(&self) -> Result<(), ProtocolError> {
        let payload = UnregisterPayload {
            plugin_name: self.registration.plugin_name.clone(),
            endpoint: self.registration.endpoint.clone(),
        };
        self.send(OpCode::Unregister, &payload).await?;
        info!(plugin = %payload.plugin_name, "Unregistered from sentinel");
        Ok(())
    }

    async fn send<T: serde::Serialize>(&self, opcode: OpCode, payload: &T) -> Result<(), ProtocolError> {
        let corr = self.correlation.fetch_add(1, Ordering::Relaxed);
        let msg = Message::json(opcode, corr, payload)?;
        transport::request_expecting(&self.sentinel_addr, &msg, OpCode::Ack, self.timeout).await?;
        Ok(())
    }
}
