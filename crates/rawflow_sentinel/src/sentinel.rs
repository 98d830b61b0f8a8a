//! Sentinel event loop.
//!
//! Two ROUTER sockets:
//! - control: JSON [`ControlRequest`]s from operators and schedulers. Each
//!   request runs on its own task so a long collection never blocks the
//!   loop; replies come back over a channel.
//! - plugin (remote plugins enabled only): framed `Register` / `Heartbeat` /
//!   `Unregister` messages, answered inline.
//!
//! The migration gate is checked before anything else on both sockets.

use anyhow::{Context, Result};
use rawflow_collector::{CancellationToken, PluginDefinition, SubTaskReport, SubTaskRunner};
use rawflow_db::RawflowDb;
use rawflow_protocol::transport::{self, RoutedMessage};
use rawflow_protocol::{
    AckPayload, HeartbeatPayload, Message, OpCode, PluginRegistration, ProtocolError,
    SubTaskStatus, TaskInfo, UnregisterPayload,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqError, ZmqMessage};

use crate::bridge::{spawn_bootstrap, Bridge, Dispatch, PluginTarget, Registration};
use crate::config::SentinelConfig;
use crate::control::{ControlRequest, ControlResponse};
use crate::gate::MigrationGate;
use crate::metrics::METRICS;

/// Shortest interval between stale-plugin sweeps.
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a request handler needs; shared by all in-flight requests.
struct SentinelState {
    gate: Arc<MigrationGate>,
    bridge: Arc<Bridge>,
    db: RawflowDb,
    runner: SubTaskRunner,
    shutdown: CancellationToken,
}

/// Main sentinel control plane
pub struct Sentinel {
    config: SentinelConfig,
    control_socket: RouterSocket,
    plugin_socket: Option<RouterSocket>,
    control_endpoint: String,
    plugin_endpoint: Option<String>,
    state: Arc<SentinelState>,
}

impl Sentinel {
    /// Open storage, initialize the gate and bind sockets.
    ///
    /// `local_plugins` run in-process; their names are reserved against
    /// remote registrations.
    pub async fn bind(config: SentinelConfig, local_plugins: Vec<PluginDefinition>) -> Result<Self> {
        let db = RawflowDb::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

        let gate = MigrationGate::initialize(Arc::new(db.clone()), config.force_migration)
            .await
            .context("Failed to initialize migration gate")?;

        let bridge =
            Bridge::new(local_plugins, config.invoke_timeout).context("Invalid local plugins")?;

        let mut control_socket = RouterSocket::new();
        let control_endpoint = control_socket
            .bind(&config.control_addr)
            .await
            .with_context(|| format!("Failed to bind control socket to {}", config.control_addr))?
            .to_string();
        info!("Control API bound to {}", control_endpoint);

        let (plugin_socket, plugin_endpoint) = if config.enable_remote_plugins {
            let mut socket = RouterSocket::new();
            let endpoint = socket
                .bind(&config.plugin_addr)
                .await
                .with_context(|| format!("Failed to bind plugin socket to {}", config.plugin_addr))?
                .to_string();
            info!("Plugin endpoint bound to {}", endpoint);
            (Some(socket), Some(endpoint))
        } else {
            info!("Remote plugins disabled");
            (None, None)
        };

        Ok(Self {
            config,
            control_socket,
            plugin_socket,
            control_endpoint,
            plugin_endpoint,
            state: Arc::new(SentinelState {
                gate: Arc::new(gate),
                bridge: Arc::new(bridge),
                db,
                runner: SubTaskRunner::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Resolved control endpoint (port 0 is replaced by the bound port).
    pub fn control_endpoint(&self) -> &str {
        &self.control_endpoint
    }

    pub fn plugin_endpoint(&self) -> Option<&str> {
        self.plugin_endpoint.as_deref()
    }

    pub fn gate(&self) -> Arc<MigrationGate> {
        Arc::clone(&self.state.gate)
    }

    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.state.bridge)
    }

    /// Cancelling this token stops the loop and every in-flight run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Main event loop
    pub async fn run(mut self) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ZmqMessage>();
        self.start_bootstrap();

        let reap_every = (self.config.heartbeat_timeout / 3).max(MIN_REAP_INTERVAL);
        let mut reap = tokio::time::interval(reap_every);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Sentinel event loop started");

        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    info!("Sentinel received stop signal");
                    break;
                }
                recv = self.control_socket.recv() => match recv {
                    Ok(multipart) => self.spawn_control_request(multipart, reply_tx.clone()),
                    Err(e) => error!("Control socket recv error: {}", e),
                },
                recv = recv_optional(&mut self.plugin_socket) => match recv {
                    Ok(multipart) => {
                        if let Err(e) = self.handle_plugin_frames(multipart).await {
                            error!("Error handling plugin message: {}", e);
                        }
                    }
                    Err(e) => error!("Plugin socket recv error: {}", e),
                },
                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = self.control_socket.send(reply).await {
                        error!("Failed to send control response: {}", e);
                    }
                }
                _ = reap.tick() => {
                    if self.plugin_socket.is_some() {
                        let reaped = self.state.bridge.reap_stale(self.config.heartbeat_timeout).await;
                        if reaped.is_empty() {
                            debug!("Reap: no stale plugins");
                        }
                    }
                }
            }
        }

        self.state.shutdown.cancel();
        info!("Sentinel stopped");
        Ok(())
    }

    fn start_bootstrap(&self) {
        if !self.config.enable_remote_plugins || self.config.plugin_launchers.is_empty() {
            return;
        }
        match self.plugin_endpoint.as_deref().and_then(transport::endpoint_port) {
            Some(port) => {
                info!(
                    launchers = self.config.plugin_launchers.len(),
                    port, "Bootstrapping plugin launchers"
                );
                spawn_bootstrap(
                    self.config.plugin_launchers.clone(),
                    port,
                    self.config.request_timeout,
                );
            }
            None => warn!(
                "Plugin endpoint {:?} has no TCP port; launchers not bootstrapped",
                self.plugin_endpoint
            ),
        }
    }

    fn spawn_control_request(
        &self,
        multipart: ZmqMessage,
        replies: mpsc::UnboundedSender<ZmqMessage>,
    ) {
        // [routing..., body]: identity (and an empty delimiter for REQ peers)
        let mut routing = multipart.into_vec();
        let Some(body) = routing.pop() else {
            METRICS.inc_protocol_errors();
            return;
        };
        METRICS.inc_control_requests();

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let response = state.handle_control_bytes(&body).await;
            let encoded = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to serialize control response: {}", e);
                    return;
                }
            };
            let mut reply = ZmqMessage::from(encoded);
            for frame in routing.into_iter().rev() {
                reply.push_front(frame);
            }
            // Closed only when the loop has stopped
            let _ = replies.send(reply);
        });
    }

    async fn handle_plugin_frames(&mut self, multipart: ZmqMessage) -> Result<()> {
        let routed = match RoutedMessage::parse(multipart) {
            Ok(routed) => routed,
            Err(e) => {
                METRICS.inc_protocol_errors();
                warn!("Dropping malformed plugin message: {}", e);
                return Ok(());
            }
        };

        let reply = self.state.handle_plugin_message(&routed.message).await?;
        let frames = routed.reply(&reply)?;
        if let Some(socket) = self.plugin_socket.as_mut() {
            socket
                .send(frames)
                .await
                .context("Failed to send plugin reply")?;
        }
        Ok(())
    }
}

async fn recv_optional(socket: &mut Option<RouterSocket>) -> Result<ZmqMessage, ZmqError> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

impl SentinelState {
    // ========================================================================
    // Plugin endpoint
    // ========================================================================

    async fn handle_plugin_message(&self, msg: &Message) -> Result<Message, ProtocolError> {
        let corr = msg.header.correlation_id;

        if let Err(rejection) = self.gate.check().await {
            METRICS.inc_gate_rejections();
            return Message::error(corr, rejection.code(), rejection.to_string());
        }

        match msg.opcode() {
            OpCode::Register => {
                let reg: PluginRegistration = match msg.decode() {
                    Ok(reg) => reg,
                    Err(e) => return malformed(corr, e),
                };
                match self.bridge.register(reg).await {
                    Ok(Registration::New) => ack(corr, "registered"),
                    Ok(Registration::Replaced { .. }) => ack(corr, "replaced"),
                    Err(err) => Message::error(corr, err.code(), err.to_string()),
                }
            }

            OpCode::Heartbeat => {
                let beat: HeartbeatPayload = match msg.decode() {
                    Ok(beat) => beat,
                    Err(e) => return malformed(corr, e),
                };
                if self.bridge.heartbeat(&beat.plugin_name, &beat.endpoint).await {
                    ack(corr, "alive")
                } else {
                    // Reaped or replaced; the plugin re-registers on this reply
                    debug!(
                        plugin = %beat.plugin_name,
                        endpoint = %beat.endpoint,
                        "Heartbeat from unregistered plugin"
                    );
                    Message::error(
                        corr,
                        "UNKNOWN_PLUGIN",
                        format!(
                            "Plugin '{}' is not registered at {}",
                            beat.plugin_name, beat.endpoint
                        ),
                    )
                }
            }

            OpCode::Unregister => {
                let payload: UnregisterPayload = match msg.decode() {
                    Ok(payload) => payload,
                    Err(e) => return malformed(corr, e),
                };
                self.bridge
                    .unregister(&payload.plugin_name, &payload.endpoint)
                    .await;
                ack(corr, "unregistered")
            }

            other => {
                METRICS.inc_protocol_errors();
                warn!("Unhandled opcode on plugin endpoint: {:?}", other);
                Message::error(
                    corr,
                    "UNSUPPORTED_OPCODE",
                    format!("{:?} is not accepted on the plugin endpoint", other),
                )
            }
        }
    }

    // ========================================================================
    // Control API
    // ========================================================================

    async fn handle_control_bytes(&self, body: &[u8]) -> ControlResponse {
        // The gate comes before parsing: only a well-formed confirmation passes.
        let parsed = serde_json::from_slice::<ControlRequest>(body);
        if !matches!(&parsed, Ok(request) if request.bypasses_gate()) {
            if let Err(rejection) = self.gate.check().await {
                METRICS.inc_gate_rejections();
                let name = parsed.as_ref().map_or("<unparsed>", ControlRequest::name);
                debug!(request = name, "Rejected by migration gate");
                return ControlResponse::gate_rejection(&rejection);
            }
        }

        match parsed {
            Ok(request) => self.handle_control_request(request).await,
            Err(e) => {
                METRICS.inc_protocol_errors();
                ControlResponse::error("PARSE_ERROR", format!("Invalid request: {}", e))
            }
        }
    }

    /// Handle a single control request
    async fn handle_control_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::Pong,
            ControlRequest::ConfirmMigration => match self.gate.confirm().await {
                Ok(applied) => ControlResponse::MigrationConfirmed { applied },
                Err(err) => ControlResponse::error(err.code(), err.to_string()),
            },
            ControlRequest::GetMigrationStatus => {
                ControlResponse::MigrationStatus(self.gate.status().await)
            }
            ControlRequest::ListPlugins => ControlResponse::Plugins(self.bridge.plugins().await),
            ControlRequest::RunSubTask {
                plugin,
                subtask,
                task,
            } => self.run_subtask(&plugin, &subtask, scoped(task, &plugin)).await,
            ControlRequest::RunPlugin { plugin, task } => {
                self.run_plugin(&plugin, scoped(task, &plugin)).await
            }
            ControlRequest::GetCheckpoint { params_key } => {
                match self.db.checkpoint_load(&params_key).await {
                    Ok(state) => ControlResponse::Checkpoint(state),
                    Err(e) => ControlResponse::error("STORAGE_ERROR", e.to_string()),
                }
            }
            ControlRequest::ListCheckpoints {
                plugin_name,
                connection_id,
            } => match self.db.checkpoint_list(&plugin_name, &connection_id).await {
                Ok(states) => ControlResponse::Checkpoints(states),
                Err(e) => ControlResponse::error("STORAGE_ERROR", e.to_string()),
            },
            ControlRequest::GetMetrics => ControlResponse::Metrics {
                prometheus: format!(
                    "{}\n{}",
                    METRICS.prometheus_format(),
                    rawflow_collector::metrics::METRICS.prometheus_format()
                ),
            },
        }
    }

    async fn run_subtask(&self, plugin: &str, subtask: &str, task: TaskInfo) -> ControlResponse {
        let report = match self.bridge.resolve(plugin, subtask).await {
            Ok(Dispatch::Local(meta)) => self.runner.run(&task, &meta, &self.shutdown).await,
            Ok(Dispatch::Remote(handle)) => {
                self.bridge.invoker().invoke_report(&handle, &task).await
            }
            Err(err) => return ControlResponse::error(err.code(), err.to_string()),
        };
        log_report(&report);
        ControlResponse::SubTaskResult(report)
    }

    async fn run_plugin(&self, plugin: &str, task: TaskInfo) -> ControlResponse {
        let reports = match self.bridge.resolve_plugin(plugin).await {
            Ok(PluginTarget::Local(definition)) => {
                definition.run_all(&self.runner, &task, &self.shutdown).await
            }
            Ok(PluginTarget::Remote(handles)) => {
                let mut reports = Vec::with_capacity(handles.len());
                for handle in handles {
                    let report = self.bridge.invoker().invoke_report(&handle, &task).await;
                    let failed = report.status == SubTaskStatus::Failed;
                    reports.push(report);
                    if failed {
                        break;
                    }
                }
                reports
            }
            Err(err) => return ControlResponse::error(err.code(), err.to_string()),
        };
        reports.iter().for_each(log_report);
        ControlResponse::PluginRunResult(reports)
    }
}

/// The task always belongs to the plugin it is dispatched to.
fn scoped(mut task: TaskInfo, plugin: &str) -> TaskInfo {
    if task.plugin_name != plugin {
        task.plugin_name = plugin.to_string();
    }
    task
}

fn log_report(report: &SubTaskReport) {
    match &report.error {
        Some(failure) => warn!(
            task_id = %report.task_id,
            plugin = %report.plugin_name,
            subtask = %report.subtask,
            kind = %failure.kind,
            retryable = failure.kind.is_retryable(),
            "Subtask run failed: {}",
            failure.message
        ),
        None => info!(
            task_id = %report.task_id,
            plugin = %report.plugin_name,
            subtask = %report.subtask,
            status = %report.status,
            duration_ms = report.duration_ms,
            "Subtask run finished"
        ),
    }
}

fn ack(corr: u64, message: &str) -> Result<Message, ProtocolError> {
    Message::json(OpCode::Ack, corr, &AckPayload::with_message(message))
}

fn malformed(corr: u64, err: ProtocolError) -> Result<Message, ProtocolError> {
    METRICS.inc_protocol_errors();
    warn!("Malformed plugin payload: {}", err);
    Message::error(corr, "MALFORMED_PAYLOAD", err.to_string())
}
