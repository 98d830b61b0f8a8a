//! Plugin launcher: starts plugin hosts when a sentinel bootstraps it.
//!
//! A sentinel sends `Bootstrap` with the port of its plugin endpoint. The
//! launcher (re)starts one host per plugin pointed at that sentinel and
//! acknowledges; the hosts then register on their own.

use anyhow::{Context, Result};
use rawflow_collector::{CancellationToken, PluginDefinition};
use rawflow_protocol::defaults::DEFAULT_LAUNCHER_HOST;
use rawflow_protocol::transport::RoutedMessage;
use rawflow_protocol::{AckPayload, BootstrapRequest, Message, OpCode, PLUGIN_PROTOCOL_VERSION};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend};

use crate::host::{PluginHost, PluginHostConfig, PluginHostHandle};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Where bootstrap requests arrive
    pub bind_addr: String,
    /// Host the sentinel's plugin endpoint is reachable on
    pub sentinel_host: String,
    /// Template for launched hosts; `sentinel_addr` is filled per bootstrap
    pub host: PluginHostConfig,
}

impl LauncherConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            sentinel_host: DEFAULT_LAUNCHER_HOST.to_string(),
            host: PluginHostConfig::new(String::new()),
        }
    }
}

pub struct LauncherHandle {
    endpoint: String,
    shutdown: CancellationToken,
    join_handle: JoinHandle<Result<()>>,
}

impl LauncherHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop the launcher and every host it started.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.join_handle.await?
    }
}

pub struct PluginLauncher {
    config: LauncherConfig,
    plugins: Vec<PluginDefinition>,
    socket: RouterSocket,
    endpoint: String,
    hosts: Vec<PluginHostHandle>,
    shutdown: CancellationToken,
}

impl PluginLauncher {
    pub async fn bind(config: LauncherConfig, plugins: Vec<PluginDefinition>) -> Result<Self> {
        for plugin in &plugins {
            plugin
                .validate()
                .with_context(|| format!("Invalid plugin definition '{}'", plugin.name))?;
        }

        let mut socket = RouterSocket::new();
        let endpoint = socket
            .bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind launcher to {}", config.bind_addr))?
            .to_string();
        info!(endpoint = %endpoint, plugins = plugins.len(), "Plugin launcher bound");

        Ok(Self {
            config,
            plugins,
            socket,
            endpoint,
            hosts: Vec::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn spawn(self) -> LauncherHandle {
        let endpoint = self.endpoint.clone();
        let shutdown = self.shutdown.clone();
        let join_handle = tokio::spawn(self.run());
        LauncherHandle {
            endpoint,
            shutdown,
            join_handle,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                recv = self.socket.recv() => match recv {
                    Ok(multipart) => self.handle(multipart).await,
                    Err(e) => {
                        error!("ZMQ recv error: {}", e);
                        break;
                    }
                },
            }
        }
        self.stop_hosts().await;
        info!("Plugin launcher stopped");
        Ok(())
    }

    async fn handle(&mut self, multipart: zeromq::ZmqMessage) {
        let routed = match RoutedMessage::parse(multipart) {
            Ok(routed) => routed,
            Err(e) => {
                warn!("Failed to unpack message: {}", e);
                return;
            }
        };
        let corr = routed.message.header.correlation_id;

        let reply = match routed.message.opcode() {
            OpCode::Bootstrap => match routed.message.decode::<BootstrapRequest>() {
                Ok(req) => self.bootstrap(corr, req).await,
                Err(e) => Message::error(corr, "MALFORMED_PAYLOAD", e.to_string()),
            },
            other => Message::error(
                corr,
                "UNSUPPORTED_OPCODE",
                format!("{:?} is not accepted by plugin launchers", other),
            ),
        };

        match reply.and_then(|msg| routed.reply(&msg)) {
            Ok(frames) => {
                if let Err(e) = self.socket.send(frames).await {
                    error!("Failed to send reply: {}", e);
                }
            }
            Err(e) => error!("Failed to build reply: {}", e),
        }
    }

    async fn bootstrap(
        &mut self,
        corr: u64,
        req: BootstrapRequest,
    ) -> rawflow_protocol::Result<Message> {
        if req.protocol_version != PLUGIN_PROTOCOL_VERSION {
            warn!(
                version = req.protocol_version,
                "Bootstrap with unsupported protocol version"
            );
            return Message::error(
                corr,
                "UNSUPPORTED_PROTOCOL",
                format!(
                    "Launcher speaks plugin protocol {}, sentinel sent {}",
                    PLUGIN_PROTOCOL_VERSION, req.protocol_version
                ),
            );
        }

        let sentinel_addr = format!("tcp://{}:{}", self.config.sentinel_host, req.orchestrator_port);
        info!(sentinel = %sentinel_addr, "Bootstrap received");
        self.stop_hosts().await;

        let mut failed = Vec::new();
        for plugin in &self.plugins {
            let config = PluginHostConfig {
                sentinel_addr: sentinel_addr.clone(),
                ..self.config.host.clone()
            };
            match PluginHost::bind(config, plugin.clone()).await {
                Ok(host) => self.hosts.push(host.spawn()),
                Err(e) => {
                    error!(plugin = %plugin.name, "Failed to start plugin host: {:#}", e);
                    failed.push(plugin.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Message::error(
                corr,
                "LAUNCH_FAILED",
                format!("Failed to start plugin hosts: {}", failed.join(", ")),
            );
        }
        Message::json(
            OpCode::Ack,
            corr,
            &AckPayload::with_message(format!("launched {} plugins", self.hosts.len())),
        )
    }

    async fn stop_hosts(&mut self) {
        for host in self.hosts.drain(..) {
            let endpoint = host.endpoint().to_string();
            if let Err(e) = host.shutdown().await {
                warn!(endpoint = %endpoint, "Plugin host stopped with error: {:#}", e);
            }
        }
    }
}
