//! End-to-end: sentinel, control client and real plugin hosts over loopback TCP.

use async_trait::async_trait;
use rawflow_collector::{
    CancellationToken, CollectError, PluginDefinition, SubTask, SubTaskContext, SubTaskMeta,
};
use rawflow_db::{RawflowDb, MIGRATIONS};
use rawflow_plugin::{
    LauncherConfig, PluginHost, PluginHostConfig, PluginHostHandle, PluginLauncher,
};
use rawflow_protocol::transport;
use rawflow_protocol::{
    CollectErrorKind, Message, OpCode, PluginRegistration, ProtocolError, SubTaskStatus, TaskInfo,
    PLUGIN_PROTOCOL_VERSION,
};
use rawflow_sentinel::{
    Bridge, ControlClient, ControlRequest, ControlResponse, GateState, PluginInfo, PluginLocation,
    Sentinel, SentinelConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

struct Echo;

#[async_trait]
impl SubTask for Echo {
    async fn run(&self, ctx: &SubTaskContext) -> rawflow_collector::Result<()> {
        if ctx.options()["fail"] == true {
            return Err(CollectError::UpstreamUnavailable("tapd returned 503".to_string()));
        }
        Ok(())
    }
}

fn plugin(name: &str) -> PluginDefinition {
    PluginDefinition::new(name)
        .with_subtask(SubTaskMeta::new("collectWorklogs", Arc::new(Echo)))
        .with_subtask(SubTaskMeta::new("extractWorklogs", Arc::new(Echo)))
}

struct Running {
    client: ControlClient,
    control_addr: String,
    plugin_endpoint: Option<String>,
    bridge: Arc<Bridge>,
    shutdown: CancellationToken,
    join: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.join.await.unwrap().unwrap();
    }
}

fn config(dir: &TempDir) -> SentinelConfig {
    let mut config = SentinelConfig::new(dir.path().join("rawflow.sqlite3"));
    config.control_addr = "tcp://127.0.0.1:0".to_string();
    config.plugin_addr = "tcp://127.0.0.1:0".to_string();
    config.enable_remote_plugins = true;
    config.invoke_timeout = Duration::from_secs(2);
    config
}

async fn start(dir: TempDir, config: SentinelConfig, local: Vec<PluginDefinition>) -> Running {
    let sentinel = Sentinel::bind(config, local).await.unwrap();
    let control_addr = sentinel.control_endpoint().to_string();
    let client = ControlClient::new(control_addr.clone()).with_timeout(Duration::from_secs(5));
    let plugin_endpoint = sentinel.plugin_endpoint().map(str::to_string);
    let bridge = sentinel.bridge();
    let shutdown = sentinel.shutdown_token();
    let join = tokio::spawn(sentinel.run());
    Running {
        client,
        control_addr,
        plugin_endpoint,
        bridge,
        shutdown,
        join,
        _dir: dir,
    }
}

async fn host(sentinel_addr: &str, heartbeat: Duration) -> PluginHostHandle {
    let config = PluginHostConfig {
        heartbeat_interval: heartbeat,
        request_timeout: Duration::from_secs(2),
        ..PluginHostConfig::new(sentinel_addr)
    };
    PluginHost::bind(config, plugin("tapd")).await.unwrap().spawn()
}

/// Send bytes that need not be a valid request.
async fn raw_control(addr: &str, body: &[u8]) -> ControlResponse {
    let mut socket = ReqSocket::new();
    socket.connect(addr).await.unwrap();
    socket.send(ZmqMessage::from(body.to_vec())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.recv())
        .await
        .unwrap()
        .unwrap();
    let frames = reply.into_vec();
    serde_json::from_slice(frames.last().unwrap()).unwrap()
}

fn error_code(resp: ControlResponse) -> (String, Option<u16>) {
    match resp {
        ControlResponse::Error { code, status, .. } => (code, status),
        other => panic!("expected an error response, got {:?}", other),
    }
}

/// Poll ListPlugins until `accept` matches an entry for `name`.
async fn wait_for_plugin(
    client: &ControlClient,
    name: &str,
    accept: impl Fn(&PluginInfo) -> bool,
) -> PluginInfo {
    for _ in 0..50 {
        let plugins = client.list_plugins().await.unwrap();
        if let Some(info) = plugins.into_iter().find(|p| p.name == name && accept(p)) {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("plugin '{}' never showed up", name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_blocks_until_confirmed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rawflow.sqlite3");
    {
        let db = RawflowDb::open(&path).await.unwrap();
        db.apply_migrations(&MIGRATIONS[..1]).await.unwrap();
        db.close().await;
    }

    let config = config(&dir);
    assert_eq!(config.database_path, path);
    let running = start(dir, config, Vec::new()).await;
    let client = &running.client;

    match client.request(&ControlRequest::Ping).await.unwrap() {
        ControlResponse::Error {
            code,
            status,
            message,
        } => {
            assert_eq!(code, "MIGRATION_REQUIRED");
            assert_eq!(status, Some(428));
            assert!(message.contains("may wipe collected data"));
        }
        other => panic!("expected gate rejection, got {:?}", other),
    }
    let err = client.migration_status().await.unwrap_err();
    assert!(err.to_string().contains("MIGRATION_REQUIRED"));

    // Unparseable requests are not confirmations either.
    let (code, status) = error_code(raw_control(&running.control_addr, b"not json").await);
    assert_eq!(code, "MIGRATION_REQUIRED");
    assert_eq!(status, Some(428));

    let reg = PluginRegistration {
        plugin_name: "tapd".to_string(),
        endpoint: "tcp://127.0.0.1:7001".to_string(),
        subtasks: Vec::new(),
        protocol_version: PLUGIN_PROTOCOL_VERSION,
    };
    let msg = Message::json(OpCode::Register, 1, &reg).unwrap();
    let plugin_endpoint = running.plugin_endpoint.clone().unwrap();
    match transport::request_expecting(&plugin_endpoint, &msg, OpCode::Ack, Duration::from_secs(5))
        .await
    {
        Err(ProtocolError::Rejected { code, .. }) => assert_eq!(code, "MIGRATION_REQUIRED"),
        other => panic!("expected gate rejection, got {:?}", other),
    }

    let applied = client.confirm_migration().await.unwrap();
    assert_eq!(
        applied,
        vec!["collector_state_time_after", "create_raw_table_registry"]
    );
    assert!(client.ping().await.unwrap());
    let status = client.migration_status().await.unwrap();
    assert_eq!(status.state, GateState::Clear);
    assert!(status.pending.is_empty());

    // A second confirmation is a no-op
    assert!(client.confirm_migration().await.unwrap().is_empty());

    let (code, status) = error_code(raw_control(&running.control_addr, b"not json").await);
    assert_eq!(code, "PARSE_ERROR");
    assert_eq!(status, None);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_database_serves_immediately() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let running = start(dir, config, vec![plugin("gitlab")]).await;

    let status = running.client.migration_status().await.unwrap();
    assert_eq!(status.state, GateState::Clear);

    let plugins = running.client.list_plugins().await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].location, PluginLocation::Local);

    let reports = running
        .client
        .run_plugin("gitlab", TaskInfo::new("t-1", "gitlab"))
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status == SubTaskStatus::Completed));

    let failing = TaskInfo::new("t-2", "gitlab").with_options(serde_json::json!({"fail": true}));
    let reports = running.client.run_plugin("gitlab", failing).await.unwrap();
    assert_eq!(reports.len(), 1, "whole-plugin run stops at the first failure");
    let error = reports[0].error.as_ref().unwrap();
    assert_eq!(error.kind, CollectErrorKind::UpstreamUnavailable);

    assert_eq!(running.client.get_checkpoint("missing").await.unwrap(), None);
    assert!(running
        .client
        .list_checkpoints("gitlab", "1")
        .await
        .unwrap()
        .is_empty());

    let err = running.client.run_plugin("jira", TaskInfo::new("t-3", "jira")).await;
    assert!(err.unwrap_err().to_string().contains("UNKNOWN_PLUGIN"));

    let metrics = running.client.metrics().await.unwrap();
    assert!(metrics.contains("rawflow_control_requests_total"));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_plugin_register_and_run() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let running = start(dir, config, Vec::new()).await;
    let plugin_endpoint = running.plugin_endpoint.clone().unwrap();
    let client = &running.client;

    let handle = host(&plugin_endpoint, Duration::from_millis(200)).await;
    let info = wait_for_plugin(client, "tapd", |_| true).await;
    assert_eq!(info.location, PluginLocation::Remote);
    assert_eq!(info.endpoint.as_deref(), Some(handle.endpoint()));
    assert_eq!(info.subtasks.len(), 2);

    let report = client
        .run_subtask("tapd", "collectWorklogs", TaskInfo::new("t-1", "tapd"))
        .await
        .unwrap();
    assert_eq!(report.status, SubTaskStatus::Completed);
    assert_eq!(report.plugin_name, "tapd");

    let failing = TaskInfo::new("t-2", "tapd").with_options(serde_json::json!({"fail": true}));
    let report = client
        .run_subtask("tapd", "collectWorklogs", failing)
        .await
        .unwrap();
    assert_eq!(report.status, SubTaskStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, CollectErrorKind::UpstreamUnavailable);
    assert!(error.message.contains("503"));

    // Direct bridge calls surface the plugin's own error kind
    running
        .bridge
        .invoke("tapd", "extractWorklogs", &TaskInfo::new("t-5", "tapd"))
        .await
        .unwrap();
    let failing = TaskInfo::new("t-6", "tapd").with_options(serde_json::json!({"fail": true}));
    let err = running
        .bridge
        .invoke("tapd", "collectWorklogs", &failing)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), CollectErrorKind::UpstreamUnavailable);

    let reports = client
        .run_plugin("tapd", TaskInfo::new("t-3", "tapd"))
        .await
        .unwrap();
    let names: Vec<_> = reports.iter().map(|r| r.subtask.as_str()).collect();
    assert_eq!(names, vec!["collectWorklogs", "extractWorklogs"]);

    let err = client
        .run_subtask("tapd", "collectBugs", TaskInfo::new("t-4", "tapd"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("UNKNOWN_SUBTASK"));

    handle.shutdown().await.unwrap();
    for _ in 0..50 {
        if client.list_plugins().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(client.list_plugins().await.unwrap().is_empty());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reregistration_replaces_endpoint() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let running = start(dir, config, Vec::new()).await;
    let plugin_endpoint = running.plugin_endpoint.clone().unwrap();
    let client = &running.client;

    // Long interval: the first host never heartbeats during the test
    let first = host(&plugin_endpoint, Duration::from_secs(60)).await;
    let first_endpoint = first.endpoint().to_string();
    wait_for_plugin(client, "tapd", |p| p.endpoint.as_deref() == Some(&first_endpoint)).await;

    let second = host(&plugin_endpoint, Duration::from_secs(60)).await;
    let second_endpoint = second.endpoint().to_string();
    wait_for_plugin(client, "tapd", |p| p.endpoint.as_deref() == Some(&second_endpoint)).await;

    // The stale host unregisters its own endpoint only
    first.shutdown().await.unwrap();
    let plugins = client.list_plugins().await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].endpoint.as_deref(), Some(second_endpoint.as_str()));

    second.shutdown().await.unwrap();
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_plugin_reports_bridge_unavailable() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.invoke_timeout = Duration::from_millis(500);
    let running = start(dir, config, Vec::new()).await;
    let plugin_endpoint = running.plugin_endpoint.clone().unwrap();

    let handle = host(&plugin_endpoint, Duration::from_secs(60)).await;
    wait_for_plugin(&running.client, "tapd", |_| true).await;
    handle.abort();

    let report = running
        .client
        .run_subtask("tapd", "collectWorklogs", TaskInfo::new("t-1", "tapd"))
        .await
        .unwrap();
    assert_eq!(report.status, SubTaskStatus::Failed);
    assert_eq!(report.error.unwrap().kind, CollectErrorKind::BridgeUnavailable);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bootstrap_launches_remote_plugins() {
    let mut launcher_config = LauncherConfig::new("tcp://127.0.0.1:0");
    launcher_config.host.heartbeat_interval = Duration::from_millis(200);
    let launcher = PluginLauncher::bind(launcher_config, vec![plugin("tapd")])
        .await
        .unwrap()
        .spawn();

    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.plugin_launchers = vec![launcher.endpoint().to_string()];
    let running = start(dir, config, Vec::new()).await;

    let info = wait_for_plugin(&running.client, "tapd", |_| true).await;
    assert_eq!(info.location, PluginLocation::Remote);

    let report = running
        .client
        .run_subtask("tapd", "extractWorklogs", TaskInfo::new("t-1", "tapd"))
        .await
        .unwrap();
    assert_eq!(report.status, SubTaskStatus::Completed);

    launcher.shutdown().await.unwrap();
    running.stop().await;
}
