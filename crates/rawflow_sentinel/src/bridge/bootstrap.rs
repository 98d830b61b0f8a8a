//! Reverse handshake towards plugin launchers.
//!
//! At startup the sentinel tells each configured launcher which port its
//! plugin endpoint listens on; launchers then register back. Failures are
//! logged and otherwise ignored so local plugins keep being served.

use rawflow_protocol::transport;
use rawflow_protocol::{
    AckPayload, BootstrapRequest, Message, OpCode, ProtocolError, PLUGIN_PROTOCOL_VERSION,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::METRICS;

/// Send one `Bootstrap` request and wait for the launcher's `Ack`.
pub async fn bootstrap_launcher(
    launcher: &str,
    orchestrator_port: u16,
    timeout: Duration,
) -> Result<AckPayload, ProtocolError> {
    let request = BootstrapRequest {
        orchestrator_port,
        protocol_version: PLUGIN_PROTOCOL_VERSION,
    };
    let msg = Message::json(OpCode::Bootstrap, 0, &request)?;
    let reply = transport::request_expecting(launcher, &msg, OpCode::Ack, timeout).await?;
    reply.decode()
}

/// Dial every launcher concurrently. The returned handle resolves to the
/// number of launchers that acknowledged.
pub fn spawn_bootstrap(
    launchers: Vec<String>,
    orchestrator_port: u16,
    timeout: Duration,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut attempts = tokio::task::JoinSet::new();
        for launcher in launchers {
            attempts.spawn(async move {
                let result = bootstrap_launcher(&launcher, orchestrator_port, timeout).await;
                (launcher, result)
            });
        }

        let mut acknowledged = 0;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((launcher, Ok(ack))) => {
                    acknowledged += 1;
                    info!(
                        launcher = %launcher,
                        message = ack.message.as_deref().unwrap_or(""),
                        "Plugin launcher bootstrapped"
                    );
                }
                Ok((launcher, Err(err))) => {
                    METRICS.inc_bootstrap_failures();
                    warn!(launcher = %launcher, error = %err, "Plugin launcher bootstrap failed");
                }
                Err(join_err) => {
                    METRICS.inc_bootstrap_failures();
                    warn!(error = %join_err, "Bootstrap task aborted");
                }
            }
        }
        acknowledged
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_launchers_are_not_fatal() {
        let handle = spawn_bootstrap(
            vec!["tcp://127.0.0.1:1".to_string(), "tcp://127.0.0.1:2".to_string()],
            5555,
            Duration::from_millis(200),
        );
        assert_eq!(handle.await.unwrap(), 0);
    }
}
