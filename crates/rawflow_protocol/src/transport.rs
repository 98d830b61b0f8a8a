//! ZeroMQ glue shared by the sentinel and plugin hosts.
//!
//! Two patterns are used on the wire:
//! - One-shot REQ round trips ([`request`]): a fresh REQ socket per call, so a
//!   timed-out exchange never leaves a socket stuck mid-conversation.
//! - ROUTER servers ([`RoutedMessage`]): requests arrive as
//!   `[identity, (empty delimiter), header, payload]`; the reply must carry
//!   the same envelope back.

use std::time::Duration;

use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::error::{ProtocolError, Result};
use crate::{ErrorPayload, Message, OpCode};

/// Convert a protocol message into ZMQ frames `[header, payload]`.
pub fn to_frames(msg: &Message) -> Result<ZmqMessage> {
    let (header, body) = msg.pack()?;
    let mut multipart = ZmqMessage::from(header);
    multipart.push_back(body.into());
    Ok(multipart)
}

/// Convert received ZMQ frames `[header, payload]` into a protocol message.
pub fn from_frames(multipart: ZmqMessage) -> Result<Message> {
    let parts: Vec<Vec<u8>> = multipart
        .into_vec()
        .into_iter()
        .map(|b| b.to_vec())
        .collect();
    Message::unpack(&parts)
}

/// Send one message over a fresh REQ socket and wait for the reply.
///
/// Connection, send and receive all share the same deadline.
pub async fn request(endpoint: &str, msg: &Message, timeout: Duration) -> Result<Message> {
    let exchange = async {
        let mut socket = ReqSocket::new();
        socket.connect(endpoint).await?;
        socket.send(to_frames(msg)?).await?;
        let reply = socket.recv().await?;
        from_frames(reply)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout(timeout)),
    }
}

/// Like [`request`], but converts an `Err` reply into [`ProtocolError::Rejected`]
/// and checks the reply opcode.
pub async fn request_expecting(
    endpoint: &str,
    msg: &Message,
    expected: OpCode,
    timeout: Duration,
) -> Result<Message> {
    let reply = request(endpoint, msg, timeout).await?;
    match reply.opcode() {
        op if op == expected => Ok(reply),
        OpCode::Err => {
            let err: ErrorPayload = reply.decode()?;
            Err(ProtocolError::Rejected {
                code: err.code,
                message: err.message,
            })
        }
        other => Err(ProtocolError::UnexpectedReply {
            expected: opcode_name(expected),
            got: other,
        }),
    }
}

fn opcode_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Ack => "ACK",
        OpCode::Conclude => "CONCLUDE",
        OpCode::Register => "REGISTER",
        OpCode::Unregister => "UNREGISTER",
        OpCode::Heartbeat => "HEARTBEAT",
        OpCode::Invoke => "INVOKE",
        OpCode::Bootstrap => "BOOTSTRAP",
        OpCode::Err => "ERR",
        OpCode::Unknown => "UNKNOWN",
    }
}

/// A request received on a ROUTER socket, with its routing envelope.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    identity: Vec<u8>,
    delimited: bool,
    pub message: Message,
}

impl RoutedMessage {
    /// Parse `[identity, header, payload]` (DEALER peers) or
    /// `[identity, "", header, payload]` (REQ peers).
    pub fn parse(multipart: ZmqMessage) -> Result<Self> {
        let mut parts: Vec<Vec<u8>> = multipart
            .into_vec()
            .into_iter()
            .map(|b| b.to_vec())
            .collect();

        let delimited = match parts.len() {
            3 => false,
            4 if parts[1].is_empty() => true,
            count => {
                return Err(ProtocolError::InvalidFrameCount {
                    expected: 3,
                    got: count,
                })
            }
        };

        let identity = parts.remove(0);
        if delimited {
            parts.remove(0);
        }
        let message = Message::unpack(&parts)?;
        Ok(Self {
            identity,
            delimited,
            message,
        })
    }

    /// Build the reply frames routed back to the sender.
    pub fn reply(&self, msg: &Message) -> Result<ZmqMessage> {
        let (header, body) = msg.pack()?;
        let mut multipart = ZmqMessage::from(self.identity.clone());
        if self.delimited {
            multipart.push_back(Vec::<u8>::new().into());
        }
        multipart.push_back(header.into());
        multipart.push_back(body.into());
        Ok(multipart)
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }
}

/// Extract the TCP port from a bound endpoint string such as `tcp://127.0.0.1:5555`.
pub fn endpoint_port(endpoint: &str) -> Option<u16> {
    if !endpoint.starts_with("tcp://") {
        return None;
    }
    endpoint.rsplit(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_parses_tcp() {
        assert_eq!(endpoint_port("tcp://127.0.0.1:5555"), Some(5555));
        assert_eq!(endpoint_port("tcp://0.0.0.0:0"), Some(0));
        assert_eq!(endpoint_port("ipc:///tmp/rawflow.sock"), None);
    }

    #[test]
    fn routed_message_keeps_req_delimiter() {
        let msg = Message::new(OpCode::Heartbeat, 9, b"{}".to_vec()).unwrap();
        let (header, body) = msg.pack().unwrap();
        let mut incoming = ZmqMessage::from(b"peer-1".to_vec());
        incoming.push_back(Vec::<u8>::new().into());
        incoming.push_back(header.into());
        incoming.push_back(body.into());

        let routed = RoutedMessage::parse(incoming).unwrap();
        assert_eq!(routed.identity(), b"peer-1");
        assert_eq!(routed.message.header.correlation_id, 9);

        let ack = Message::new(OpCode::Ack, 9, b"{}".to_vec()).unwrap();
        let reply = routed.reply(&ack).unwrap();
        assert_eq!(reply.len(), 4);
        assert!(reply.get(1).unwrap().is_empty());
    }

    #[test]
    fn routed_message_rejects_short_envelope() {
        let incoming = ZmqMessage::from(b"peer-1".to_vec());
        assert!(matches!(
            RoutedMessage::parse(incoming),
            Err(ProtocolError::InvalidFrameCount { .. })
        ));
    }
}
