use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::LlrpError;
use crate::proto::{self, MSG_KEEPALIVE, MSG_KEEPALIVE_ACK, MSG_READER_EVENT_NOTIFICATION};

/// A decoded LLRP frame.
#[derive(Debug, Clone)]
pub struct LlrpMessage {
    pub msg_type: u16,
    pub msg_id: u32,
    pub payload: Bytes,
}

/// Async LLRP connection to one reader.
///
/// The client is deliberately thin: framing, a request/response helper,
/// and keepalive acks. Session policy (what to configure, when to give
/// up) lives in the adapter.
pub struct LlrpClient {
    stream: TcpStream,
    next_id: u32,
}

impl std::fmt::Debug for LlrpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlrpClient")
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl LlrpClient {
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, LlrpError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LlrpError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        debug!(%addr, "LLRP transport connected");
        Ok(Self { stream, next_id: 1 })
    }

    pub async fn send(&mut self, msg_type: u16, payload: &[u8]) -> Result<u32, LlrpError> {
        let msg_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let frame = proto::encode_message(msg_type, msg_id, payload);
        self.stream.write_all(&frame).await?;
        Ok(msg_id)
    }

    /// Read the next frame off the wire. Blocks until one arrives.
    pub async fn recv(&mut self) -> Result<LlrpMessage, LlrpError> {
        let mut raw_header = [0u8; 10];
        self.stream.read_exact(&mut raw_header).await?;
        let header = proto::decode_header(&raw_header)?;

        let mut payload = vec![0u8; header.msg_len as usize - 10];
        self.stream.read_exact(&mut payload).await?;

        Ok(LlrpMessage {
            msg_type: header.msg_type,
            msg_id: header.msg_id,
            payload: payload.into(),
        })
    }

    /// Send a request and wait for its response type, verifying the
    /// embedded LLRPStatus. Event notifications are skipped and
    /// keepalives acked while waiting.
    pub async fn transact(
        &mut self,
        msg_type: u16,
        payload: &[u8],
        expected_response: u16,
    ) -> Result<LlrpMessage, LlrpError> {
        self.send(msg_type, payload).await?;

        loop {
            let message = self.recv().await?;
            match message.msg_type {
                t if t == expected_response => {
                    proto::check_status(&message.payload)?;
                    return Ok(message);
                }
                MSG_KEEPALIVE => {
                    self.send(MSG_KEEPALIVE_ACK, &[]).await?;
                }
                MSG_READER_EVENT_NOTIFICATION => {
                    debug!("skipping reader event notification during transact");
                }
                other => {
                    return Err(LlrpError::UnexpectedMessage {
                        expected: expected_response,
                        got: other,
                    });
                }
            }
        }
    }

    /// Best-effort orderly close.
    pub async fn close(mut self) {
        let _ = self.send(proto::MSG_CLOSE_CONNECTION, &[]).await;
        let _ = self.stream.shutdown().await;
    }
}
