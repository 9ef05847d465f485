//! Client used by the CLI to talk to a running daemon.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),

    #[error("communication error: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("daemon closed the connection without answering")]
    NoResponse,

    #[error("{} (code {})", .0.message, .0.code)]
    Rpc(RpcError),
}

/// One connection per call.
pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;

        let request = Request::new(method, params, self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut encoded = serde_json::to_string(&request).map_err(ClientError::Encode)?;
        encoded.push('\n');
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.map_err(ClientError::Io)?;
        if read == 0 {
            return Err(ClientError::NoResponse);
        }

        let response: Response = serde_json::from_str(&line).map_err(ClientError::Decode)?;
        let result = response.into_result().map_err(ClientError::Rpc)?;
        serde_json::from_value(result).map_err(ClientError::Decode)
    }

    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }
}
