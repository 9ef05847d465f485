//! Newline-delimited JSON over TCP. One task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Open connections are closed
    /// at their next read.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let handler = self.handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, peer, handler, shutdown).await {
                                debug!(%peer, error = %e, "Connection error");
                            }
                            debug!(%peer, "Client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = shutdown.cancelled() => break,
        };
        if read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(reason) = request.validate() {
                    warn!(%peer, error = reason, "Invalid request");
                    let id = request.id.clone().unwrap_or(serde_json::Value::Null);
                    Response::invalid_request(id, reason)
                } else if request.is_notification() {
                    debug!(%peer, method = %request.method, "Notification received");
                    handler.handle(request).await;
                    continue;
                } else {
                    handler.handle(request).await
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }

    Ok(())
}
