//! JSON-RPC 2.0 control surface for the daemon.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: dispatch onto the job queue and the remote session
//! - `client`: used by the CLI subcommands

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{ErrorCode, Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port (see [`RpcServer::local_addr`]).
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(ctx)).await?;
        Ok(Self {
            transport,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
