//! TCP Listener

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use super::handler::handle_connection;
use super::TcpSessionHandler;

/// Accept loop of the binary protocol
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<TcpSessionHandler>,
    max_frame_size: usize,
}

impl TcpServer {
    pub async fn bind(
        addr: &str,
        handler: Arc<TcpSessionHandler>,
        max_frame_size: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("TCP listener stopped accepting");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(handle_connection(
                                stream,
                                remote_addr,
                                handler,
                                self.max_frame_size,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept TCP connection");
                        }
                    }
                }
            }
        }
    }
}
