//! CONNECT tunnel splicing
//!
//! Handles bidirectional data transfer between client and backend.

use std::sync::Arc;

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::InstanceKey;
use crate::proxy::rotation::ConnectionTracker;

/// Splices client and backend streams
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data bidirectionally between two streams until both sides close
    #[instrument(skip(client, server))]
    pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let client_to_server = async {
            let result = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            result
        };

        let server_to_client = async {
            let result = tokio::io::copy(&mut server_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        };

        let (client_to_server_result, server_to_client_result) =
            tokio::join!(client_to_server, server_to_client);

        let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
            debug!("Client to backend copy ended: {}", e);
            0
        });

        let bytes_received = server_to_client_result.unwrap_or_else(|e| {
            debug!("Backend to client copy ended: {}", e);
            0
        });

        debug!(
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "Tunnel closed"
        );

        Ok((bytes_sent, bytes_received))
    }

    /// Splice an upgraded client connection onto an established backend tunnel
    #[instrument(skip(upgraded, backend, _guard), fields(instance = %_guard.key()))]
    pub async fn handle_upgraded(
        upgraded: Upgraded,
        backend: TcpStream,
        _guard: TunnelGuard,
    ) -> Result<(u64, u64)> {
        // Wrap Upgraded with TokioIo to get tokio AsyncRead/AsyncWrite traits
        let client = TokioIo::new(upgraded);
        Self::copy_bidirectional(client, backend).await
    }
}

/// Counts one in-flight connection against a backend for as long as it lives
pub struct TunnelGuard {
    key: InstanceKey,
    tracker: Arc<ConnectionTracker>,
}

impl TunnelGuard {
    pub fn new(key: InstanceKey, tracker: Arc<ConnectionTracker>) -> Self {
        tracker.acquire(key);
        Self { key, tracker }
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.tracker.release(self.key);
    }
}
