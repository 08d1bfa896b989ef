//! Backend transport
//!
//! Fleet instances are plain HTTP forward proxies. This module dials them,
//! opens CONNECT tunnels through them and parses client targets.

use std::time::Duration;

use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{FleetError, Result};

/// Largest CONNECT response head accepted from a backend
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Connections to fleet backends
pub struct BackendTransport;

impl BackendTransport {
    /// Open a TCP connection to a backend within `connect_timeout`
    #[instrument]
    pub async fn dial(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                FleetError::BackendConnectFailure(format!("connect to {} timed out", address))
            })?
            .map_err(|e| {
                FleetError::BackendConnectFailure(format!("connect to {} failed: {}", address, e))
            })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Dial a backend and ask it to tunnel to `target_host:target_port`
    ///
    /// Returns the stream positioned right after the backend's `200` response.
    #[instrument]
    pub async fn connect_tunnel(
        address: &str,
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
    ) -> Result<TcpStream> {
        let mut stream = Self::dial(address, connect_timeout).await?;

        let request = Self::build_connect_request(target_host, target_port);
        let handshake = async {
            stream.write_all(request.as_bytes()).await?;
            Self::read_response_head(&mut stream).await
        };
        let head = tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                FleetError::BackendConnectFailure(format!("CONNECT via {} timed out", address))
            })?
            .map_err(|e| {
                FleetError::BackendConnectFailure(format!("CONNECT via {} failed: {}", address, e))
            })?;

        let status_line = head.lines().next().unwrap_or_default();
        if !is_success_status(status_line) {
            return Err(FleetError::BackendConnectFailure(format!(
                "CONNECT via {} refused: {}",
                address, status_line
            )));
        }

        debug!("CONNECT tunnel established");
        Ok(stream)
    }

    fn build_connect_request(target_host: &str, target_port: u16) -> String {
        format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = target_host,
            port = target_port
        )
    }

    /// Read byte-by-byte up to the blank line so no tunneled payload is consumed
    async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<String> {
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "backend closed during CONNECT",
                ));
            }
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                return Ok(String::from_utf8_lossy(&head).into_owned());
            }
            if head.len() > MAX_RESPONSE_HEAD {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "CONNECT response head too large",
                ));
            }
        }
    }

    /// Parse host and port from an absolute URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| FleetError::InvalidRequest("Missing host in URI".to_string()))?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Parse host and port from authority (for CONNECT requests)
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        if authority.is_empty() {
            return Err(FleetError::InvalidRequest("Empty CONNECT authority".to_string()));
        }
        if let Some((host, port_str)) = authority.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| FleetError::InvalidRequest("Invalid port".to_string()))?;
            Ok((host.to_string(), port))
        } else {
            // Default to port 443 for CONNECT (typically HTTPS)
            Ok((authority.to_string(), 443))
        }
    }
}

fn is_success_status(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") && code.starts_with('2')
    )
}
